//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "SDP message grammar, multipart assembly and signing."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use indexmap::IndexMap;
use tracing::warn;

use crate::error::{DecodeError, EncodeError, FieldError, MultipartError};
use crate::field::{FieldInput, FieldValue, ID_FIELD, SIGNATURE_FIELD, TIMEBASE_FIELD};

/// Sequence number and optional timestamp carried by an `in` field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBase {
    /// Monotonically increasing per-nonce sequence number.
    pub seq: u64,
    /// Unix timestamp (fractional seconds) the device stamped the update
    /// with, when present.
    pub timestamp: Option<f64>,
}

/// One SDP datagram in memory: an owning `id`, insertion-ordered fields and
/// optionally a sequence of multipart pieces.
///
/// A piece is itself an [`SdpMessage`] restricted to carrying no `id` and no
/// pieces of its own; it inherits the parent's id on encode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpMessage {
    id: Option<String>,
    fields: IndexMap<String, FieldValue>,
    pieces: Vec<SdpMessage>,
}

impl SdpMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty message owned by `id`.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Owning device id, if set.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Set the owning device id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Add a field, validating the value against the type its name demands.
    ///
    /// `id` sets the owning device id; `sha256` is reserved; a message that
    /// already owns multipart pieces accepts no further data fields.
    pub fn add(&mut self, name: &str, value: impl Into<FieldInput>) -> Result<(), FieldError> {
        let input = value.into();
        if name == ID_FIELD {
            let FieldInput::Text(text) = input else {
                return Err(FieldError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "string",
                });
            };
            self.id = Some(text);
            return Ok(());
        }
        if name == SIGNATURE_FIELD {
            return Err(FieldError::Reserved(name.to_owned()));
        }
        if !self.pieces.is_empty() {
            return Err(FieldError::MultipartPlacement(name.to_owned()));
        }
        let value = FieldValue::for_name(name, input)?;
        self.fields.insert(name.to_owned(), value);
        Ok(())
    }

    /// Typed value of a field, or `None` when absent.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Remove a field. Removing `id` clears the owning device id.
    pub fn remove(&mut self, name: &str) -> Result<(), FieldError> {
        if name == ID_FIELD {
            self.id = None;
            return Ok(());
        }
        self.fields
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| FieldError::NotFound(name.to_owned()))
    }

    /// Iterate the message's own fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of the message's own fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Whether this message owns multipart pieces.
    pub fn is_multipart(&self) -> bool {
        !self.pieces.is_empty()
    }

    /// The attached multipart pieces in order.
    pub fn pieces(&self) -> &[SdpMessage] {
        &self.pieces
    }

    /// Iterate the logical units of this message: the pieces of a multipart
    /// message, or the message itself when flat.
    pub fn units(&self) -> Units<'_> {
        if self.pieces.is_empty() {
            Units::Flat(std::iter::once(self))
        } else {
            Units::Pieces(self.pieces.iter())
        }
    }

    /// Parse the `in` field of this message (not of its pieces).
    ///
    /// Returns `None` when the field is absent or malformed; a malformed
    /// time base never carries a usable sequence number.
    pub fn time_base(&self) -> Option<TimeBase> {
        match self.fields.get(TIMEBASE_FIELD) {
            Some(FieldValue::Data(raw)) => parse_time_base(raw),
            _ => None,
        }
    }

    /// Attach a multipart piece.
    ///
    /// The piece must be flat, carry an `in` field with a timestamp strictly
    /// greater than the previous piece's, and must not name a different id
    /// than the parent. Its own `id` is stripped on success. The parent must
    /// not carry an `in` field itself.
    pub fn push_piece(&mut self, mut piece: SdpMessage) -> Result<(), MultipartError> {
        if !piece.pieces.is_empty() {
            return Err(MultipartError::Nested);
        }
        if self.fields.contains_key(TIMEBASE_FIELD) {
            return Err(MultipartError::ParentHasTimeBase);
        }
        let candidate = match piece.time_base() {
            Some(TimeBase {
                timestamp: Some(ts),
                ..
            }) => ts,
            _ => return Err(MultipartError::MissingTimestamp),
        };
        if let Some(last) = self.pieces.last() {
            let previous = last
                .time_base()
                .and_then(|tb| tb.timestamp)
                .unwrap_or_default();
            if candidate <= previous {
                return Err(MultipartError::NonMonotonic {
                    previous,
                    candidate,
                });
            }
        }
        if let Some(piece_id) = piece.id.take() {
            if self.id.as_deref() != Some(piece_id.as_str()) {
                return Err(MultipartError::IdMismatch {
                    parent: self.id.clone().unwrap_or_default(),
                    piece: piece_id,
                });
            }
        }
        self.pieces.push(piece);
        Ok(())
    }

    /// Detach a previously attached piece.
    pub fn remove_piece(&mut self, piece: &SdpMessage) -> Result<SdpMessage, MultipartError> {
        match self.pieces.iter().position(|p| p == piece) {
            Some(index) => Ok(self.pieces.remove(index)),
            None => Err(MultipartError::PieceNotFound),
        }
    }

    /// Encode to the newline-terminated datagram text using the message's
    /// own id.
    pub fn encode(&self) -> Result<String, EncodeError> {
        self.encode_with_id(None)
    }

    /// Encode, optionally overriding the `id` line.
    ///
    /// Order: `id` first; a flat message emits `in` next when present, then
    /// the remaining fields in insertion order; a multipart parent emits any
    /// own fields and then each piece as its `in` line followed by that
    /// piece's fields.
    pub fn encode_with_id(&self, id_override: Option<&str>) -> Result<String, EncodeError> {
        let id = id_override
            .or(self.id.as_deref())
            .ok_or(EncodeError::MissingId)?;
        let mut out = String::new();
        push_line(&mut out, ID_FIELD, id);
        self.encode_fields_into(&mut out);
        for piece in &self.pieces {
            piece.encode_fields_into(&mut out);
        }
        Ok(out)
    }

    fn encode_fields_into(&self, out: &mut String) {
        if let Some(time_base) = self.fields.get(TIMEBASE_FIELD) {
            push_line(out, TIMEBASE_FIELD, &time_base.wire_value());
        }
        for (name, value) in &self.fields {
            if name != TIMEBASE_FIELD {
                push_line(out, name, &value.wire_value());
            }
        }
    }

    /// Decode a datagram.
    ///
    /// `id` must be the first line and must not repeat. Empty lines are
    /// skipped. A repeated `in` line starts a new multipart piece; any other
    /// repeated name within one piece is an error.
    pub fn decode(datagram: &str) -> Result<SdpMessage, DecodeError> {
        let mut lexed = Vec::new();
        for line in datagram.lines() {
            if line.is_empty() {
                warn!("empty line in datagram");
                continue;
            }
            lexed.push(split_line(line)?);
        }

        let mut lines = lexed.into_iter();
        let (first_key, first_value) = lines.next().ok_or(DecodeError::MissingId)?;
        if first_key != ID_FIELD {
            return Err(DecodeError::IdNotFirst(first_key));
        }
        let mut message = SdpMessage::with_id(first_value);

        let mut rest = Vec::new();
        for (key, value) in lines {
            if key == ID_FIELD {
                return Err(DecodeError::DuplicateId);
            }
            rest.push((key, value));
        }

        let time_base_count = rest.iter().filter(|(k, _)| k == TIMEBASE_FIELD).count();
        if time_base_count <= 1 {
            for (key, value) in &rest {
                message.insert_decoded(key, value)?;
            }
            return Ok(message);
        }

        // Multipart: fields before the first `in` stay on the parent, each
        // `in` starts a fresh piece collecting the lines that follow it.
        let mut index = 0;
        while index < rest.len() && rest[index].0 != TIMEBASE_FIELD {
            let (key, value) = &rest[index];
            message.insert_decoded(key, value)?;
            index += 1;
        }
        while index < rest.len() {
            let mut piece = SdpMessage::new();
            let (key, value) = &rest[index];
            piece.insert_decoded(key, value)?;
            index += 1;
            while index < rest.len() && rest[index].0 != TIMEBASE_FIELD {
                let (key, value) = &rest[index];
                piece.insert_decoded(key, value)?;
                index += 1;
            }
            message.push_piece(piece)?;
        }
        Ok(message)
    }

    fn insert_decoded(&mut self, name: &str, raw: &str) -> Result<(), DecodeError> {
        if name == SIGNATURE_FIELD {
            return Err(FieldError::Reserved(name.to_owned()).into());
        }
        if self.fields.contains_key(name) {
            return Err(DecodeError::DuplicateField(name.to_owned()));
        }
        let value = FieldValue::parse_wire(name, raw)?;
        self.fields.insert(name.to_owned(), value);
        Ok(())
    }
}

/// Iterator over the logical units of a message; see [`SdpMessage::units`].
pub enum Units<'a> {
    /// A flat message yields itself once.
    Flat(std::iter::Once<&'a SdpMessage>),
    /// A multipart message yields its pieces.
    Pieces(std::slice::Iter<'a, SdpMessage>),
}

impl<'a> Iterator for Units<'a> {
    type Item = &'a SdpMessage;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Units::Flat(inner) => inner.next(),
            Units::Pieces(inner) => inner.next(),
        }
    }
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push(':');
    out.push_str(value);
    out.push('\n');
}

pub(crate) fn split_line(line: &str) -> Result<(String, String), DecodeError> {
    let Some((key, value)) = line.split_once(':') else {
        return Err(DecodeError::MissingColon(line.to_owned()));
    };
    if value.contains(':') {
        return Err(DecodeError::ColonInValue(value.to_owned()));
    }
    if value.is_empty() {
        return Err(DecodeError::EmptyValue(key.to_owned()));
    }
    Ok((key.to_owned(), value.to_owned()))
}

fn parse_time_base(raw: &str) -> Option<TimeBase> {
    let (seq_part, ts_part) = match raw.split_once(',') {
        None => (raw, None),
        Some((seq, ts)) => (seq, Some(ts)),
    };
    if seq_part.is_empty() || !seq_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seq = seq_part.parse::<u64>().ok()?;
    let timestamp = match ts_part {
        None => None,
        Some(ts) => Some(parse_unsigned_decimal(ts)?),
    };
    Some(TimeBase { seq, timestamp })
}

fn parse_unsigned_decimal(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    let mut seen_dot = false;
    for (index, byte) in text.bytes().enumerate() {
        match byte {
            b'0'..=b'9' => {}
            b'.' if !seen_dot && index > 0 && index < text.len() - 1 => seen_dot = true,
            _ => return None,
        }
    }
    text.parse().ok()
}
