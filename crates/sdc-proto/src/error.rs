//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "SDP message grammar, multipart assembly and signing."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use thiserror::Error;

/// Field-level validation failures raised while building or mutating a
/// message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldError {
    /// A status value outside 0..=3 or not an integer at all.
    #[error("illegal status value: {0}")]
    StatusValue(String),
    /// The supplied value does not match the type the field name demands.
    #[error("field '{name}' requires a {expected} value")]
    TypeMismatch {
        /// Offending field name.
        name: String,
        /// Human-readable expected type.
        expected: &'static str,
    },
    /// A list member that is neither an integer nor `null`.
    #[error("only integers allowed in list of values, got: {0}")]
    ListMember(String),
    /// Empty values are not representable for this field type.
    #[error("field '{0}' does not allow an empty value")]
    EmptyValue(String),
    /// `sha256` is reserved for the signature line.
    #[error("'{0}' is not a valid field name")]
    Reserved(String),
    /// A multipart parent carries only `id`; data lives in its pieces.
    #[error("cannot add field '{0}' to a multipart parent")]
    MultipartPlacement(String),
    /// Removal of a field that is not present.
    #[error("no such field: {0}")]
    NotFound(String),
}

/// Failures while attaching or detaching multipart pieces.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MultipartError {
    /// Pieces cannot own pieces of their own.
    #[error("multipart pieces cannot be nested")]
    Nested,
    /// Only a message without its own `in` field may become a parent.
    #[error("a message carrying its own 'in' field cannot own pieces")]
    ParentHasTimeBase,
    /// Every piece needs an `in` field with a timestamp component.
    #[error("multipart piece is missing an 'in' timestamp")]
    MissingTimestamp,
    /// Piece timestamps must strictly increase.
    #[error("piece timestamp {candidate} does not exceed previous {previous}")]
    NonMonotonic {
        /// Timestamp of the piece attached last.
        previous: f64,
        /// Timestamp of the rejected candidate piece.
        candidate: f64,
    },
    /// A piece may only name the id of its parent.
    #[error("piece id '{piece}' differs from parent id '{parent}'")]
    IdMismatch {
        /// Parent id (empty when unset).
        parent: String,
        /// Piece id.
        piece: String,
    },
    /// Detach of a piece that is not attached.
    #[error("no such multipart piece")]
    PieceNotFound,
}

/// Failures while turning a datagram back into a message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    /// A line without a `key:value` separator.
    #[error("datagram line has no colon: \"{0}\"")]
    MissingColon(String),
    /// Values must not contain a colon themselves.
    #[error("colon in value: \"{0}\"")]
    ColonInValue(String),
    /// A line with an empty value part.
    #[error("empty value for field '{0}'")]
    EmptyValue(String),
    /// The first line of every datagram is the `id` line.
    #[error("'id' must be the first line, found '{0}'")]
    IdNotFirst(String),
    /// A datagram without any `id` line at all.
    #[error("'id' must exist in datagram")]
    MissingId,
    /// Only one `id` per datagram.
    #[error("only one 'id' is allowed")]
    DuplicateId,
    /// A repeated field name inside one piece.
    #[error("multiple '{0}' fields")]
    DuplicateField(String),
    /// Field value failed type validation.
    #[error(transparent)]
    Field(#[from] FieldError),
    /// Multipart splitting produced an invalid piece sequence.
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    /// Data after the `sha256` line is not allowed.
    #[error("no data is allowed after the signature")]
    TrailingAfterSignature,
    /// Inline verification was requested and the signature did not match.
    #[error("signature check error")]
    SignatureMismatch,
}

/// Failures while producing a datagram.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EncodeError {
    /// Every datagram starts with an `id` line.
    #[error("id missing, cannot encode")]
    MissingId,
    /// Signing requires a nonce to be set first; this is a caller contract
    /// violation, not a protocol condition.
    #[error("nonce is required for HMAC signing")]
    MissingNonce,
}
