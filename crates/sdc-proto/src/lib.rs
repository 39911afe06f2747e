//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "SDP message grammar, multipart assembly and signing."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Service Description Protocol codec.
//!
//! A datagram is UTF-8 text of newline-terminated `key:value` lines. The
//! `id` line comes first and names the owning device; the suffix of every
//! other field name determines its type. Repeated `in` lines batch several
//! time-ordered sub-messages into one multipart datagram. An optional
//! trailing `sha256` line carries the HMAC signature.

#![warn(missing_docs)]

pub mod error;
pub mod field;
pub mod message;
pub mod signed;

pub use error::{DecodeError, EncodeError, FieldError, MultipartError};
pub use field::{FieldInput, FieldKind, FieldValue, Scalar};
pub use message::{SdpMessage, TimeBase};
pub use signed::{body_checksum, sign_checksum, verify_signature, SignedSdp};
