//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "SDP message grammar, multipart assembly and signing."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{DecodeError, EncodeError};
use crate::field::SIGNATURE_FIELD;
use crate::message::{split_line, SdpMessage};

type HmacSha256 = Hmac<Sha256>;

/// An [`SdpMessage`] together with optional HMAC signature material.
///
/// The signature covers `nonce ‖ SHA256(unsigned body)` under the device's
/// secret key. Key and nonce are supplied out of band and never appear as
/// application fields; the `sha256` field name is reserved for the trailing
/// signature line.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedSdp {
    message: SdpMessage,
    secret_key: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
    checksum: Option<String>,
}

impl SignedSdp {
    /// Wrap a message without signing credentials.
    pub fn new(message: SdpMessage) -> Self {
        Self {
            message,
            secret_key: None,
            nonce: None,
            signature: None,
            checksum: None,
        }
    }

    /// Wrap a message with signing credentials; `encode` will sign when a
    /// secret key is present.
    pub fn with_credentials(
        message: SdpMessage,
        secret_key: Option<String>,
        nonce: Option<String>,
    ) -> Self {
        Self {
            message,
            secret_key,
            nonce,
            signature: None,
            checksum: None,
        }
    }

    /// The wrapped message.
    pub fn message(&self) -> &SdpMessage {
        &self.message
    }

    /// Consume the wrapper, returning the message.
    pub fn into_message(self) -> SdpMessage {
        self.message
    }

    /// Set the HMAC secret key.
    pub fn set_secret_key(&mut self, secret_key: impl Into<String>) {
        self.secret_key = Some(secret_key.into());
    }

    /// Set the HMAC nonce.
    pub fn set_nonce(&mut self, nonce: impl Into<String>) {
        self.nonce = Some(nonce.into());
    }

    /// Whether a signature line was decoded (or will be produced on encode).
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// The decoded signature, if any.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Encode to datagram text, appending a `sha256` signature line when a
    /// secret key is configured. Signing without a nonce is a caller
    /// contract violation.
    pub fn encode(&self) -> Result<String, EncodeError> {
        let body = self.message.encode()?;
        let Some(secret_key) = &self.secret_key else {
            return Ok(body);
        };
        let nonce = self.nonce.as_ref().ok_or(EncodeError::MissingNonce)?;
        let checksum = body_checksum(&body);
        let signature = sign_checksum(&checksum, secret_key, nonce);
        Ok(format!("{body}{SIGNATURE_FIELD}:{signature}\n"))
    }

    /// Decode a datagram, capturing checksum and signature for deferred
    /// verification. The checksum covers the body preceding the `sha256`
    /// line; any content after that line is a decode error.
    pub fn decode(datagram: &str) -> Result<SignedSdp, DecodeError> {
        let mut body = String::new();
        let mut signature = None;
        for line in datagram.lines() {
            if signature.is_some() {
                warn!("no data is allowed after signature");
                return Err(DecodeError::TrailingAfterSignature);
            }
            if line.is_empty() {
                warn!("empty line in datagram");
                continue;
            }
            let (key, value) = split_line(line)?;
            if key == SIGNATURE_FIELD {
                signature = Some(value);
                continue;
            }
            body.push_str(line);
            body.push('\n');
        }
        let message = SdpMessage::decode(&body)?;
        let checksum = signature.as_ref().map(|_| body_checksum(&body));
        Ok(SignedSdp {
            message,
            secret_key: None,
            nonce: None,
            signature,
            checksum,
        })
    }

    /// Decode and verify in one step, failing with
    /// [`DecodeError::SignatureMismatch`] when the datagram carries a
    /// signature that does not check out against `secret_key` and `nonce`.
    pub fn decode_verified(
        datagram: &str,
        secret_key: &str,
        nonce: &str,
    ) -> Result<SignedSdp, DecodeError> {
        let mut decoded = Self::decode(datagram)?;
        if decoded.is_signed() && !decoded.verify(secret_key, nonce) {
            return Err(DecodeError::SignatureMismatch);
        }
        decoded.secret_key = Some(secret_key.to_owned());
        decoded.nonce = Some(nonce.to_owned());
        Ok(decoded)
    }

    /// Verify the captured signature against `secret_key` and `nonce`.
    /// Returns `false` for unsigned messages and for any mismatch; it never
    /// fails.
    pub fn verify(&self, secret_key: &str, nonce: &str) -> bool {
        match (&self.checksum, &self.signature) {
            (Some(checksum), Some(signature)) => {
                verify_signature(checksum, signature, secret_key, nonce)
            }
            _ => false,
        }
    }
}

/// Base64-encoded SHA-256 checksum of an unsigned datagram body.
pub fn body_checksum(body: &str) -> String {
    BASE64.encode(Sha256::digest(body.as_bytes()))
}

/// Base64-encoded `HMAC-SHA256(secret_key, nonce ‖ checksum)`.
pub fn sign_checksum(checksum: &str, secret_key: &str, nonce: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(nonce.as_bytes());
    mac.update(checksum.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time signature comparison. A signature that is not valid base64
/// can never verify.
pub fn verify_signature(checksum: &str, signature: &str, secret_key: &str, nonce: &str) -> bool {
    let Ok(signature_bytes) = BASE64.decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(nonce.as_bytes());
    mac.update(checksum.as_bytes());
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> SdpMessage {
        let mut msg = SdpMessage::with_id("abc123");
        msg.add("in", "1,1000").unwrap();
        msg.add("AAS", 2).unwrap();
        msg
    }

    #[test]
    fn unsigned_encode_has_no_signature_line() {
        let signed = SignedSdp::new(sample_message());
        let wire = signed.encode().unwrap();
        assert!(!wire.contains("sha256:"));
    }

    #[test]
    fn signing_requires_a_nonce() {
        let signed =
            SignedSdp::with_credentials(sample_message(), Some("s3cret".into()), None);
        assert_eq!(signed.encode(), Err(EncodeError::MissingNonce));
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let sig = |body: &str, key: &str, nonce: &str| {
            sign_checksum(&body_checksum(body), key, nonce)
        };
        let reference = sig("id:abc\nAAS:2\n", "key", "nonce");
        assert_eq!(reference, sig("id:abc\nAAS:2\n", "key", "nonce"));
        assert_ne!(reference, sig("id:abc\nAAS:3\n", "key", "nonce"));
        assert_ne!(reference, sig("id:abc\nAAS:2\n", "keyx", "nonce"));
        assert_ne!(reference, sig("id:abc\nAAS:2\n", "key", "noncex"));
    }

    #[test]
    fn signed_round_trip_verifies() {
        let signed = SignedSdp::with_credentials(
            sample_message(),
            Some("s3cret".into()),
            Some("n0nce".into()),
        );
        let wire = signed.encode().unwrap();
        assert!(wire.ends_with('\n'));
        assert!(wire.contains("\nsha256:"));

        let decoded = SignedSdp::decode(&wire).unwrap();
        assert!(decoded.is_signed());
        assert!(decoded.verify("s3cret", "n0nce"));
        assert!(!decoded.verify("s3cret", "other"));
        assert!(!decoded.verify("other", "n0nce"));
        assert_eq!(decoded.message().id(), Some("abc123"));
    }

    #[test]
    fn tampered_body_fails_verification_without_error() {
        let signed = SignedSdp::with_credentials(
            sample_message(),
            Some("s3cret".into()),
            Some("n0nce".into()),
        );
        let wire = signed.encode().unwrap();
        let tampered = wire.replace("AAS:2", "AAS:3");
        let decoded = SignedSdp::decode(&tampered).unwrap();
        assert!(!decoded.verify("s3cret", "n0nce"));
    }

    #[test]
    fn nothing_may_follow_the_signature() {
        let signed = SignedSdp::with_credentials(
            sample_message(),
            Some("s3cret".into()),
            Some("n0nce".into()),
        );
        let wire = signed.encode().unwrap();
        let trailing = format!("{wire}ABS:1\n");
        assert_eq!(
            SignedSdp::decode(&trailing),
            Err(DecodeError::TrailingAfterSignature)
        );
    }

    #[test]
    fn decode_verified_rejects_bad_signatures() {
        let signed = SignedSdp::with_credentials(
            sample_message(),
            Some("s3cret".into()),
            Some("n0nce".into()),
        );
        let wire = signed.encode().unwrap();
        assert!(SignedSdp::decode_verified(&wire, "s3cret", "n0nce").is_ok());
        assert_eq!(
            SignedSdp::decode_verified(&wire, "s3cret", "stale"),
            Err(DecodeError::SignatureMismatch)
        );
    }

    #[test]
    fn unsigned_message_never_verifies() {
        let decoded = SignedSdp::decode("id:abc\nAAS:1\n").unwrap();
        assert!(!decoded.is_signed());
        assert!(!decoded.verify("s3cret", "n0nce"));
    }
}
