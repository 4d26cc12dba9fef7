//! Content-addressed fingerprinting of outgoing mail bodies.
//!
//! The fingerprint is an opaque private key, not a canonicalization: no
//! separators are inserted between the hashed contributions, and the only
//! observable behavior is fingerprint equality.

use crate::error::HashError;
use base64::Engine;
use mailparse::{MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};
use std::fmt;

/// Base64-encoded 256-bit digest of a structured mail body.
///
/// Two bodies with identical fingerprints are considered the same
/// submission for the purposes of [`crate::dedup::SendRecorder`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
  fn from_digest(digest: [u8; 32]) -> Self {
    Self(base64::engine::general_purpose::STANDARD.encode(digest))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::ops::Deref for Fingerprint {
  type Target = str;

  fn deref(&self) -> &str {
    &self.0
  }
}

const HEADERS_OF_INTEREST: [&str; 4] = ["From", "To", "Cc", "Bcc"];

/// Computes the fingerprint of a raw internet-message (headers + optional
/// multipart body): selected headers plus the decoded body of every leaf
/// MIME part, hashed in document order.
pub fn fingerprint(raw: &[u8]) -> Result<Fingerprint, HashError> {
  let parsed =
    mailparse::parse_mail(raw).map_err(|e| HashError::MalformedMime(e.to_string()))?;

  let mut hasher = Sha256::new();

  hasher.update(header_value(&parsed, "Subject").as_bytes());
  for name in HEADERS_OF_INTEREST {
    hasher.update(header_value(&parsed, name).as_bytes());
  }

  hash_leaves(&parsed, &mut hasher)?;

  Ok(Fingerprint::from_digest(hasher.finalize().into()))
}

fn header_value(part: &ParsedMail, name: &str) -> String {
  part.headers.get_first_value(name).unwrap_or_default()
}

fn hash_leaves(part: &ParsedMail, hasher: &mut Sha256) -> Result<(), HashError> {
  if part.subparts.is_empty() {
    hasher.update(header_value(part, "Content-Type").as_bytes());
    hasher.update(header_value(part, "Content-Disposition").as_bytes());

    let body = part
      .get_body()
      .map_err(|e| HashError::BodyDecode(e.to_string()))?;
    hasher.update(body.trim().as_bytes());
    return Ok(());
  }

  for child in &part.subparts {
    hash_leaves(child, hasher)?;
  }
  Ok(())
}
