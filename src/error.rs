use thiserror::Error;

/// Errors raised while computing a [`crate::hash::Fingerprint`].
#[derive(Error, Debug, Clone)]
pub enum HashError {
  #[error("malformed mime structure: {0}")]
  MalformedMime(String),

  #[error("failed to decode body: {0}")]
  BodyDecode(String),
}

/// Errors surfaced by [`crate::dedup::SendRecorder`] operations.
#[derive(Error, Debug, Clone)]
pub enum RecorderError {
  #[error("hashing failed: {0}")]
  Hash(#[from] HashError),

  #[error("deadline exceeded while waiting for send completion")]
  DeadlineExceeded,

  #[error("caller context was cancelled")]
  Cancelled,
}

/// A structured error carrying the offending subscriber and the underlying cause.
///
/// Mirrors `fechatter_core::error::PublishError`, generalized from NATS publish
/// failures to fan-out subscriber failures.
#[derive(Error, Debug, Clone)]
pub enum FanoutError {
  #[error("publish timed out waiting on subscriber {subscriber}")]
  Timeout { subscriber: String },

  #[error("subscriber {subscriber} failed: {cause}")]
  Subscriber { subscriber: String, cause: String },
}

impl FanoutError {
  pub fn subscriber_name(&self) -> &str {
    match self {
      FanoutError::Timeout { subscriber } => subscriber,
      FanoutError::Subscriber { subscriber, .. } => subscriber,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, FanoutError::Timeout { .. })
  }
}
