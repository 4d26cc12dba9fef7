//! Concrete event payloads for the account change streams a mail bridge
//! typically fans out: one `SubscriberList<T>` per kind below. These are
//! worked examples for tests and doc examples, not a wire format — hosts are
//! free to fan out any `T: Send + 'static` of their own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AddressEvent {
  pub account_id: String,
  pub address: String,
  pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LabelEvent {
  pub account_id: String,
  pub label_id: String,
  pub name: String,
  pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MessageEvent {
  pub account_id: String,
  pub message_id: String,
  pub folder: String,
  pub removed: bool,
}

/// Signals that the upstream state for `account_id` diverged enough that a
/// full resync is cheaper than reconciling individual events.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
  pub account_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserEvent {
  pub account_id: String,
  pub display_name: String,
  pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UsedSpaceEvent {
  pub account_id: String,
  pub bytes_used: u64,
}
