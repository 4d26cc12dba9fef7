//! Send deduplication recorder: prevents an outgoing mail body from being
//! sent twice while a send is already in flight.
//!
//! ```ignore
//! let recorder = SendRecorder::with_default_ttl();
//! let (fp, inserted) = recorder.try_insert_wait_timeout(body, Duration::from_secs(10)).await?;
//! if inserted {
//!     match send_upstream(body).await {
//!         Ok(id) => recorder.add_message_id(&fp, id).await,
//!         Err(_) => recorder.remove_on_fail(&fp).await,
//!     }
//! }
//! // else: a prior attempt already owns this fingerprint; suppress the send.
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RecorderError;
use crate::hash::{fingerprint, Fingerprint};

/// Five minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// One-shot, multi-waiter completion signal for a single [`Entry`].
///
/// `Notify::notify_waiters` only wakes tasks that are already waiting, so the
/// atomic flag is the source of truth: a waiter checks it before and after
/// registering interest in `notify`, closing the lost-wakeup window.
struct Completion {
  notify: Notify,
  signalled: AtomicBool,
}

impl Completion {
  fn new() -> Self {
    Self {
      notify: Notify::new(),
      signalled: AtomicBool::new(false),
    }
  }

  fn is_signalled(&self) -> bool {
    self.signalled.load(Ordering::SeqCst)
  }

  fn signal(&self) {
    self.signalled.store(true, Ordering::SeqCst);
    self.notify.notify_waiters();
  }
}

struct Entry {
  assigned_id: Option<String>,
  expires_at: Instant,
  completion: Arc<Completion>,
}

impl Entry {
  fn fresh(ttl: Duration) -> Self {
    Self {
      assigned_id: None,
      expires_at: Instant::now() + ttl,
      completion: Arc::new(Completion::new()),
    }
  }

  fn is_expired(&self, now: Instant) -> bool {
    self.expires_at <= now
  }
}

enum WaitOutcome {
  Signalled,
  TimedOut,
  Cancelled,
}

async fn wait_for_completion(
  completion: &Completion,
  deadline: Instant,
  cancel: &CancellationToken,
) -> WaitOutcome {
  loop {
    if completion.is_signalled() {
      return WaitOutcome::Signalled;
    }

    let notified = completion.notify.notified();
    tokio::pin!(notified);

    // Re-check after registering interest in `notify` but before awaiting: a
    // signal delivered in between the two checks is still observed because
    // the `Notified` future captures the current epoch at creation time.
    if completion.is_signalled() {
      return WaitOutcome::Signalled;
    }

    tokio::select! {
      _ = &mut notified => continue,
      _ = tokio::time::sleep_until(deadline) => return WaitOutcome::TimedOut,
      _ = cancel.cancelled() => return WaitOutcome::Cancelled,
    }
  }
}

/// Prevents an outgoing mail body from being sent twice, while letting a
/// late duplicate discover the upstream identifier assigned to the winner.
///
/// The entries map is guarded by a single mutex; no operation holds the lock
/// across a wait.
pub struct SendRecorder {
  ttl: Duration,
  entries: Mutex<HashMap<Fingerprint, Entry>>,
}

impl SendRecorder {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_default_ttl() -> Self {
    Self::new(DEFAULT_TTL)
  }

  /// Convenience wrapper over [`Self::try_insert_wait`] for callers that have
  /// no cancellation token of their own.
  pub async fn try_insert_wait_timeout(
    &self,
    body: &[u8],
    timeout: Duration,
  ) -> Result<(Fingerprint, bool), RecorderError> {
    self
      .try_insert_wait(body, Instant::now() + timeout, &CancellationToken::new())
      .await
  }

  /// Registers `body` as an in-flight send if no attempt currently owns its
  /// fingerprint, returning `(fingerprint, true)`. If an attempt already owns
  /// it, waits for that attempt to finish: returns `(fingerprint, false)` if
  /// it succeeded, or competes to become the new owner if it failed.
  pub async fn try_insert_wait(
    &self,
    body: &[u8],
    deadline: Instant,
    cancel: &CancellationToken,
  ) -> Result<(Fingerprint, bool), RecorderError> {
    let fp = fingerprint(body)?;

    loop {
      let pending = {
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries);

        match entries.get(&fp) {
          None => {
            entries.insert(fp.clone(), Entry::fresh(self.ttl));
            return Ok((fp, true));
          }
          Some(entry) => entry.completion.clone(),
        }
      };

      match wait_for_completion(&pending, deadline, cancel).await {
        WaitOutcome::TimedOut => return Err(RecorderError::DeadlineExceeded),
        WaitOutcome::Cancelled => return Err(RecorderError::Cancelled),
        WaitOutcome::Signalled => {
          let entries = self.entries.lock().await;
          match entries.get(&fp) {
            Some(entry) if entry.assigned_id.is_some() => return Ok((fp, false)),
            Some(_) => {
              tracing::warn!(fingerprint = %fp, "completion signalled with no assigned id");
              continue;
            }
            None => continue, // previous attempt failed; compete to become the new owner
          }
        }
      }
    }
  }

  /// Convenience wrapper over [`Self::has_entry_wait`].
  pub async fn has_entry_wait_timeout(
    &self,
    body: &[u8],
    timeout: Duration,
  ) -> Result<Option<String>, RecorderError> {
    self
      .has_entry_wait(body, Instant::now() + timeout, &CancellationToken::new())
      .await
  }

  /// Reports the upstream id assigned to `body`'s in-flight or completed
  /// send, waiting for an in-flight attempt to finish if one is present.
  /// Returns `None` if no attempt owns this fingerprint, or if the owning
  /// attempt fails before a deadline or cancellation cuts the wait short.
  pub async fn has_entry_wait(
    &self,
    body: &[u8],
    deadline: Instant,
    cancel: &CancellationToken,
  ) -> Result<Option<String>, RecorderError> {
    let fp = fingerprint(body)?;

    loop {
      let pending = {
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries);

        match entries.get(&fp) {
          None => return Ok(None),
          Some(entry) => entry.completion.clone(),
        }
      };

      match wait_for_completion(&pending, deadline, cancel).await {
        WaitOutcome::TimedOut => return Ok(None),
        WaitOutcome::Cancelled => return Err(RecorderError::Cancelled),
        WaitOutcome::Signalled => {
          let entries = self.entries.lock().await;
          match entries.get(&fp) {
            Some(entry) if entry.assigned_id.is_some() => {
              return Ok(entry.assigned_id.clone());
            }
            Some(_) => continue,
            None => continue,
          }
        }
      }
    }
  }

  /// Marks `fingerprint`'s attempt as successful with the given upstream id
  /// and wakes any waiters. A missing entry (raced by TTL eviction) is
  /// logged and otherwise ignored.
  pub async fn add_message_id(&self, fingerprint: &Fingerprint, id: impl Into<String>) {
    let mut entries = self.entries.lock().await;
    match entries.get_mut(fingerprint) {
      Some(entry) => {
        entry.assigned_id = Some(id.into());
        entry.completion.signal();
      }
      None => {
        tracing::warn!(
          fingerprint = %fingerprint,
          "add_message_id called for an entry that no longer exists"
        );
      }
    }
  }

  /// Removes `fingerprint`'s in-flight attempt and wakes any waiters so they
  /// can compete to become the new owner. A no-op if the entry already
  /// succeeded.
  pub async fn remove_on_fail(&self, fingerprint: &Fingerprint) {
    let mut entries = self.entries.lock().await;
    let already_succeeded = matches!(entries.get(fingerprint), Some(e) if e.assigned_id.is_some());
    if already_succeeded {
      return;
    }
    if let Some(entry) = entries.remove(fingerprint) {
      entry.completion.signal();
    }
  }

  /// Number of live (non-expired) entries currently tracked. Exposed for
  /// diagnostics/tests only.
  pub async fn live_entry_count(&self) -> usize {
    let mut entries = self.entries.lock().await;
    evict_expired(&mut entries);
    entries.len()
  }
}

fn evict_expired(entries: &mut HashMap<Fingerprint, Entry>) {
  let now = Instant::now();
  entries.retain(|_, entry| !entry.is_expired(now));
}
