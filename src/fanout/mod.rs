//! Typed event fan-out: delivers one event to an ordered set of subscribers,
//! either sequentially or with bounded parallelism.

pub mod channel;
pub mod events;

use crate::config::FanoutConfig;
use crate::error::FanoutError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Per-publish context handed to every `Subscriber::handle` call: a deadline
/// plus a cancellation token derived from the caller's own context.
#[derive(Clone)]
pub struct PublishContext {
  pub deadline: Instant,
  pub cancel: CancellationToken,
}

impl PublishContext {
  pub fn is_expired(&self) -> bool {
    Instant::now() >= self.deadline || self.cancel.is_cancelled()
  }
}

/// A consumer of one typed event stream.
///
/// `handle` is the single synchronous handoff point and must honor
/// `ctx.cancel`/`ctx.deadline`. `cancel` should make any in-flight or future
/// `handle` call return promptly (draining pending work rather than hanging)
/// so a publisher racing with an unsubscribe never blocks past its deadline.
/// `close` releases resources and is called exactly once, by
/// [`SubscriberList::remove`].
#[async_trait::async_trait]
pub trait Subscriber<T>: Send + Sync {
  fn name(&self) -> &str;
  async fn handle(&self, ctx: &PublishContext, event: T) -> Result<(), FanoutError>;
  async fn cancel(&self);
  async fn close(&self);
}

fn default_worker_count() -> usize {
  let cpus = std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1);
  std::cmp::max(1, cpus / 2)
}

/// An ordered, identity-unique collection of `Subscriber<T>`.
pub struct SubscriberList<T> {
  subscribers: Vec<Arc<dyn Subscriber<T>>>,
  worker_count: Option<usize>,
}

impl<T> Default for SubscriberList<T> {
  fn default() -> Self {
    Self::new(FanoutConfig::default())
  }
}

impl<T> SubscriberList<T>
where
  T: Clone + Send + 'static,
{
  pub fn new(config: FanoutConfig) -> Self {
    Self {
      subscribers: Vec::new(),
      worker_count: config.worker_count,
    }
  }

  fn worker_count(&self) -> usize {
    self.worker_count.unwrap_or_else(default_worker_count)
  }

  pub fn len(&self) -> usize {
    self.subscribers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.subscribers.is_empty()
  }

  /// Appends `subscriber` unless an identical `Arc` is already registered.
  /// Returns `true` if it was added.
  pub fn add(&mut self, subscriber: Arc<dyn Subscriber<T>>) -> bool {
    if self
      .subscribers
      .iter()
      .any(|existing| Arc::ptr_eq(existing, &subscriber))
    {
      return false;
    }
    self.subscribers.push(subscriber);
    true
  }

  /// Removes `subscriber` by identity and closes it. Returns `true` if it
  /// was present. Preserves the relative order of the remaining subscribers.
  pub async fn remove(&mut self, subscriber: &Arc<dyn Subscriber<T>>) -> bool {
    let Some(index) = self
      .subscribers
      .iter()
      .position(|existing| Arc::ptr_eq(existing, subscriber))
    else {
      return false;
    };
    let removed = self.subscribers.remove(index);
    removed.close().await;
    true
  }

  /// Visits subscribers in registration order, returning on the first
  /// error.
  pub async fn publish(
    &self,
    parent_cancel: &CancellationToken,
    event: T,
    timeout: Duration,
  ) -> Result<(), FanoutError> {
    let ctx = PublishContext {
      deadline: Instant::now() + timeout,
      cancel: parent_cancel.child_token(),
    };

    let mut previous_name: Option<String> = None;
    for subscriber in &self.subscribers {
      if previous_name.is_some() && ctx.is_expired() {
        return Err(FanoutError::Timeout {
          subscriber: previous_name.unwrap(),
        });
      }
      subscriber.handle(&ctx, event.clone()).await?;
      previous_name = Some(subscriber.name().to_string());
    }
    Ok(())
  }

  /// Dispatches to subscribers concurrently with a worker count of
  /// `max(1, cpus/2)`, degrading to sequential `publish` when at most one
  /// subscriber is registered. Subscriber panics are caught and routed to
  /// `panic_handler` instead of unwinding the task pool, and — unlike a
  /// regular `Err` return, which cancels the remaining work — a panic never
  /// cancels sibling subscribers: every other subscriber's `handle` still
  /// runs to completion. Either failure mode is recorded as the first error
  /// observed (a panic surfaces as a `FanoutError::Subscriber`) and is what
  /// gets returned once all subscribers have run.
  pub async fn publish_parallel<F>(
    &self,
    parent_cancel: &CancellationToken,
    event: T,
    timeout: Duration,
    panic_handler: F,
  ) -> Result<(), FanoutError>
  where
    F: Fn(&str, Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
  {
    if self.subscribers.len() <= 1 {
      return self.publish(parent_cancel, event, timeout).await;
    }

    let deadline = Instant::now() + timeout;
    let child = parent_cancel.child_token();
    let ctx = PublishContext {
      deadline,
      cancel: child.clone(),
    };
    let semaphore = Arc::new(Semaphore::new(self.worker_count()));
    let first_error: Arc<AsyncMutex<Option<FanoutError>>> = Arc::new(AsyncMutex::new(None));
    let panic_handler = Arc::new(panic_handler);

    let mut tasks = tokio::task::JoinSet::new();
    for subscriber in self.subscribers.iter().cloned() {
      let name = subscriber.name().to_string();
      let event = event.clone();
      let ctx = ctx.clone();
      let semaphore = semaphore.clone();
      let first_error = first_error.clone();
      let panic_handler = panic_handler.clone();
      let child = child.clone();

      tasks.spawn(async move {
        let Ok(_permit) = semaphore.acquire().await else {
          return;
        };
        if child.is_cancelled() {
          return;
        }

        match AssertUnwindSafe(subscriber.handle(&ctx, event))
          .catch_unwind()
          .await
        {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            let mut guard = first_error.lock().await;
            if guard.is_none() {
              *guard = Some(e);
            }
            child.cancel();
          }
          Err(panic_payload) => {
            panic_handler(&name, panic_payload);
            let mut guard = first_error.lock().await;
            if guard.is_none() {
              *guard = Some(FanoutError::Subscriber {
                subscriber: name.clone(),
                cause: "subscriber panicked".to_string(),
              });
            }
            // Unlike a regular subscriber error, a panic isolates only the
            // panicking subscriber: siblings still get to run.
          }
        }
      });
    }

    let drain_all = async {
      while tasks.join_next().await.is_some() {}
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if tokio::time::timeout(remaining, drain_all).await.is_err() {
      child.cancel();
      return Err(FanoutError::Timeout {
        subscriber: "parallel-publish".to_string(),
      });
    }

    if let Some(err) = first_error.lock().await.take() {
      return Err(err);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct RecordingSubscriber {
    name: String,
    calls: Arc<AsyncMutex<Vec<String>>>,
    fail: bool,
    delay: Duration,
  }

  #[async_trait::async_trait]
  impl Subscriber<u32> for RecordingSubscriber {
    fn name(&self) -> &str {
      &self.name
    }

    async fn handle(&self, ctx: &PublishContext, _event: u32) -> Result<(), FanoutError> {
      if self.delay > Duration::ZERO {
        tokio::select! {
          _ = tokio::time::sleep(self.delay) => {}
          _ = ctx.cancel.cancelled() => {}
        }
      }
      self.calls.lock().await.push(self.name.clone());
      if self.fail {
        return Err(FanoutError::Subscriber {
          subscriber: self.name.clone(),
          cause: "boom".to_string(),
        });
      }
      Ok(())
    }

    async fn cancel(&self) {}
    async fn close(&self) {}
  }

  struct PanickingSubscriber {
    name: String,
  }

  #[async_trait::async_trait]
  impl Subscriber<u32> for PanickingSubscriber {
    fn name(&self) -> &str {
      &self.name
    }

    async fn handle(&self, _ctx: &PublishContext, _event: u32) -> Result<(), FanoutError> {
      panic!("subscriber exploded");
    }

    async fn cancel(&self) {}
    async fn close(&self) {}
  }

  fn recording(name: &str, calls: Arc<AsyncMutex<Vec<String>>>) -> Arc<dyn Subscriber<u32>> {
    Arc::new(RecordingSubscriber {
      name: name.to_string(),
      calls,
      fail: false,
      delay: Duration::ZERO,
    })
  }

  #[tokio::test]
  async fn add_rejects_duplicate_identity() {
    let mut list = SubscriberList::default();
    let calls = Arc::new(AsyncMutex::new(Vec::new()));
    let sub = recording("a", calls);
    assert!(list.add(sub.clone()));
    assert!(!list.add(sub));
    assert_eq!(list.len(), 1);
  }

  #[tokio::test]
  async fn publish_visits_subscribers_in_registration_order() {
    let mut list = SubscriberList::default();
    let calls = Arc::new(AsyncMutex::new(Vec::new()));
    list.add(recording("a", calls.clone()));
    list.add(recording("b", calls.clone()));
    list.add(recording("c", calls.clone()));

    list
      .publish(&CancellationToken::new(), 1u32, Duration::from_secs(1))
      .await
      .unwrap();

    assert_eq!(*calls.lock().await, vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn publish_stops_at_first_error() {
    let mut list = SubscriberList::default();
    let calls = Arc::new(AsyncMutex::new(Vec::new()));
    list.add(recording("a", calls.clone()));
    list.add(Arc::new(RecordingSubscriber {
      name: "b".to_string(),
      calls: calls.clone(),
      fail: true,
      delay: Duration::ZERO,
    }));
    list.add(recording("c", calls.clone()));

    let err = list
      .publish(&CancellationToken::new(), 1u32, Duration::from_secs(1))
      .await
      .unwrap_err();

    assert_eq!(err.subscriber_name(), "b");
    assert_eq!(*calls.lock().await, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn publish_parallel_isolates_a_panicking_subscriber() {
    let mut list = SubscriberList::default();
    let calls = Arc::new(AsyncMutex::new(Vec::new()));
    list.add(recording("first", calls.clone()));
    list.add(Arc::new(PanickingSubscriber {
      name: "middle".to_string(),
    }));
    list.add(recording("last", calls.clone()));

    let panics: Arc<AsyncMutex<Vec<String>>> = Arc::new(AsyncMutex::new(Vec::new()));
    let panics_clone = panics.clone();

    let err = list
      .publish_parallel(
        &CancellationToken::new(),
        1u32,
        Duration::from_secs(2),
        move |name, _payload| {
          let panics = panics_clone.clone();
          let name = name.to_string();
          tokio::spawn(async move {
            panics.lock().await.push(name);
          });
        },
      )
      .await
      .unwrap_err();

    assert_eq!(err.subscriber_name(), "middle");
    // Give the panic-handler's spawned task a chance to record.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(panics.lock().await.len(), 1);

    // The panic must not have cancelled the other subscribers: both must
    // have actually run, regardless of how many workers are available.
    let completed = calls.lock().await;
    assert!(completed.contains(&"first".to_string()));
    assert!(completed.contains(&"last".to_string()));
  }

  #[tokio::test]
  async fn publish_parallel_with_single_subscriber_degrades_to_sequential() {
    let mut list = SubscriberList::default();
    let calls = Arc::new(AsyncMutex::new(Vec::new()));
    list.add(recording("only", calls.clone()));

    list
      .publish_parallel(
        &CancellationToken::new(),
        1u32,
        Duration::from_secs(1),
        |_, _| {},
      )
      .await
      .unwrap();

    assert_eq!(*calls.lock().await, vec!["only"]);
  }

  #[tokio::test]
  async fn remove_closes_and_preserves_order() {
    struct Closeable {
      name: String,
      closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Subscriber<u32> for Closeable {
      fn name(&self) -> &str {
        &self.name
      }
      async fn handle(&self, _ctx: &PublishContext, _event: u32) -> Result<(), FanoutError> {
        Ok(())
      }
      async fn cancel(&self) {}
      async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
      }
    }

    let mut list = SubscriberList::default();
    let closed = Arc::new(AtomicUsize::new(0));
    let a: Arc<dyn Subscriber<u32>> = Arc::new(Closeable {
      name: "a".to_string(),
      closed: closed.clone(),
    });
    let b: Arc<dyn Subscriber<u32>> = Arc::new(Closeable {
      name: "b".to_string(),
      closed: closed.clone(),
    });
    let c: Arc<dyn Subscriber<u32>> = Arc::new(Closeable {
      name: "c".to_string(),
      closed: closed.clone(),
    });
    list.add(a);
    list.add(b.clone());
    list.add(c.clone());

    assert!(list.remove(&b).await);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(list.len(), 2);

    list
      .publish(&CancellationToken::new(), 1u32, Duration::from_secs(1))
      .await
      .unwrap();
  }
}
