//! Adapter converting a pull-style consumer into the push-style
//! [`Subscriber`] contract.

use super::{PublishContext, Subscriber};
use crate::error::FanoutError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};

/// One rendezvous handoff: a payload plus the single-use channel the
/// consumer replies on.
pub struct Envelope<T> {
  pub payload: T,
  pub reply: oneshot::Sender<Option<FanoutError>>,
}

/// Converts a pull-style consumer (one that wants to `recv().await` events
/// off a queue) into a push-style [`Subscriber<T>`]: each `handle` call
/// enqueues `(payload, reply)` and blocks until the consumer answers.
///
/// `tx` and `rx` are held behind a plain (non-async) `Mutex` used only to
/// hand out/retire the two channel halves — never across an `.await` point,
/// so neither a parked consumer nor a parked drainer can block `close()`.
pub struct ChanneledSubscriber<T> {
  name: String,
  tx: StdMutex<Option<mpsc::Sender<Envelope<T>>>>,
  rx: StdMutex<Option<mpsc::Receiver<Envelope<T>>>>,
  cancelled: Arc<AtomicBool>,
}

impl<T> ChanneledSubscriber<T>
where
  T: Send + 'static,
{
  /// `capacity` of 1 approximates an unbuffered rendezvous channel as
  /// closely as tokio's mpsc allows: at most one payload is ever in flight
  /// ahead of the consumer accepting it.
  pub fn new(name: impl Into<String>) -> Self {
    let (tx, rx) = mpsc::channel(1);
    Self {
      name: name.into(),
      tx: StdMutex::new(Some(tx)),
      rx: StdMutex::new(Some(rx)),
      cancelled: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Hands ownership of the receive side to the caller's consumer loop.
  /// Returns `None` if it was already taken, either by a prior call or by
  /// `cancel`'s drainer.
  pub fn on_event_ch(&self) -> Option<mpsc::Receiver<Envelope<T>>> {
    self.rx.lock().unwrap().take()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

#[async_trait::async_trait]
impl<T> Subscriber<T> for ChanneledSubscriber<T>
where
  T: Send + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  async fn handle(&self, ctx: &PublishContext, event: T) -> Result<(), FanoutError> {
    let Some(sender) = self.tx.lock().unwrap().clone() else {
      // Already closed; nothing to hand off.
      return Ok(());
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let envelope = Envelope {
      payload: event,
      reply: reply_tx,
    };

    tokio::select! {
      result = sender.send(envelope) => {
        if result.is_err() {
          // Consumer side dropped; nothing further to hand off.
          return Ok(());
        }
      }
      _ = ctx.cancel.cancelled() => {
        return Err(FanoutError::Timeout { subscriber: self.name.clone() });
      }
      _ = tokio::time::sleep_until(ctx.deadline) => {
        return Err(FanoutError::Timeout { subscriber: self.name.clone() });
      }
    }

    tokio::select! {
      reply = reply_rx => {
        match reply {
          // Consumer answered with an error.
          Ok(Some(err)) => Err(err),
          // Consumer answered success, or dropped the reply channel without
          // sending; treat silence as success.
          Ok(None) | Err(_) => Ok(()),
        }
      }
      _ = ctx.cancel.cancelled() => Err(FanoutError::Timeout { subscriber: self.name.clone() }),
      _ = tokio::time::sleep_until(ctx.deadline) => Err(FanoutError::Timeout { subscriber: self.name.clone() }),
    }
  }

  /// If the receive side hasn't already been handed to a consumer via
  /// [`Self::on_event_ch`], takes it and spawns a best-effort drainer that
  /// replies success to any pending envelope, so an unsubscribe never makes
  /// a publisher wait out its deadline. The drainer owns its receiver
  /// outright (no lock survives across its `.recv().await`) and exits once
  /// [`Self::close`] drops the sender and the channel drains.
  async fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    let Some(mut rx) = self.rx.lock().unwrap().take() else {
      return;
    };
    tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let _ = envelope.reply.send(None);
      }
    });
  }

  /// Drops the sender side, which closes the channel once any in-flight
  /// sends finish — terminating whichever receiver loop (a consumer's or
  /// `cancel`'s drainer) holds the other end.
  async fn close(&self) {
    self.tx.lock().unwrap().take();
  }
}
