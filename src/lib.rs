pub mod config;
pub mod dedup;
pub mod error;
pub mod fanout;
pub mod hash;

pub use config::{Config, FanoutConfig, RecorderConfig};
pub use dedup::{SendRecorder, DEFAULT_TTL};
pub use error::{FanoutError, HashError, RecorderError};
pub use fanout::channel::ChanneledSubscriber;
pub use fanout::{PublishContext, Subscriber, SubscriberList};
pub use hash::{fingerprint, Fingerprint};
