//! Ambient configuration for embedding this crate in a host bridge process.
//!
//! Mirrors `notify_server::config::AppConfig::load`: look for a config file
//! in the working directory, then `/etc/config`, then an environment
//! variable override, falling back to [`Config::default`] if none exist.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs::File;
use std::time::Duration;

/// Five minutes.
const DEFAULT_TTL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
  /// TTL applied uniformly to all new [`crate::dedup::SendRecorder`] entries.
  #[serde(with = "humantime_secs")]
  pub ttl: Duration,
}

impl Default for RecorderConfig {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(DEFAULT_TTL_SECS),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FanoutConfig {
  /// Overrides the derived `max(1, cpus/2)` worker count for
  /// `SubscriberList::publish_parallel`. `None` uses the derived value.
  pub worker_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
  pub recorder: RecorderConfig,
  pub fanout: FanoutConfig,
}

impl Config {
  /// Load from `./bridge-sync.yml`, `/etc/config/bridge-sync.yml`, or the
  /// `BRIDGE_SYNC_CONFIG` environment variable; falls back to defaults when
  /// none of those are present, since this crate has no required config.
  pub fn load() -> anyhow::Result<Self> {
    let found = match (
      File::open("bridge-sync.yml"),
      File::open("/etc/config/bridge-sync.yml"),
      env::var("BRIDGE_SYNC_CONFIG"),
    ) {
      (Ok(reader), _, _) => Some(serde_yaml::from_reader(reader)?),
      (_, Ok(reader), _) => Some(serde_yaml::from_reader(reader)?),
      (_, _, Ok(path)) => Some(serde_yaml::from_reader(File::open(path)?)?),
      _ => None,
    };

    Ok(found.unwrap_or_default())
  }
}

mod humantime_secs {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_u64(value.as_secs())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
    let secs = u64::deserialize(de)?;
    Ok(Duration::from_secs(secs))
  }
}
