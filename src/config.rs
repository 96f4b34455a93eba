// Copyright 2020 Joyent, Inc.

//! Channel configuration.
//!
//! Every field has a default, so a configuration file only needs to name
//! what it changes:
//!
//! ```
//! let opts = tchannel::ChannelOptions::from_json(
//!     r#"{ "process_name": "relay", "max_pending": 512 }"#,
//! ).unwrap();
//! assert_eq!(opts.max_pending, Some(512));
//! assert_eq!(opts.retry_limit, 5);
//! ```

use std::time::Duration;

use serde_derive::Deserialize;

use crate::checksum::ChecksumType;
use crate::error::{Error, Result};
use crate::fragment::MAX_ARG1_SIZE;

/// Which direction of connection a peer should prefer for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Any,
    In,
    Out,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Any
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelOptions {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_timeout_check_interval_ms")]
    pub timeout_check_interval_ms: u64,
    /// Jitter applied to each sweep interval, in milliseconds.
    #[serde(default = "default_timeout_fuzz_ms")]
    pub timeout_fuzz_ms: u64,
    /// How long past its timeout a finished outbound id stays reserved.
    #[serde(default = "default_tombstone_ttl_offset_ms")]
    pub tombstone_ttl_offset_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,
    #[serde(default)]
    pub max_pending: Option<usize>,
    #[serde(default)]
    pub max_pending_for_service: Option<usize>,
    #[serde(default)]
    pub prefer_connection_direction: Direction,
    #[serde(default = "default_max_arg1_size")]
    pub max_arg1_size: usize,
    #[serde(default)]
    pub checksum_type: ChecksumType,
}

fn default_process_name() -> String {
    format!("tchannel[{}]", std::process::id())
}

fn default_init_timeout_ms() -> u64 {
    2000
}

fn default_timeout_check_interval_ms() -> u64 {
    100
}

fn default_timeout_fuzz_ms() -> u64 {
    100
}

fn default_tombstone_ttl_offset_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_retry_limit() -> usize {
    5
}

fn default_max_arg1_size() -> usize {
    MAX_ARG1_SIZE
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            process_name: default_process_name(),
            init_timeout_ms: default_init_timeout_ms(),
            timeout_check_interval_ms: default_timeout_check_interval_ms(),
            timeout_fuzz_ms: default_timeout_fuzz_ms(),
            tombstone_ttl_offset_ms: default_tombstone_ttl_offset_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_limit: default_retry_limit(),
            max_pending: None,
            max_pending_for_service: None,
            prefer_connection_direction: Direction::Any,
            max_arg1_size: default_max_arg1_size(),
            checksum_type: ChecksumType::Crc32,
        }
    }
}

impl ChannelOptions {
    pub fn from_json(s: &str) -> Result<ChannelOptions> {
        let opts: ChannelOptions =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_check_interval_ms == 0 {
            return Err(Error::Config(
                "timeout_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > u64::from(u32::MAX) {
            return Err(Error::Config(
                "request_timeout_ms must fit a call ttl".to_string(),
            ));
        }
        if self.max_arg1_size > MAX_ARG1_SIZE {
            return Err(Error::Config(format!(
                "max_arg1_size may not exceed {}",
                MAX_ARG1_SIZE
            )));
        }
        if self.checksum_type == ChecksumType::Farm32 {
            return Err(Error::Config("farm32 checksums are not supported".to_string()));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn tombstone_ttl_offset(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_offset_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The next sweep interval, jittered by up to half the fuzz either way.
    pub fn fuzzed_check_interval(&self) -> Duration {
        let base = self.timeout_check_interval_ms as i64;
        let fuzz = self.timeout_fuzz_ms as i64;
        let offset = if fuzz > 0 {
            rand::random::<i64>().rem_euclid(fuzz + 1) - fuzz / 2
        } else {
            0
        };
        Duration::from_millis((base + offset).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let opts = ChannelOptions::from_json("{}").unwrap();
        assert_eq!(opts.init_timeout(), Duration::from_secs(2));
        assert_eq!(opts.tombstone_ttl_offset_ms, 500);
        assert_eq!(opts.prefer_connection_direction, Direction::Any);
        assert_eq!(opts.checksum_type, ChecksumType::Crc32);
        assert_eq!(opts.max_pending, None);
    }

    #[test]
    fn parses_overrides() {
        let opts = ChannelOptions::from_json(
            r#"{
                "prefer_connection_direction": "out",
                "checksum_type": "crc32c",
                "max_pending_for_service": 3,
                "retry_limit": 1
            }"#,
        )
        .unwrap();
        assert_eq!(opts.prefer_connection_direction, Direction::Out);
        assert_eq!(opts.checksum_type, ChecksumType::Crc32c);
        assert_eq!(opts.max_pending_for_service, Some(3));
        assert_eq!(opts.retry_limit, 1);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ChannelOptions::from_json(r#"{"timeout_check_interval_ms": 0}"#).is_err());
        assert!(ChannelOptions::from_json(r#"{"checksum_type": "farm32"}"#).is_err());
        assert!(ChannelOptions::from_json(r#"{"max_arg1_size": 100000}"#).is_err());
        assert!(ChannelOptions::from_json("not json").is_err());
    }

    #[test]
    fn fuzz_stays_in_range() {
        let opts = ChannelOptions::default();
        for _ in 0..100 {
            let d = opts.fuzzed_check_interval().as_millis();
            assert!(d >= 50 && d <= 150, "{}", d);
        }
    }
}
