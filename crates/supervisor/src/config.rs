//! Supervisor configuration and the device record it is built from.
//!
//! [`SupervisorConfig`] holds typed durations. [`DeviceRecord`] is the
//! serde shape a config collaborator hands over (millisecond integers, all
//! link tuning optional) and converts into an identity plus a config.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RecordError;
use crate::retry::RetryPolicy;
use crate::types::DeviceIdentity;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between external-client liveness checks.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound for a single connect, teardown or poll hook.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keepalive period for socket patterns.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a keepalive may take before the socket is considered dead.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest period a maintenance timer or hook bound is allowed.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Keepalive settings for the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

/// Tuning for one supervisor. Read-only once the supervisor is built.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,
    /// When false, any failure goes straight to `Failed`.
    pub reconnect: bool,
    pub hook_timeout: Duration,
    pub poll_interval: Duration,
    pub watchdog_interval: Duration,
    pub keepalive: Option<KeepaliveConfig>,
    /// Receiving nothing for this long ends the receive loop.
    pub idle_timeout: Option<Duration>,
    /// Hybrid only: keep polling when the push channel drops.
    pub keep_polling_on_push_loss: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect: true,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            keepalive: None,
            idle_timeout: None,
            keep_polling_on_push_loss: true,
        }
    }
}

impl SupervisorConfig {
    /// Raises periods below [`MIN_PERIOD`] to it. Tokio timers reject a
    /// zero period, so a zero interval would otherwise kill the run task.
    pub fn normalized(mut self) -> Self {
        let keepalive = self.keepalive.as_mut().map(|k| &mut k.interval);
        let periods = [
            ("hook_timeout", Some(&mut self.hook_timeout)),
            ("poll_interval", Some(&mut self.poll_interval)),
            ("watchdog_interval", Some(&mut self.watchdog_interval)),
            ("keepalive.interval", keepalive),
        ];
        for (field, period) in periods {
            if let Some(period) = period
                && *period < MIN_PERIOD
            {
                warn!(field, configured = ?period, minimum = ?MIN_PERIOD, "period too short, raised");
                *period = MIN_PERIOD;
            }
        }
        self
    }
}

/// A configured device as stored by the config collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tag: Option<String>,
    /// Protocol-specific settings, opaque to the supervisor.
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub link: LinkOverrides,
}

/// Optional link tuning carried in a device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOverrides {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<f64>,
    pub max_attempts: Option<u32>,
    pub reconnect: Option<bool>,
    pub hook_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub watchdog_interval_ms: Option<u64>,
    /// `0` disables keepalive.
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_timeout_ms: Option<u64>,
    /// `0` disables the idle deadline.
    pub idle_timeout_ms: Option<u64>,
    pub keep_polling_on_push_loss: Option<bool>,
}

impl DeviceRecord {
    /// Builds the immutable identity for this record.
    pub fn identity(&self) -> Result<DeviceIdentity, RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::MissingId);
        }
        let name = if self.name.trim().is_empty() {
            self.id.clone()
        } else {
            self.name.clone()
        };
        let identity = DeviceIdentity::new(self.id.clone(), name);
        Ok(match &self.log_tag {
            Some(tag) if !tag.is_empty() => identity.with_log_tag(tag.clone()),
            _ => identity,
        })
    }

    /// Applies the record's overrides on top of the defaults.
    pub fn supervisor_config(&self) -> Result<SupervisorConfig, RecordError> {
        let o = &self.link;
        let mut cfg = SupervisorConfig::default();

        if let Some(ms) = o.base_delay_ms {
            cfg.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = o.max_delay_ms {
            cfg.retry.max_delay = Duration::from_millis(ms);
        }
        if cfg.retry.max_delay < cfg.retry.base_delay {
            return Err(invalid("max_delay_ms", "must not be below base_delay_ms"));
        }
        if let Some(f) = o.backoff_factor {
            if !f.is_finite() || f < 1.0 {
                return Err(invalid("backoff_factor", format!("{f} is below 1.0")));
            }
            cfg.retry.factor = f;
        }
        if let Some(j) = o.jitter {
            if !(0.0..1.0).contains(&j) {
                return Err(invalid("jitter", format!("{j} is outside [0, 1)")));
            }
            cfg.retry.jitter = j;
        }
        if let Some(n) = o.max_attempts {
            cfg.retry.max_attempts = n;
        }
        if let Some(r) = o.reconnect {
            cfg.reconnect = r;
        }
        if let Some(ms) = o.hook_timeout_ms {
            cfg.hook_timeout = positive("hook_timeout_ms", ms)?;
        }
        if let Some(ms) = o.poll_interval_ms {
            cfg.poll_interval = positive("poll_interval_ms", ms)?;
        }
        if let Some(ms) = o.watchdog_interval_ms {
            cfg.watchdog_interval = positive("watchdog_interval_ms", ms)?;
        }
        match o.keepalive_interval_ms {
            Some(0) | None => {}
            Some(ms) => {
                let timeout = match o.keepalive_timeout_ms {
                    Some(t) => positive("keepalive_timeout_ms", t)?,
                    None => DEFAULT_KEEPALIVE_TIMEOUT,
                };
                cfg.keepalive = Some(KeepaliveConfig {
                    interval: Duration::from_millis(ms),
                    timeout,
                });
            }
        }
        cfg.idle_timeout = o
            .idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        if let Some(keep) = o.keep_polling_on_push_loss {
            cfg.keep_polling_on_push_loss = keep;
        }
        Ok(cfg)
    }
}

/// Parses a JSON array of device records.
pub fn parse_records(json: &str) -> Result<Vec<DeviceRecord>, RecordError> {
    let records: Vec<DeviceRecord> = serde_json::from_str(json)?;
    for record in &records {
        record.identity()?;
    }
    Ok(records)
}

fn positive(field: &'static str, ms: u64) -> Result<Duration, RecordError> {
    if ms == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> RecordError {
    RecordError::InvalidField {
        field,
        reason: reason.into(),
    }
}
