//! Simulated devices: one strategy that can play every connection pattern,
//! failing at a configurable rate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use devlink_supervisor::{
    ConnectionStrategy, DeviceRecord, HookFuture, LinkContext, LinkError, Pattern, RawMessage,
};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("device {device}: unknown pattern `{pattern}`")]
    UnknownPattern { device: String, pattern: String },

    #[error("device {device}: bad simulator settings: {source}")]
    Settings {
        device: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Simulator knobs read from a record's `settings`.
#[derive(Debug, Clone, Deserialize)]
struct SimSettings {
    pattern: String,
    #[serde(default)]
    fail_rate: f64,
    #[serde(default = "default_latency_ms")]
    latency_ms: u64,
    #[serde(default = "default_message_every_ms")]
    message_every_ms: u64,
}

fn default_latency_ms() -> u64 {
    50
}

fn default_message_every_ms() -> u64 {
    2000
}

fn parse_pattern(name: &str) -> Option<Pattern> {
    Some(match name {
        "stateless" => Pattern::StatelessRequest,
        "polling" => Pattern::Polling,
        "socket" => Pattern::PersistentSocket,
        "external" => Pattern::ExternalClient,
        "hybrid" => Pattern::HybridPushPoll,
        _ => return None,
    })
}

/// Builds the simulated strategy described by `record.settings`.
pub fn build(record: &DeviceRecord) -> Result<Arc<SimDevice>, SimError> {
    let settings: SimSettings =
        serde_json::from_value(record.settings.clone()).map_err(|source| SimError::Settings {
            device: record.id.clone(),
            source,
        })?;
    let pattern = parse_pattern(&settings.pattern).ok_or_else(|| SimError::UnknownPattern {
        device: record.id.clone(),
        pattern: settings.pattern.clone(),
    })?;

    Ok(Arc::new(SimDevice {
        pattern,
        fail_rate: settings.fail_rate.clamp(0.0, 1.0),
        latency: Duration::from_millis(settings.latency_ms),
        message_every: Duration::from_millis(settings.message_every_ms),
        alive: Arc::new(AtomicBool::new(false)),
        counter: AtomicU64::new(0),
        client: Mutex::new(None),
    }))
}

pub struct SimDevice {
    pattern: Pattern,
    fail_rate: f64,
    latency: Duration,
    message_every: Duration,
    /// The simulated external client's own view of its connection.
    alive: Arc<AtomicBool>,
    counter: AtomicU64,
    client: Mutex<Option<JoinHandle<()>>>,
}

impl SimDevice {
    fn roll(&self, rate: f64) -> bool {
        rand::random::<f64>() < rate
    }

    async fn flaky(&self, hook: &'static str) -> Result<(), LinkError> {
        tokio::time::sleep(self.latency).await;
        if self.roll(self.fail_rate) {
            debug!(hook, "simulated failure");
            return Err(LinkError::Unreachable(format!("simulated {hook} failure")));
        }
        Ok(())
    }

    fn reading(&self) -> serde_json::Value {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let temperature = 18.0 + rand::random::<f64>() * 8.0;
        json!({ "seq": n, "temperature": (temperature * 10.0).round() / 10.0 })
    }

    fn stop_client(&self) {
        if let Ok(mut guard) = self.client.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}

impl ConnectionStrategy for SimDevice {
    fn pattern(&self) -> Pattern {
        self.pattern
    }

    fn probe_reachable(&self) -> HookFuture<'_, ()> {
        Box::pin(self.flaky("probe_reachable"))
    }

    fn open_session(&self) -> HookFuture<'_, ()> {
        Box::pin(self.flaky("open_session"))
    }

    fn poll_once<'a>(&'a self, ctx: &'a LinkContext) -> HookFuture<'a, ()> {
        Box::pin(async move {
            self.flaky("poll_once").await?;
            ctx.emit_update(self.reading());
            Ok(())
        })
    }

    fn open_socket(&self) -> HookFuture<'_, ()> {
        Box::pin(self.flaky("open_socket"))
    }

    fn receive_one(&self) -> HookFuture<'_, Option<RawMessage>> {
        Box::pin(async move {
            tokio::time::sleep(self.message_every).await;
            if self.roll(self.fail_rate / 4.0) {
                return Ok(None);
            }
            if self.roll(self.fail_rate / 8.0) {
                return Ok(Some(RawMessage::Text("{garbled".into())));
            }
            Ok(Some(RawMessage::Text(self.reading().to_string())))
        })
    }

    fn handle_message<'a>(&'a self, raw: RawMessage, ctx: &'a LinkContext) -> HookFuture<'a, ()> {
        Box::pin(async move {
            let text = raw
                .as_text()
                .ok_or_else(|| LinkError::Protocol("binary frame on a text channel".into()))?;
            let payload: serde_json::Value =
                serde_json::from_str(text).map_err(|e| LinkError::Protocol(e.to_string()))?;
            trace!(device = ctx.device_id(), "message decoded");
            ctx.emit_update(payload);
            Ok(())
        })
    }

    fn send_keepalive(&self) -> HookFuture<'_, ()> {
        Box::pin(self.flaky("send_keepalive"))
    }

    fn create_external_client(&self) -> HookFuture<'_, ()> {
        Box::pin(async move {
            self.flaky("create_external_client").await?;
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn bind_client_events(&self, ctx: LinkContext) -> HookFuture<'_, ()> {
        Box::pin(async move {
            self.stop_client();
            ctx.request_config_update(json!({ "session_token": format!("sim-{}", rand::random::<u32>()) }));

            let alive = Arc::clone(&self.alive);
            let every = self.message_every;
            let drop_rate = self.fail_rate / 10.0;
            let task = tokio::spawn(async move {
                let mut seq: u64 = 0;
                loop {
                    tokio::time::sleep(every).await;
                    if alive.load(Ordering::SeqCst) {
                        seq += 1;
                        ctx.emit_update(json!({ "frame": seq }));
                        if rand::random::<f64>() < drop_rate {
                            alive.store(false, Ordering::SeqCst);
                        }
                    } else if rand::random::<f64>() < 0.5 {
                        // The client reconnects on its own.
                        alive.store(true, Ordering::SeqCst);
                    }
                }
            });
            if let Ok(mut guard) = self.client.lock() {
                *guard = Some(task);
            }
            Ok(())
        })
    }

    fn unbind_client_events(&self) -> HookFuture<'_, ()> {
        Box::pin(async move {
            self.stop_client();
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_client_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
