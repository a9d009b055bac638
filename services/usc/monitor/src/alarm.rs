//! Per-device alarm tracking built from error events

use crate::dispatcher::MonitorListener;
use crate::event::{ErrorLevel, EventKind, MonitorEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use usc_wire::ErrorCode;
use uuid::Uuid;

/// One recorded error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alarm {
    /// Id of the originating error event
    pub error_id: Uuid,
    /// Session the error belongs to, `None` for channel errors
    pub session_id: Option<u32>,
    /// Taxonomy code
    pub error_code: ErrorCode,
    /// Severity
    pub level: ErrorLevel,
    /// Description
    pub message: String,
    /// When the error was reported
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceAlarms {
    /// Most recent alarms, oldest first
    recent: VecDeque<Alarm>,
    /// Errors counted in the current window
    window_count: u32,
    /// Start of the current window
    window_start: Instant,
}

/// Keeps the most recent error events per device
#[derive(Debug)]
pub struct AlarmTracker {
    devices: RwLock<HashMap<String, DeviceAlarms>>,
    /// Maximum alarms retained per device
    max_error_number: usize,
    /// Time window for error counting
    window: Duration,
}

impl AlarmTracker {
    /// Create a tracker keeping up to `max_error_number` alarms per device
    pub fn new(max_error_number: usize, window: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            max_error_number: max_error_number.max(1),
            window,
        }
    }

    /// Record an error event; returns the device's count in the current window
    pub async fn record(&self, device_id: &str, alarm: Alarm) -> u32 {
        let mut devices = self.devices.write().await;
        let now = Instant::now();

        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceAlarms {
                recent: VecDeque::new(),
                window_count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) > self.window {
            entry.window_count = 1;
            entry.window_start = now;
        } else {
            entry.window_count += 1;
        }

        if entry.recent.len() == self.max_error_number {
            entry.recent.pop_front();
        }
        entry.recent.push_back(alarm);

        if entry.window_count as usize == self.max_error_number {
            warn!(
                "Device {} reported {} errors within {:?}",
                device_id, entry.window_count, self.window
            );
        }
        debug!("Recorded alarm for {} (count: {})", device_id, entry.window_count);
        entry.window_count
    }

    /// Retained alarms for a device, oldest first
    pub async fn alarms(&self, device_id: &str) -> Vec<Alarm> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .map(|entry| entry.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Errors counted for a device in the current window
    pub async fn error_count(&self, device_id: &str) -> u32 {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .filter(|entry| entry.window_start.elapsed() <= self.window)
            .map(|entry| entry.window_count)
            .unwrap_or(0)
    }

    /// Forget everything recorded for a device; returns whether it had alarms
    pub async fn clear(&self, device_id: &str) -> bool {
        self.devices.write().await.remove(device_id).is_some()
    }

    /// Devices with at least one retained alarm
    pub async fn devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl MonitorListener for AlarmTracker {
    fn name(&self) -> &str {
        "alarm-tracker"
    }

    async fn on_event(&self, event: Arc<MonitorEvent>) -> anyhow::Result<()> {
        if let Some(error) = event.kind.error() {
            let alarm = Alarm {
                error_id: error.error_id,
                session_id: event.kind.session_id(),
                error_code: error.error_code,
                level: error.level,
                message: error.message.clone(),
                raised_at: event.timestamp,
            };
            self.record(&event.device_id, alarm).await;
        } else if let EventKind::ChannelCreate { .. } = event.kind {
            // A fresh channel starts a fresh window; history is kept
            let mut devices = self.devices.write().await;
            if let Some(entry) = devices.get_mut(&event.device_id) {
                entry.window_count = 0;
                entry.window_start = Instant::now();
            }
        }
        Ok(())
    }
}
