//! Device control state shared with connected clients.
//!
//! Mirrors the control flags of the peripherals attached to the device (LED,
//! buzzer, light sensor, 7-segment display). The state lives in process
//! memory only and is initialized with defaults at startup. Mutations arrive
//! as partial mappings, merge key-wise into the stored state, and the full
//! resulting mapping is re-broadcast to every connected client. Concurrent
//! updates get last-write-wins per key, nothing stronger.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The full device state mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub led_on: bool,
    pub led_brightness: u8,
    pub buzzer_playing: bool,
    pub light_sensor_value: u32,
    pub segment_value: u8,
    pub sensor_monitoring: bool,
    pub segment_counting: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            led_on: false,
            led_brightness: 1,
            buzzer_playing: false,
            light_sensor_value: 0,
            segment_value: 0,
            sensor_monitoring: false,
            segment_counting: false,
        }
    }
}

/// A partial state mapping: only the keys present overwrite stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buzzer_playing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_sensor_value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_value: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_monitoring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_counting: Option<bool>,
}

impl DeviceState {
    /// Merge a partial update, key-wise overwrite.
    pub fn merge(&mut self, update: &DeviceStateUpdate) {
        if let Some(v) = update.led_on {
            self.led_on = v;
        }
        if let Some(v) = update.led_brightness {
            self.led_brightness = v;
        }
        if let Some(v) = update.buzzer_playing {
            self.buzzer_playing = v;
        }
        if let Some(v) = update.light_sensor_value {
            self.light_sensor_value = v;
        }
        if let Some(v) = update.segment_value {
            self.segment_value = v;
        }
        if let Some(v) = update.sensor_monitoring {
            self.sensor_monitoring = v;
        }
        if let Some(v) = update.segment_counting {
            self.segment_counting = v;
        }
    }
}

/// Holds the device state and pushes the full mapping to subscribers on
/// every mutation. New clients take a [`snapshot`](Self::snapshot) first so
/// they render without waiting for a change.
pub struct DeviceStateBroadcaster {
    state: std::sync::RwLock<DeviceState>,
    tx: broadcast::Sender<DeviceState>,
}

impl DeviceStateBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: std::sync::RwLock::new(DeviceState::default()),
            tx,
        }
    }

    /// The current full mapping.
    pub fn snapshot(&self) -> DeviceState {
        self.state.read().unwrap().clone()
    }

    /// Merge `update` into the stored state and broadcast the full resulting
    /// mapping to all subscribers. Returns the merged state.
    pub fn apply(&self, update: &DeviceStateUpdate) -> DeviceState {
        let merged = {
            let mut state = self.state.write().unwrap();
            state.merge(update);
            state.clone()
        };
        let _ = self.tx.send(merged.clone());
        merged
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceState> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for DeviceStateBroadcaster {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_matches_device_boot_values() {
        let state = DeviceState::default();
        assert!(!state.led_on);
        assert_eq!(state.led_brightness, 1);
        assert!(!state.buzzer_playing);
        assert_eq!(state.light_sensor_value, 0);
        assert_eq!(state.segment_value, 0);
    }

    #[test]
    fn test_merge_overwrites_only_present_keys() {
        let mut state = DeviceState::default();
        state.merge(&DeviceStateUpdate {
            led_on: Some(true),
            led_brightness: Some(3),
            ..Default::default()
        });

        assert!(state.led_on);
        assert_eq!(state.led_brightness, 3);
        // Untouched keys keep their values
        assert!(!state.buzzer_playing);
        assert_eq!(state.segment_value, 0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let update = DeviceStateUpdate {
            led_on: Some(true),
            ..Default::default()
        };

        let mut once = DeviceState::default();
        once.merge(&update);

        let mut twice = DeviceState::default();
        twice.merge(&update);
        twice.merge(&update);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let mut state = DeviceState::default();
        state.merge(&DeviceStateUpdate {
            segment_value: Some(4),
            ..Default::default()
        });
        state.merge(&DeviceStateUpdate {
            segment_value: Some(7),
            ..Default::default()
        });
        assert_eq!(state.segment_value, 7);
    }

    #[test]
    fn test_partial_update_deserializes_from_json() {
        let update: DeviceStateUpdate = serde_json::from_str(r#"{"led_on": true}"#).unwrap();
        assert_eq!(update.led_on, Some(true));
        assert_eq!(update.led_brightness, None);
        assert_eq!(update.segment_value, None);
    }

    #[test]
    fn test_apply_broadcasts_full_mapping_to_all_subscribers() {
        let broadcaster = DeviceStateBroadcaster::new(8);
        let mut rx_a = broadcaster.subscribe();
        let mut rx_b = broadcaster.subscribe();

        let merged = broadcaster.apply(&DeviceStateUpdate {
            led_on: Some(true),
            ..Default::default()
        });
        assert!(merged.led_on);

        let seen_a = rx_a.try_recv().unwrap();
        let seen_b = rx_b.try_recv().unwrap();
        assert!(seen_a.led_on);
        assert_eq!(seen_a, seen_b);
        assert_eq!(seen_a, broadcaster.snapshot());
    }

    #[test]
    fn test_apply_without_subscribers_still_updates_state() {
        let broadcaster = DeviceStateBroadcaster::new(8);
        broadcaster.apply(&DeviceStateUpdate {
            sensor_monitoring: Some(true),
            ..Default::default()
        });
        assert!(broadcaster.snapshot().sensor_monitoring);
    }
}
