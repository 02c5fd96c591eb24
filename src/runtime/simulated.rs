//! Simulated desktop platform used by the binary and the test suites.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::device::{
    BacklightBehaviour, BacklightState, BatteryState, ChargeState, DeviceDescriptor,
    DevicePlatform, FeatureError, NetworkState,
};

/// A desktop-style device with every feature enabled.
///
/// Probe readings come from interior knobs so callers can steer what the next
/// refresh reports.
pub struct SimulatedPlatform {
    battery: Mutex<BatteryState>,
    network: Mutex<NetworkState>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        SimulatedPlatform {
            battery: Mutex::new(BatteryState {
                state: ChargeState::Full,
                charge: 100,
            }),
            network: Mutex::new(NetworkState {
                ip_address: "127.0.0.1".to_string(),
                mac_address: "00:00:00:00:00:00".to_string(),
                network_ssid: Some("simulated".to_string()),
                signal: Some(100),
                connected: true,
            }),
        }
    }

    /// Steer what the next battery poll reports.
    pub fn set_battery(&self, state: BatteryState) {
        *self.battery.lock() = state;
    }

    /// Steer what the next network poll reports.
    pub fn set_network(&self, state: NetworkState) {
        *self.network.lock() = state;
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePlatform for SimulatedPlatform {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            platform: "desktop".to_string(),
            model: Some("simulator".to_string()),
            name: Some("inkgate-sim".to_string()),
            screen_size: (1280, 720),
            screen_type: Some("LCD".to_string()),
            screen_mode: "RGB".to_string(),
            rotation: Some("UR".to_string()),
            battery: Some(self.battery.lock().clone()),
            network: Some(self.network.lock().clone()),
            backlight: Some(BacklightState {
                state: false,
                brightness: 0,
                behaviour: BacklightBehaviour::Manual,
                default_time_on: 30.0,
                default_brightness: 100,
                default_transition: 0.25,
            }),
            resizable: true,
            fixed_features: Vec::new(),
        }
    }

    async fn poll_battery(&self) -> Result<BatteryState, FeatureError> {
        Ok(self.battery.lock().clone())
    }

    async fn poll_network(&self) -> Result<NetworkState, FeatureError> {
        Ok(self.network.lock().clone())
    }
}
