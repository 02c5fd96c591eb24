//! Device model: feature states, change triggers, and the platform probe seam.
//!
//! A [`Device`] owns one `tokio::sync::watch` cell per supported feature. The
//! cell's sender side is the host's write path; API watchers subscribe to the
//! receiver side and diff snapshots on wake. Re-measurement (battery, network)
//! goes through the [`DevicePlatform`] trait so the crate can run against a
//! real platform integration or the simulated one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

/// Named device capability exposed through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Battery,
    Network,
    Backlight,
    Rotation,
    Resize,
}

impl FeatureKind {
    /// Stable listing order for `features` arrays.
    pub const ALL: [FeatureKind; 5] = [
        FeatureKind::Battery,
        FeatureKind::Network,
        FeatureKind::Backlight,
        FeatureKind::Rotation,
        FeatureKind::Resize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Battery => "battery",
            FeatureKind::Network => "network",
            FeatureKind::Backlight => "backlight",
            FeatureKind::Rotation => "rotation",
            FeatureKind::Resize => "resize",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKind {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "battery" => Ok(FeatureKind::Battery),
            "network" => Ok(FeatureKind::Network),
            "backlight" => Ok(FeatureKind::Backlight),
            "rotation" => Ok(FeatureKind::Rotation),
            "resize" => Ok(FeatureKind::Resize),
            other => Err(FeatureError::Unknown(other.to_string())),
        }
    }
}

/// Errors for feature reads, watches, and probes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    /// The name does not refer to any feature the API knows about.
    #[error("unknown feature {0}")]
    Unknown(String),

    /// The feature exists but this device does not have it.
    #[error("device does not have the {0} feature")]
    Unsupported(FeatureKind),

    /// The feature's state is fixed for this device; there is nothing to watch.
    #[error("feature {0} is not watchable")]
    NotWatchable(FeatureKind),

    /// The platform probe failed to produce a reading.
    #[error("could not read {feature} state: {message}")]
    Probe {
        feature: FeatureKind,
        message: String,
    },
}

/// Battery charge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeState {
    Full,
    Charging,
    Discharging,
}

/// Battery snapshot: `{"state": "full"|"charging"|"discharging", "charge": 0-100}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryState {
    pub state: ChargeState,
    pub charge: u8,
}

/// Network identity snapshot.
///
/// `connected` drives the server's listen gate but is not part of the
/// serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkState {
    pub ip_address: String,
    pub mac_address: String,
    pub network_ssid: Option<String>,
    pub signal: Option<u8>,
    #[serde(skip_serializing)]
    pub connected: bool,
}

/// Backlight behaviour setting, serialized with the display names clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BacklightBehaviour {
    Manual,
    #[serde(rename = "On Interact")]
    OnInteract,
    Always,
}

/// Backlight snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacklightState {
    pub state: bool,
    pub brightness: u8,
    pub behaviour: BacklightBehaviour,
    pub default_time_on: f64,
    pub default_brightness: u8,
    pub default_transition: f64,
}

/// Static description of a device plus the initial state of every feature it
/// supports. Features left `None` are unsupported on this device.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub platform: String,
    pub model: Option<String>,
    pub name: Option<String>,
    pub screen_size: (u32, u32),
    pub screen_type: Option<String>,
    pub screen_mode: String,
    pub rotation: Option<String>,
    pub battery: Option<BatteryState>,
    pub network: Option<NetworkState>,
    pub backlight: Option<BacklightState>,
    /// Whether the screen size can change at runtime (the `resize` feature).
    pub resizable: bool,
    /// Supported features whose state never changes; watch requests are refused.
    pub fixed_features: Vec<FeatureKind>,
}

/// Trait for platform integrations (desktop, e-reader, simulated).
///
/// Implementations describe the device once at startup and re-measure
/// individual features on demand. Poll methods are only called for features
/// the descriptor declared.
#[async_trait]
pub trait DevicePlatform: Send + Sync {
    fn descriptor(&self) -> DeviceDescriptor;

    async fn poll_battery(&self) -> Result<BatteryState, FeatureError> {
        Err(FeatureError::Unsupported(FeatureKind::Battery))
    }

    async fn poll_network(&self) -> Result<NetworkState, FeatureError> {
        Err(FeatureError::Unsupported(FeatureKind::Network))
    }
}

/// Serialized `device_config` payload.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceConfig {
    pub platform: String,
    pub model: Option<String>,
    pub name: Option<String>,
    pub size: (u32, u32),
    pub screen_type: Option<String>,
    pub screen_mode: String,
    pub rotation: Option<String>,
    pub features: Vec<&'static str>,
}

/// The device half of the host runtime.
pub struct Device {
    probe: Arc<dyn DevicePlatform>,
    platform: String,
    model: Option<String>,
    name: Option<String>,
    screen_type: Option<String>,
    screen_mode: String,
    resizable: bool,
    fixed_features: Vec<FeatureKind>,
    size: watch::Sender<(u32, u32)>,
    battery: Option<watch::Sender<BatteryState>>,
    network: Option<watch::Sender<NetworkState>>,
    backlight: Option<watch::Sender<BacklightState>>,
    rotation: Option<watch::Sender<String>>,
}

impl Device {
    pub fn new(probe: Arc<dyn DevicePlatform>) -> Self {
        let desc = probe.descriptor();
        Device {
            probe,
            platform: desc.platform,
            model: desc.model,
            name: desc.name,
            screen_type: desc.screen_type,
            screen_mode: desc.screen_mode,
            resizable: desc.resizable,
            fixed_features: desc.fixed_features,
            size: watch::channel(desc.screen_size).0,
            battery: desc.battery.map(|s| watch::channel(s).0),
            network: desc.network.map(|s| watch::channel(s).0),
            backlight: desc.backlight.map(|s| watch::channel(s).0),
            rotation: desc.rotation.map(|s| watch::channel(s).0),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn screen_size(&self) -> (u32, u32) {
        *self.size.borrow()
    }

    pub fn has_feature(&self, kind: FeatureKind) -> bool {
        match kind {
            FeatureKind::Battery => self.battery.is_some(),
            FeatureKind::Network => self.network.is_some(),
            FeatureKind::Backlight => self.backlight.is_some(),
            FeatureKind::Rotation => self.rotation.is_some(),
            FeatureKind::Resize => self.resizable,
        }
    }

    /// Names of every supported feature, in stable order.
    pub fn features(&self) -> Vec<&'static str> {
        FeatureKind::ALL
            .iter()
            .filter(|kind| self.has_feature(**kind))
            .map(|kind| kind.as_str())
            .collect()
    }

    /// Serialized `device_config` payload.
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            platform: self.platform.clone(),
            model: self.model.clone(),
            name: self.name.clone(),
            size: *self.size.borrow(),
            screen_type: self.screen_type.clone(),
            screen_mode: self.screen_mode.clone(),
            rotation: self.rotation.as_ref().map(|cell| cell.borrow().clone()),
            features: self.features(),
        }
    }

    /// Current JSON snapshot of one feature's state.
    pub fn feature_state(&self, kind: FeatureKind) -> Result<Value, FeatureError> {
        match kind {
            FeatureKind::Battery => self
                .battery
                .as_ref()
                .map(|cell| state_value(&*cell.borrow())),
            FeatureKind::Network => self
                .network
                .as_ref()
                .map(|cell| state_value(&*cell.borrow())),
            FeatureKind::Backlight => self
                .backlight
                .as_ref()
                .map(|cell| state_value(&*cell.borrow())),
            FeatureKind::Rotation => self
                .rotation
                .as_ref()
                .map(|cell| rotation_value(&cell.borrow())),
            FeatureKind::Resize => self.resizable.then(|| size_value(*self.size.borrow())),
        }
        .ok_or(FeatureError::Unsupported(kind))
    }

    /// Subscribe to one feature's change trigger.
    pub fn watch_feature(&self, kind: FeatureKind) -> Result<FeatureWatch, FeatureError> {
        if !self.has_feature(kind) {
            return Err(FeatureError::Unsupported(kind));
        }
        if self.fixed_features.contains(&kind) {
            return Err(FeatureError::NotWatchable(kind));
        }
        let unsupported = FeatureError::Unsupported(kind);
        let inner = match kind {
            FeatureKind::Battery => {
                WatchInner::Battery(self.battery.as_ref().ok_or(unsupported)?.subscribe())
            }
            FeatureKind::Network => {
                WatchInner::Network(self.network.as_ref().ok_or(unsupported)?.subscribe())
            }
            FeatureKind::Backlight => {
                WatchInner::Backlight(self.backlight.as_ref().ok_or(unsupported)?.subscribe())
            }
            FeatureKind::Rotation => {
                WatchInner::Rotation(self.rotation.as_ref().ok_or(unsupported)?.subscribe())
            }
            FeatureKind::Resize => WatchInner::Size(self.size.subscribe()),
        };
        Ok(FeatureWatch { kind, inner })
    }

    /// Re-measure the battery through the platform probe and publish the result.
    pub async fn refresh_battery(&self) -> Result<BatteryState, FeatureError> {
        let cell = self
            .battery
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Battery))?;
        let state = self.probe.poll_battery().await?;
        cell.send_replace(state.clone());
        Ok(state)
    }

    /// Re-measure the network identity through the platform probe and publish it.
    pub async fn refresh_network(&self) -> Result<NetworkState, FeatureError> {
        let cell = self
            .network
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Network))?;
        let state = self.probe.poll_network().await?;
        cell.send_replace(state.clone());
        Ok(state)
    }

    /// Host write path: publish a new battery state, waking feature watchers.
    pub fn update_battery(&self, state: BatteryState) -> Result<(), FeatureError> {
        self.battery
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Battery))?
            .send_replace(state);
        Ok(())
    }

    /// Host write path: publish a new network identity. The server's listen
    /// loop re-evaluates on every call.
    pub fn update_network(&self, state: NetworkState) -> Result<(), FeatureError> {
        self.network
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Network))?
            .send_replace(state);
        Ok(())
    }

    /// Host write path: publish a new backlight state.
    pub fn update_backlight(&self, state: BacklightState) -> Result<(), FeatureError> {
        self.backlight
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Backlight))?
            .send_replace(state);
        Ok(())
    }

    /// Host write path: publish a new rotation.
    pub fn update_rotation(&self, rotation: impl Into<String>) -> Result<(), FeatureError> {
        self.rotation
            .as_ref()
            .ok_or(FeatureError::Unsupported(FeatureKind::Rotation))?
            .send_replace(rotation.into());
        Ok(())
    }

    /// Host write path: publish a new screen size, waking `resize` watchers.
    pub fn set_screen_size(&self, size: (u32, u32)) {
        self.size.send_replace(size);
    }

    pub fn network_state(&self) -> Option<NetworkState> {
        self.network.as_ref().map(|cell| cell.borrow().clone())
    }

    /// Receiver for network-identity changes, used by the listen loop.
    pub fn subscribe_network(&self) -> Option<watch::Receiver<NetworkState>> {
        self.network.as_ref().map(|cell| cell.subscribe())
    }
}

/// A live subscription to one feature's change trigger.
///
/// Watcher loops await [`FeatureWatch::changed`] and then re-read
/// [`FeatureWatch::snapshot`], comparing against the last pushed value. The
/// trigger may fire without a real change; the diff belongs to the caller.
#[derive(Debug)]
pub struct FeatureWatch {
    kind: FeatureKind,
    inner: WatchInner,
}

#[derive(Debug)]
enum WatchInner {
    Battery(watch::Receiver<BatteryState>),
    Network(watch::Receiver<NetworkState>),
    Backlight(watch::Receiver<BacklightState>),
    Rotation(watch::Receiver<String>),
    Size(watch::Receiver<(u32, u32)>),
}

impl FeatureWatch {
    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    /// Current payload, same shape as [`Device::feature_state`].
    pub fn snapshot(&self) -> Value {
        match &self.inner {
            WatchInner::Battery(rx) => state_value(&*rx.borrow()),
            WatchInner::Network(rx) => state_value(&*rx.borrow()),
            WatchInner::Backlight(rx) => state_value(&*rx.borrow()),
            WatchInner::Rotation(rx) => rotation_value(&rx.borrow()),
            WatchInner::Size(rx) => size_value(*rx.borrow()),
        }
    }

    /// Wait for the next trigger. Errors when the device is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        match &mut self.inner {
            WatchInner::Battery(rx) => rx.changed().await,
            WatchInner::Network(rx) => rx.changed().await,
            WatchInner::Backlight(rx) => rx.changed().await,
            WatchInner::Rotation(rx) => rx.changed().await,
            WatchInner::Size(rx) => rx.changed().await,
        }
    }
}

fn state_value<T: Serialize>(state: &T) -> Value {
    serde_json::to_value(state).unwrap_or(json!({}))
}

fn rotation_value(rotation: &str) -> Value {
    json!({ "rotation": rotation })
}

fn size_value(size: (u32, u32)) -> Value {
    json!({ "size": [size.0, size.1] })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareScreen;

    impl DevicePlatform for BareScreen {
        fn descriptor(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                platform: "bare".to_string(),
                model: None,
                name: None,
                screen_size: (800, 600),
                screen_type: None,
                screen_mode: "L".to_string(),
                rotation: None,
                battery: None,
                network: None,
                backlight: None,
                resizable: false,
                fixed_features: Vec::new(),
            }
        }
    }

    struct FixedBattery;

    impl DevicePlatform for FixedBattery {
        fn descriptor(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                platform: "fixed".to_string(),
                model: None,
                name: None,
                screen_size: (100, 100),
                screen_type: None,
                screen_mode: "L".to_string(),
                rotation: None,
                battery: Some(BatteryState {
                    state: ChargeState::Full,
                    charge: 100,
                }),
                network: None,
                backlight: None,
                resizable: false,
                fixed_features: vec![FeatureKind::Battery],
            }
        }
    }

    #[test]
    fn feature_names_parse_and_roundtrip() {
        for kind in FeatureKind::ALL {
            assert_eq!(kind.as_str().parse::<FeatureKind>().unwrap(), kind);
        }
        let err = "thermal".parse::<FeatureKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown feature thermal");
    }

    #[test]
    fn bare_device_reports_no_features() {
        let device = Device::new(Arc::new(BareScreen));
        assert!(device.features().is_empty());
        assert!(!device.has_feature(FeatureKind::Battery));

        let err = device.feature_state(FeatureKind::Battery).unwrap_err();
        assert_eq!(
            err.to_string(),
            "device does not have the battery feature"
        );
    }

    #[test]
    fn device_config_includes_rotation_only_when_supported() {
        let device = Device::new(Arc::new(BareScreen));
        let config = device.config();
        assert_eq!(config.rotation, None);
        assert_eq!(config.size, (800, 600));
    }

    #[test]
    fn fixed_feature_refuses_watch_but_allows_read() {
        let device = Device::new(Arc::new(FixedBattery));
        assert!(device.feature_state(FeatureKind::Battery).is_ok());

        let err = device.watch_feature(FeatureKind::Battery).unwrap_err();
        assert_eq!(err, FeatureError::NotWatchable(FeatureKind::Battery));
    }

    #[tokio::test]
    async fn update_battery_wakes_watchers() {
        let device = Device::new(Arc::new(FixedBatteryWithoutFix));
        let mut watch = device.watch_feature(FeatureKind::Battery).unwrap();
        let before = watch.snapshot();

        device
            .update_battery(BatteryState {
                state: ChargeState::Discharging,
                charge: 80,
            })
            .unwrap();

        watch.changed().await.unwrap();
        let after = watch.snapshot();
        assert_ne!(before, after);
        assert_eq!(after["charge"], 80);
        assert_eq!(after["state"], "discharging");
    }

    struct FixedBatteryWithoutFix;

    impl DevicePlatform for FixedBatteryWithoutFix {
        fn descriptor(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                fixed_features: Vec::new(),
                ..FixedBattery.descriptor()
            }
        }
    }

    #[test]
    fn battery_state_serializes_lowercase() {
        let payload = state_value(&BatteryState {
            state: ChargeState::Charging,
            charge: 42,
        });
        assert_eq!(payload, json!({"state": "charging", "charge": 42}));
    }

    #[test]
    fn network_payload_skips_listen_gate_field() {
        let payload = state_value(&NetworkState {
            ip_address: "192.168.1.20".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            network_ssid: Some("homenet".to_string()),
            signal: Some(70),
            connected: true,
        });
        assert!(payload.get("connected").is_none());
        assert_eq!(payload["network_ssid"], "homenet");
    }

    #[test]
    fn backlight_behaviour_uses_display_names() {
        let payload = state_value(&BacklightState {
            state: true,
            brightness: 60,
            behaviour: BacklightBehaviour::OnInteract,
            default_time_on: 30.0,
            default_brightness: 80,
            default_transition: 0.5,
        });
        assert_eq!(payload["behaviour"], "On Interact");
    }
}
