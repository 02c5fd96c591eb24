//! Integration tests for the REST surface over real HTTP.
//!
//! Each test starts a coordinator on an ephemeral loopback port, drives it
//! with `reqwest`, and stops it when done.

use std::sync::Arc;

use serde_json::{json, Value};

use inkgate::config::ApiSettings;
use inkgate::runtime::{
    sync_handler, ActionError, BatteryState, ChargeState, DeviceDescriptor, DevicePlatform,
    Element, RegisteredAction, Runtime, SimulatedPlatform,
};
use inkgate::server::ApiCoordinator;

fn test_runtime_with_platform() -> (Arc<Runtime>, Arc<SimulatedPlatform>) {
    let platform = Arc::new(SimulatedPlatform::new());
    let runtime = Runtime::new("rest-test", platform.clone()).with_integration("api");
    runtime.screen().register_popup("settings");
    runtime.elements().register(Element::new(
        "clock",
        "DigitalClock",
        [("time".to_string(), json!("09:30"))],
    ));
    runtime.actions().register(
        RegisteredAction::new("echo", sync_handler(|kwargs| Ok(Value::Object(kwargs))))
            .accepting_any(),
    );
    runtime.actions().register(RegisteredAction::new(
        "fail",
        sync_handler(|_| Err(ActionError::Failed("boom".to_string()))),
    ));
    runtime.actions().register_group(
        "lights",
        Arc::new(|action, _options| match action {
            "toggle" => Some(
                RegisteredAction::new("lights:toggle", sync_handler(|_| Ok(Value::Null)))
                    .accepting_any(),
            ),
            _ => None,
        }),
    );
    (Arc::new(runtime), platform)
}

fn test_runtime() -> Arc<Runtime> {
    test_runtime_with_platform().0
}

/// A platform that declares no optional features at all.
struct BareProbe;

impl DevicePlatform for BareProbe {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            platform: "headless".to_string(),
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

async fn start_server(runtime: Arc<Runtime>) -> (Arc<ApiCoordinator>, String) {
    let settings = ApiSettings {
        port: 0,
        ..ApiSettings::default()
    };
    let coordinator = Arc::new(ApiCoordinator::new(runtime, &settings));
    let addr = coordinator.start().await.expect("server should bind");
    (coordinator, format!("http://{addr}/api"))
}

// ---------------------------------------------------------------------------
// 1. Liveness endpoint responds
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_liveness_endpoint_responds() {
    let (coordinator, base) = start_server(test_runtime()).await;

    let resp = reqwest::get(&base).await.expect("GET /api failed");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "API running");

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 2. Config snapshot carries the runtime description
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_snapshot_over_http() {
    let (coordinator, base) = start_server(test_runtime()).await;

    let resp = reqwest::get(format!("{base}/config")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "rest-test");
    assert_eq!(body["integrations"], json!(["api"]));
    assert!(body.get("version").is_some());
    assert!(body.get("start_time").is_some());
    assert_eq!(body["popups"]["registered_popups"], json!(["settings"]));

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 3. Device snapshot lists the simulated feature set
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_snapshot_lists_features() {
    let (coordinator, base) = start_server(test_runtime()).await;

    let resp = reqwest::get(format!("{base}/device")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["platform"], "desktop");
    let features = body["features"].as_array().expect("features array");
    assert!(features.contains(&json!("battery")));
    assert!(features.contains(&json!("network")));

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 4. Unknown routes fall through to 404
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_route_returns_404() {
    let (coordinator, base) = start_server(test_runtime()).await;

    let resp = reqwest::get(format!("{base}/does-not-exist")).await.unwrap();
    assert_eq!(resp.status(), 404);

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 5. Battery snapshot and refresh round trip
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_battery_snapshot_and_refresh() {
    let (runtime, platform) = test_runtime_with_platform();
    let (coordinator, base) = start_server(runtime).await;
    let url = format!("{base}/device/battery");

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["charge"], 100);

    platform.set_battery(BatteryState {
        state: ChargeState::Discharging,
        charge: 42,
    });
    let client = reqwest::Client::new();
    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "discharging");
    assert_eq!(body["charge"], 42);

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 6. Feature endpoints 404 on devices without the feature
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_feature_returns_404() {
    let runtime = Arc::new(Runtime::new("bare", Arc::new(BareProbe)));
    let (coordinator, base) = start_server(runtime).await;

    let resp = reqwest::get(format!("{base}/device/battery")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "device does not have the battery feature");

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 7. Shorthand action calls over HTTP
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_action_call_over_http() {
    let (coordinator, base) = start_server(test_runtime()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/actions/echo"))
        .json(&json!({"value": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "action echo called");

    let resp = client
        .post(format!("{base}/actions/bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "No Shorthand Action bogus");

    let resp = client
        .post(format!("{base}/actions/fail"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Could not call action fail: boom");

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 8. Group action calls over HTTP
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_action_call_over_http() {
    let (coordinator, base) = start_server(test_runtime()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/actions/lights/toggle"))
        .json(&json!({"data": {"room": "kitchen"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "action lights:toggle called");

    let resp = client
        .post(format!("{base}/actions/heat/up"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "No shorthand action group heat is registered");

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 9. Malformed bodies are a 400, not a crash
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_body_returns_400() {
    let (coordinator, base) = start_server(test_runtime()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/actions/echo"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "request body must be valid json");

    coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// 10. Stop ends service; a fresh start serves again
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_then_restart() {
    let (coordinator, base) = start_server(test_runtime()).await;

    let resp = reqwest::get(&base).await.unwrap();
    assert_eq!(resp.status(), 200);

    coordinator.stop().await;
    assert!(
        reqwest::get(&base).await.is_err(),
        "stopped server should refuse connections"
    );

    let addr = coordinator.start().await.expect("restart should bind");
    let resp = reqwest::get(format!("http://{addr}/api")).await.unwrap();
    assert_eq!(resp.status(), 200);

    coordinator.stop().await;
}
