//! API coordinator: server lifecycle bound to network availability, action
//! access control, and read-only snapshot builders.
//!
//! The coordinator owns the listening socket. [`ApiCoordinator::listen`]
//! re-evaluates the listen invariant on every change of the device's network
//! identity: the server accepts connections iff the device is connected and
//! the current SSID is in the allow list (an empty list allows any network).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ApiSettings;
use crate::runtime::{ActionError, FeatureError, FeatureKind, RegisteredAction, Runtime};
use crate::server::bind::{parse_bind_mode, resolve_bind_address, BindError, BindMode};
use crate::server::{rest, ws};

/// Errors that can occur when opening the listening socket.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not resolve bind address: {0}")]
    Bind(#[from] BindError),

    #[error("could not bind listener: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry entry for one open WebSocket session.
pub struct SessionHandle {
    /// Outbound frame channel, drained by the session's send task.
    pub outbound: mpsc::UnboundedSender<Message>,
    /// Close signal; the session's loops exit when it flips to `true`.
    pub close: watch::Sender<bool>,
}

/// Handle to the running listener. Present iff the server accepts connections.
struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

pub struct ApiCoordinator {
    runtime: Arc<Runtime>,
    bind: BindMode,
    port: u16,
    allowed_networks: Vec<String>,
    removed_actions: Mutex<HashSet<String>>,
    removed_groups: Mutex<HashSet<String>>,
    removed_group_actions: Mutex<HashMap<String, HashSet<String>>>,
    server: Mutex<Option<ServerHandle>>,
    enabled: watch::Sender<bool>,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl ApiCoordinator {
    pub fn new(runtime: Arc<Runtime>, settings: &ApiSettings) -> Self {
        ApiCoordinator {
            runtime,
            bind: parse_bind_mode(&settings.bind),
            port: settings.port,
            allowed_networks: settings.allowed_networks.clone(),
            removed_actions: Mutex::new(settings.remove_access.actions.iter().cloned().collect()),
            removed_groups: Mutex::new(
                settings.remove_access.action_groups.iter().cloned().collect(),
            ),
            removed_group_actions: Mutex::new(
                settings
                    .remove_access
                    .group_actions
                    .iter()
                    .map(|(group, actions)| {
                        (group.clone(), actions.iter().cloned().collect())
                    })
                    .collect(),
            ),
            server: Mutex::new(None),
            enabled: watch::channel(false).0,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    // ------------------------------------------------------------------
    // Action access control
    // ------------------------------------------------------------------

    /// Hide a shorthand action from the API. Idempotent.
    pub fn remove_action_access(&self, name: &str) {
        self.removed_actions.lock().insert(name.to_string());
    }

    /// Hide a whole action group from the API. Idempotent.
    pub fn remove_action_group_access(&self, group: &str) {
        self.removed_groups.lock().insert(group.to_string());
    }

    /// Hide a single action within a group. Idempotent.
    pub fn remove_group_action_access(&self, group: &str, name: &str) {
        self.removed_group_actions
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Look up a shorthand action, honoring the removal overlay.
    pub fn parse_shorthand_action(&self, name: &str) -> Result<RegisteredAction, ActionError> {
        if self.removed_actions.lock().contains(name) {
            return Err(ActionError::NotFound(name.to_string()));
        }
        self.runtime
            .actions()
            .shorthand(name)
            .ok_or_else(|| ActionError::NotFound(name.to_string()))
    }

    /// Resolve an action within a group, honoring the removal overlay.
    pub fn parse_group_action(
        &self,
        group: &str,
        action: &str,
        options: &Map<String, Value>,
    ) -> Result<RegisteredAction, ActionError> {
        if self.removed_groups.lock().contains(group) {
            return Err(ActionError::GroupNotFound(group.to_string()));
        }
        let resolver = self
            .runtime
            .actions()
            .group(group)
            .ok_or_else(|| ActionError::GroupNotFound(group.to_string()))?;

        let removed = self
            .removed_group_actions
            .lock()
            .get(group)
            .map_or(false, |actions| actions.contains(action));
        if removed {
            return Err(ActionError::GroupParse {
                group: group.to_string(),
                action: action.to_string(),
            });
        }

        resolver(action, options).ok_or_else(|| ActionError::GroupParse {
            group: group.to_string(),
            action: action.to_string(),
        })
    }

    /// Resolve a plain or `group:action` name.
    pub fn resolve_action(
        &self,
        name: &str,
        options: &Map<String, Value>,
    ) -> Result<RegisteredAction, ActionError> {
        match name.split_once(':') {
            Some((group, action)) => self.parse_group_action(group, action, options),
            None => self.parse_shorthand_action(name),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot builders
    // ------------------------------------------------------------------

    pub fn get_rest_config(&self) -> Value {
        let screen = self.runtime.screen();
        let main_element = screen
            .main_element()
            .map(|main| serde_json::to_value(main).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        json!({
            "name": self.runtime.name(),
            "start_time": self.runtime.start_time().to_rfc3339(),
            "platform": self.runtime.device().platform(),
            "version": self.runtime.version(),
            "integrations": self.runtime.integrations(),
            "main_element": main_element,
            "popups": {
                "current_popup": screen.current_popup(),
                "registered_popups": screen.registered_popups(),
            },
        })
    }

    pub fn get_device_config(&self) -> Value {
        serde_json::to_value(self.runtime.device().config()).unwrap_or(json!({}))
    }

    pub fn get_battery_config(&self) -> Result<Value, FeatureError> {
        self.runtime.device().feature_state(FeatureKind::Battery)
    }

    pub fn get_network_config(&self) -> Result<Value, FeatureError> {
        self.runtime.device().feature_state(FeatureKind::Network)
    }

    pub fn get_backlight_config(&self) -> Result<Value, FeatureError> {
        self.runtime.device().feature_state(FeatureKind::Backlight)
    }

    /// Visible (non-removed) shorthand and group names.
    pub fn get_actions_config(&self) -> Value {
        let removed_actions = self.removed_actions.lock();
        let shorthands: Vec<String> = self
            .runtime
            .actions()
            .shorthand_names()
            .into_iter()
            .filter(|name| !removed_actions.contains(name))
            .collect();
        drop(removed_actions);

        let removed_groups = self.removed_groups.lock();
        let groups: Vec<String> = self
            .runtime
            .actions()
            .group_names()
            .into_iter()
            .filter(|name| !removed_groups.contains(name))
            .collect();
        drop(removed_groups);

        json!({ "shorthands": shorthands, "groups": groups })
    }

    /// `{element_id: type name}` for every registered element.
    pub fn get_elements(&self) -> Value {
        serde_json::to_value(self.runtime.elements().type_names()).unwrap_or(json!({}))
    }

    pub fn get_screen_state(&self) -> Value {
        let screen = self.runtime.screen();
        let (width, height) = self.runtime.device().screen_size();
        json!({
            "size": [width, height],
            "popups_on_top": screen.popups_on_top(),
            "registered_popups": screen.registered_popups(),
            "printing": screen.printing(),
        })
    }

    // ------------------------------------------------------------------
    // Server lifecycle
    // ------------------------------------------------------------------

    fn should_listen(&self) -> bool {
        match self.runtime.device().network_state() {
            Some(network) => {
                network.connected
                    && (self.allowed_networks.is_empty()
                        || network
                            .network_ssid
                            .as_ref()
                            .map_or(false, |ssid| self.allowed_networks.contains(ssid)))
            }
            // No network feature: nothing to gate on.
            None => true,
        }
    }

    pub fn is_serving(&self) -> bool {
        self.server.lock().is_some()
    }

    /// The bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|handle| handle.local_addr)
    }

    /// Receiver that flips exactly once per serving/stopped transition.
    pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }

    fn set_enabled(&self, value: bool) {
        self.enabled.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Bind the listener and serve the merged REST + WebSocket router.
    ///
    /// Supports port 0 for ephemeral port assignment. Already serving is not
    /// an error; the bound address is returned either way.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let address = resolve_bind_address(&self.bind, self.port)?;

        let rest_router = rest::create_router(self.clone());
        let ws_router = Router::new()
            .route("/api/websocket", get(ws::ws_handler))
            .with_state(self.clone());
        let app = rest_router.merge(ws_router);

        let listener = tokio::net::TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_watch) = watch::channel(false);
        let server_task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_watch.borrow() {
                        break;
                    }
                    if shutdown_watch.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
        });

        {
            let mut server = self.server.lock();
            if server.is_some() {
                // Lost a start race; tear down the listener we just created.
                drop(server);
                let _ = shutdown_tx.send(true);
                let _ = server_task.await;
                return Ok(self.local_addr().unwrap_or(local_addr));
            }
            *server = Some(ServerHandle {
                local_addr,
                shutdown_tx,
                server_task,
            });
        }

        self.set_enabled(true);
        info!("API server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Close the listener and drain connections. No-op when already stopped.
    pub async fn stop(&self) {
        let handle = self.server.lock().take();
        let Some(handle) = handle else {
            return;
        };

        self.set_enabled(false);

        // Tell every open session the server is going away, then flip their
        // close signals so watcher loops exit at their wait points.
        {
            let sessions = self.sessions.lock();
            for session in sessions.values() {
                let _ = session
                    .outbound
                    .send(ws::closing_message(1001, "server closing"));
                let _ = session.close.send(true);
            }
        }

        let _ = handle.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), handle.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Server task returned error: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }

        info!("API server stopped");
    }

    /// Run the network-gated lifecycle: evaluate the listen invariant now and
    /// again on every network-identity change, opening or closing the server
    /// per transition. A device without a network feature serves
    /// unconditionally and this returns after opening.
    pub async fn listen(self: Arc<Self>) {
        let mut network_rx = self.runtime.device().subscribe_network();
        loop {
            if self.should_listen() {
                if !self.is_serving() {
                    if let Err(err) = self.start().await {
                        warn!("could not start API server: {}", err);
                    }
                }
            } else if self.is_serving() {
                self.stop().await;
            }

            match network_rx.as_mut() {
                Some(rx) => {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Open session registry
    // ------------------------------------------------------------------

    pub fn register_session(&self, id: Uuid, handle: SessionHandle) {
        self.sessions.lock().insert(id, handle);
    }

    pub fn unregister_session(&self, id: &Uuid) {
        self.sessions.lock().remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{sync_handler, NetworkState};

    fn test_runtime() -> Arc<Runtime> {
        let runtime = Runtime::simulated("testboard").with_integration("api");
        runtime.actions().register(RegisteredAction::new(
            "beep",
            sync_handler(|_| Ok(Value::Null)),
        ));
        runtime.actions().register_group(
            "lights",
            Arc::new(|action, _options| {
                (action == "toggle").then(|| {
                    RegisteredAction::new("lights:toggle", sync_handler(|_| Ok(Value::Null)))
                        .accepting_any()
                })
            }),
        );
        runtime.screen().register_popup("settings");
        Arc::new(runtime)
    }

    fn test_settings() -> ApiSettings {
        ApiSettings {
            port: 0,
            ..Default::default()
        }
    }

    fn coordinator() -> Arc<ApiCoordinator> {
        Arc::new(ApiCoordinator::new(test_runtime(), &test_settings()))
    }

    fn connected(ssid: &str) -> NetworkState {
        NetworkState {
            ip_address: "192.168.1.20".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            network_ssid: Some(ssid.to_string()),
            signal: Some(60),
            connected: true,
        }
    }

    fn disconnected() -> NetworkState {
        NetworkState {
            ip_address: String::new(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            network_ssid: None,
            signal: None,
            connected: false,
        }
    }

    #[test]
    fn removed_action_is_not_parseable() {
        let c = coordinator();
        assert!(c.parse_shorthand_action("beep").is_ok());

        c.remove_action_access("beep");
        c.remove_action_access("beep");
        let err = c.parse_shorthand_action("beep").unwrap_err();
        assert_eq!(err.to_string(), "No Shorthand Action beep");

        // Unrelated actions are unaffected.
        c.runtime().actions().register(RegisteredAction::new(
            "boop",
            sync_handler(|_| Ok(Value::Null)),
        ));
        assert!(c.parse_shorthand_action("boop").is_ok());
    }

    #[test]
    fn group_parse_distinguishes_unknown_group_from_unparsable_action() {
        let c = coordinator();
        let options = Map::new();

        assert!(c.parse_group_action("lights", "toggle", &options).is_ok());

        let err = c.parse_group_action("nope", "toggle", &options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No shorthand action group nope is registered"
        );

        let err = c.parse_group_action("lights", "dim", &options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Shorthand action group lights could not parse dim"
        );
    }

    #[test]
    fn removed_group_action_reads_as_unparsable() {
        let c = coordinator();
        let options = Map::new();
        c.remove_group_action_access("lights", "toggle");

        let err = c
            .parse_group_action("lights", "toggle", &options)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Shorthand action group lights could not parse toggle"
        );
    }

    #[test]
    fn removed_group_is_gone_entirely() {
        let c = coordinator();
        let options = Map::new();
        c.remove_action_group_access("lights");

        let err = c
            .parse_group_action("lights", "toggle", &options)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "No shorthand action group lights is registered"
        );
        assert_eq!(c.get_actions_config()["groups"], json!([]));
    }

    #[test]
    fn resolve_action_splits_group_names() {
        let c = coordinator();
        let options = Map::new();
        assert!(c.resolve_action("beep", &options).is_ok());
        assert!(c.resolve_action("lights:toggle", &options).is_ok());
        assert!(c.resolve_action("lights:dim", &options).is_err());
    }

    #[test]
    fn actions_config_lists_visible_names() {
        let c = coordinator();
        let config = c.get_actions_config();
        assert_eq!(config["shorthands"], json!(["beep"]));
        assert_eq!(config["groups"], json!(["lights"]));

        c.remove_action_access("beep");
        assert_eq!(c.get_actions_config()["shorthands"], json!([]));
    }

    #[test]
    fn rest_config_snapshot_shape() {
        let c = coordinator();
        let config = c.get_rest_config();
        assert_eq!(config["name"], "testboard");
        assert_eq!(config["platform"], "desktop");
        assert_eq!(config["integrations"], json!(["api"]));
        assert!(config["main_element"].is_null());
        assert_eq!(config["popups"]["current_popup"], Value::Null);
        assert_eq!(config["popups"]["registered_popups"], json!(["settings"]));
        assert!(config["start_time"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn screen_state_snapshot_shape() {
        let c = coordinator();
        let state = c.get_screen_state();
        assert_eq!(state["size"], json!([1280, 720]));
        assert_eq!(state["popups_on_top"], json!([]));
        assert_eq!(state["printing"], json!(true));
    }

    #[test]
    fn listen_invariant_checks_ssid_allow_list() {
        let runtime = test_runtime();
        let settings = ApiSettings {
            port: 0,
            allowed_networks: vec!["homenet".to_string()],
            ..Default::default()
        };
        let c = ApiCoordinator::new(runtime.clone(), &settings);

        // Simulated platform starts on the "simulated" SSID.
        assert!(!c.should_listen());

        runtime.device().update_network(connected("homenet")).unwrap();
        assert!(c.should_listen());

        runtime.device().update_network(disconnected()).unwrap();
        assert!(!c.should_listen());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listen_follows_network_transitions() {
        let runtime = test_runtime();
        let c = Arc::new(ApiCoordinator::new(runtime.clone(), &test_settings()));
        let mut enabled = c.subscribe_enabled();
        assert!(!*enabled.borrow());

        let listen_task = tokio::spawn(c.clone().listen());

        tokio::time::timeout(Duration::from_secs(5), enabled.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*enabled.borrow_and_update());
        assert!(c.is_serving());

        runtime.device().update_network(disconnected()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), enabled.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!*enabled.borrow_and_update());
        assert!(!c.is_serving());

        runtime.device().update_network(connected("anynet")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), enabled.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*enabled.borrow_and_update());

        listen_task.abort();
        c.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_idempotent_and_start_reuses_the_listener() {
        let c = coordinator();
        c.stop().await;

        let addr = c.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        let again = c.start().await.unwrap();
        assert_eq!(addr, again);

        c.stop().await;
        c.stop().await;
        assert!(!c.is_serving());
    }
}
