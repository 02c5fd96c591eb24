//! WebSocket surface: the JSON getter/watcher/action protocol.
//!
//! One session per connection. Inbound frames carry a strictly increasing
//! integer `id`; getters answer synchronously, `watch_*` requests spawn a
//! background task that pushes a frame whenever the observed value actually
//! changes, and `call_action` runs the shared action contract.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::runtime::{ActionError, Element, FeatureKind, FeatureWatch, TouchEvent};
use crate::server::coordinator::{ApiCoordinator, SessionHandle};

/// Every message type the dispatcher understands.
const MESSAGE_TYPES: [&str; 12] = [
    "get_config",
    "get_device_config",
    "get_elements",
    "get_actions",
    "get_element_state",
    "get_feature_state",
    "get_screen_state",
    "watch_element",
    "watch_popups",
    "watch_device_feature",
    "watch_interaction",
    "call_action",
];

const ERROR_INVALID_JSON: &str = "message must be valid json";
const ERROR_MISSING_ID: &str = "a message must contain the id parameter";
const ERROR_STALE_ID: &str = "message id must be larger than the previous message";
const ERROR_MISSING_TYPE: &str = "messages must have a type key";

#[derive(Debug, Serialize)]
struct ConnectionFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    inkboard_version: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct ResultFrame<'a> {
    id: u64,
    #[serde(rename = "type")]
    frame_type: &'a str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Request frame body, after the envelope checks have passed.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    GetConfig,
    GetDeviceConfig,
    GetElements,
    GetActions,
    GetElementState {
        element_id: String,
        #[serde(default)]
        properties: Option<Vec<String>>,
    },
    GetFeatureState {
        feature: String,
    },
    GetScreenState,
    WatchElement {
        element_id: String,
        properties: Vec<String>,
    },
    WatchPopups,
    WatchDeviceFeature {
        feature: String,
    },
    WatchInteraction,
    CallAction {
        action: String,
        #[serde(default)]
        data: Map<String, Value>,
        #[serde(default)]
        options: Map<String, Value>,
    },
}

/// Per-connection protocol state.
struct Session {
    last_message_id: u64,
    watchers: Vec<JoinHandle<()>>,
    /// Cloned into each watcher task; flips when the server closes the session.
    close_rx: watch::Receiver<bool>,
}

/// Signal used to communicate loop control flow from helper functions.
enum LoopSignal {
    Continue,
    Break,
}

struct DecodedFrame {
    id: u64,
    request: Request,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<ApiCoordinator>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator, addr))
        .into_response()
}

async fn handle_socket(socket: WebSocket, coordinator: Arc<ApiCoordinator>, remote_addr: SocketAddr) {
    debug!("Opening a websocket connection from {}", remote_addr);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    run_connection_lifecycle(&mut receiver, &tx, &coordinator).await;

    drop(tx);
    let _ = send_task.await;
    debug!("Closed a websocket connection from {}", remote_addr);
}

async fn run_connection_lifecycle(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
) {
    let session_id = Uuid::new_v4();
    let (close_tx, close_rx) = watch::channel(false);
    coordinator.register_session(
        session_id,
        SessionHandle {
            outbound: tx.clone(),
            close: close_tx,
        },
    );

    let _ = send_json(
        tx,
        &ConnectionFrame {
            frame_type: "connection",
            inkboard_version: coordinator.runtime().version(),
        },
    );

    let mut session = Session {
        last_message_id: 0,
        watchers: Vec::new(),
        close_rx,
    };
    run_message_loop(receiver, tx, coordinator, &mut session).await;

    for watcher in &session.watchers {
        watcher.abort();
    }
    let _ = send_close(tx, 1000, "");
    coordinator.unregister_session(&session_id);
}

/// Main receive loop. Runs until the client disconnects or the server flips
/// the session's close signal.
async fn run_message_loop(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
) {
    let mut close_watch = session.close_rx.clone();
    loop {
        let next = tokio::select! {
            next = receiver.next() => next,
            res = close_watch.changed() => {
                if res.is_err() || *close_watch.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(next) = next else {
            break;
        };
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let frame = match decode_frame(msg, tx, session) {
            Ok(frame) => frame,
            Err(LoopSignal::Continue) => continue,
            Err(LoopSignal::Break) => break,
        };
        dispatch_message(tx, coordinator, session, frame.id, frame.request).await;
    }
}

/// Envelope checks, in protocol order: valid JSON, an `id`, a strictly
/// increasing `id`, a `type` key, then a parseable request body. Only the
/// monotonicity pass moves `last_message_id` forward.
fn decode_frame(
    msg: Message,
    tx: &mpsc::UnboundedSender<Message>,
    session: &mut Session,
) -> Result<DecodedFrame, LoopSignal> {
    let text = match message_to_text(msg) {
        Ok(InboundText::Text(text)) => text,
        Ok(InboundText::Control) => return Err(LoopSignal::Continue),
        Ok(InboundText::Close) => return Err(LoopSignal::Break),
        Err(()) => {
            let _ = send_error(tx, ERROR_INVALID_JSON);
            return Err(LoopSignal::Continue);
        }
    };
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => {
            let _ = send_error(tx, ERROR_INVALID_JSON);
            return Err(LoopSignal::Continue);
        }
    };

    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        let _ = send_error(tx, ERROR_MISSING_ID);
        return Err(LoopSignal::Continue);
    };
    if id <= session.last_message_id {
        let _ = send_error(tx, ERROR_STALE_ID);
        return Err(LoopSignal::Continue);
    }
    session.last_message_id = id;

    let Some(message_type) = value.get("type").and_then(Value::as_str) else {
        let _ = send_error(tx, ERROR_MISSING_TYPE);
        return Err(LoopSignal::Continue);
    };
    if !MESSAGE_TYPES.contains(&message_type) {
        let _ = send_result(
            tx,
            id,
            false,
            None,
            Some(format!("unknown message type {}", message_type)),
        );
        return Err(LoopSignal::Continue);
    }
    let message_type = message_type.to_string();

    match serde_json::from_value::<Request>(value) {
        Ok(request) => Ok(DecodedFrame { id, request }),
        Err(err) => {
            let _ = send_result(
                tx,
                id,
                false,
                None,
                Some(format!("invalid parameters for {}: {}", message_type, err)),
            );
            Err(LoopSignal::Continue)
        }
    }
}

async fn dispatch_message(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
    id: u64,
    request: Request,
) {
    match request {
        Request::GetConfig => send_getter(tx, id, Ok(coordinator.get_rest_config())),
        Request::GetDeviceConfig => send_getter(tx, id, Ok(coordinator.get_device_config())),
        Request::GetElements => send_getter(tx, id, Ok(coordinator.get_elements())),
        Request::GetActions => send_getter(tx, id, Ok(coordinator.get_actions_config())),
        Request::GetScreenState => send_getter(tx, id, Ok(coordinator.get_screen_state())),
        Request::GetElementState {
            element_id,
            properties,
        } => {
            let outcome = element_state(coordinator, &element_id, properties.as_deref());
            send_getter(tx, id, outcome);
        }
        Request::GetFeatureState { feature } => {
            send_getter(tx, id, feature_state(coordinator, &feature));
        }
        Request::WatchElement {
            element_id,
            properties,
        } => watch_element(tx, coordinator, session, id, element_id, properties),
        Request::WatchPopups => watch_popups(tx, coordinator, session, id),
        Request::WatchDeviceFeature { feature } => {
            watch_device_feature(tx, coordinator, session, id, &feature)
        }
        Request::WatchInteraction => watch_interaction(tx, coordinator, session, id),
        Request::CallAction {
            action,
            data,
            options,
        } => call_action(tx, coordinator, id, &action, data, &options).await,
    }
}

// ----------------------------------------------------------------------
// Getters
// ----------------------------------------------------------------------

fn element_state(
    coordinator: &ApiCoordinator,
    element_id: &str,
    properties: Option<&[String]>,
) -> Result<Value, String> {
    let element = coordinator
        .runtime()
        .elements()
        .get(element_id)
        .map_err(|err| err.to_string())?;
    let gathered = element.gather(properties).map_err(|err| err.to_string())?;
    Ok(Value::Object(gathered))
}

fn feature_state(coordinator: &ApiCoordinator, feature: &str) -> Result<Value, String> {
    let kind = feature
        .parse::<FeatureKind>()
        .map_err(|err| err.to_string())?;
    coordinator
        .runtime()
        .device()
        .feature_state(kind)
        .map_err(|err| err.to_string())
}

// ----------------------------------------------------------------------
// Watchers
// ----------------------------------------------------------------------

fn watch_element(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
    id: u64,
    element_id: String,
    properties: Vec<String>,
) {
    let element = match coordinator.runtime().elements().get(&element_id) {
        Ok(element) => element,
        Err(err) => {
            let _ = send_result(tx, id, false, None, Some(err.to_string()));
            return;
        }
    };
    let baseline = match element.gather(Some(&properties)) {
        Ok(gathered) => gathered,
        Err(err) => {
            let _ = send_result(tx, id, false, None, Some(err.to_string()));
            return;
        }
    };
    let changes = element.changes();
    let _ = send_result(
        tx,
        id,
        true,
        None,
        Some(format!("Watching element {}", element_id)),
    );

    session.watchers.push(tokio::spawn(run_element_watcher(
        tx.clone(),
        session.close_rx.clone(),
        element,
        properties,
        changes,
        baseline,
        id,
    )));
}

async fn run_element_watcher(
    tx: mpsc::UnboundedSender<Message>,
    mut close_rx: watch::Receiver<bool>,
    element: Arc<Element>,
    properties: Vec<String>,
    mut changes: watch::Receiver<HashMap<String, Value>>,
    mut last: Map<String, Value>,
    id: u64,
) {
    loop {
        tokio::select! {
            res = changes.changed() => {
                if res.is_err() {
                    break;
                }
            }
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        let current = match element.gather(Some(&properties)) {
            Ok(gathered) => gathered,
            Err(_) => break,
        };
        if current == last {
            continue;
        }
        last = current.clone();
        let frame = json!({
            "id": id,
            "type": "watch_element",
            "element_id": element.id(),
            "properties": current,
        });
        if send_json(&tx, &frame).is_err() {
            break;
        }
    }
}

fn watch_popups(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
    id: u64,
) {
    let screen = coordinator.runtime().screen();
    let popups = screen.subscribe_popups();
    let baseline = screen.popups_on_top();
    let _ = send_result(tx, id, true, None, Some("Watching popups".to_string()));

    session.watchers.push(tokio::spawn(run_popups_watcher(
        tx.clone(),
        session.close_rx.clone(),
        popups,
        baseline,
        id,
    )));
}

async fn run_popups_watcher(
    tx: mpsc::UnboundedSender<Message>,
    mut close_rx: watch::Receiver<bool>,
    mut popups: watch::Receiver<Vec<String>>,
    mut last: Vec<String>,
    id: u64,
) {
    loop {
        tokio::select! {
            res = popups.changed() => {
                if res.is_err() {
                    break;
                }
            }
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        let current = popups.borrow().clone();
        if current == last {
            continue;
        }
        last = current.clone();
        let frame = json!({ "id": id, "type": "watch_popups", "popups": current });
        if send_json(&tx, &frame).is_err() {
            break;
        }
    }
}

fn watch_device_feature(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
    id: u64,
    feature: &str,
) {
    let subscription = feature
        .parse::<FeatureKind>()
        .map_err(|err| err.to_string())
        .and_then(|kind| {
            coordinator
                .runtime()
                .device()
                .watch_feature(kind)
                .map_err(|err| err.to_string())
        });
    let feature_watch = match subscription {
        Ok(feature_watch) => feature_watch,
        Err(message) => {
            let _ = send_result(tx, id, false, None, Some(message));
            return;
        }
    };
    let baseline = feature_watch.snapshot();
    let _ = send_result(
        tx,
        id,
        true,
        None,
        Some(format!("Watching device feature {}", feature_watch.kind())),
    );

    session.watchers.push(tokio::spawn(run_feature_watcher(
        tx.clone(),
        session.close_rx.clone(),
        feature_watch,
        baseline,
        id,
    )));
}

async fn run_feature_watcher(
    tx: mpsc::UnboundedSender<Message>,
    mut close_rx: watch::Receiver<bool>,
    mut feature_watch: FeatureWatch,
    mut last: Value,
    id: u64,
) {
    loop {
        tokio::select! {
            res = feature_watch.changed() => {
                if res.is_err() {
                    break;
                }
            }
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        let current = feature_watch.snapshot();
        if current == last {
            continue;
        }
        last = current.clone();
        let frame = json!({
            "id": id,
            "type": "watch_device_feature",
            "feature": feature_watch.kind().as_str(),
            "state": current,
        });
        if send_json(&tx, &frame).is_err() {
            break;
        }
    }
}

fn watch_interaction(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    session: &mut Session,
    id: u64,
) {
    let screen = coordinator.runtime().screen();
    let touches = screen.subscribe_touch();
    let baseline = screen.last_touch();
    let _ = send_result(tx, id, true, None, Some("Watching interaction".to_string()));

    session.watchers.push(tokio::spawn(run_interaction_watcher(
        tx.clone(),
        session.close_rx.clone(),
        touches,
        baseline,
        id,
    )));
}

async fn run_interaction_watcher(
    tx: mpsc::UnboundedSender<Message>,
    mut close_rx: watch::Receiver<bool>,
    mut touches: watch::Receiver<Option<TouchEvent>>,
    mut last: Option<TouchEvent>,
    id: u64,
) {
    loop {
        tokio::select! {
            res = touches.changed() => {
                if res.is_err() {
                    break;
                }
            }
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        let current = *touches.borrow();
        if current == last {
            continue;
        }
        last = current;
        let Some(event) = current else {
            continue;
        };
        let frame = json!({
            "id": id,
            "type": "watch_interaction",
            "touch": serde_json::to_value(event).unwrap_or(json!({})),
        });
        if send_json(&tx, &frame).is_err() {
            break;
        }
    }
}

// ----------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------

/// Same resolution/validation/invocation contract as the REST action routes,
/// reported through a single result frame.
async fn call_action(
    tx: &mpsc::UnboundedSender<Message>,
    coordinator: &Arc<ApiCoordinator>,
    id: u64,
    action: &str,
    data: Map<String, Value>,
    options: &Map<String, Value>,
) {
    let registered = match coordinator.resolve_action(action, options) {
        Ok(registered) => registered,
        Err(err) => {
            let _ = send_result(tx, id, false, None, Some(err.to_string()));
            return;
        }
    };
    match registered.call(data).await {
        Ok(Value::Null) => {
            let _ = send_result(tx, id, true, None, Some(format!("action {} called", action)));
        }
        Ok(value) => {
            let _ = send_result(
                tx,
                id,
                true,
                Some(value),
                Some(format!("action {} called", action)),
            );
        }
        Err(ActionError::Validation(message)) => {
            let _ = send_result(tx, id, false, None, Some(message));
        }
        Err(err) => {
            let _ = send_result(
                tx,
                id,
                false,
                None,
                Some(format!("Could not call action {}: {}", action, err)),
            );
        }
    }
}

// ----------------------------------------------------------------------
// Frame plumbing
// ----------------------------------------------------------------------

enum InboundText {
    Text(String),
    Control,
    Close,
}

fn message_to_text(msg: Message) -> Result<InboundText, ()> {
    match msg {
        Message::Text(text) => Ok(InboundText::Text(text.to_string())),
        Message::Binary(_) => Err(()),
        Message::Close(_) => Ok(InboundText::Close),
        Message::Ping(_) | Message::Pong(_) => Ok(InboundText::Control),
    }
}

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, payload: &T) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, message: &str) -> Result<(), ()> {
    send_json(
        tx,
        &ErrorFrame {
            frame_type: "error",
            message,
        },
    )
}

fn send_result(
    tx: &mpsc::UnboundedSender<Message>,
    id: u64,
    success: bool,
    result: Option<Value>,
    message: Option<String>,
) -> Result<(), ()> {
    send_json(
        tx,
        &ResultFrame {
            id,
            frame_type: "result",
            success,
            result,
            message,
        },
    )
}

/// One-shot getter outcome: the snapshot on success, the error text in the
/// `result` slot on failure.
fn send_getter(tx: &mpsc::UnboundedSender<Message>, id: u64, outcome: Result<Value, String>) {
    match outcome {
        Ok(value) => {
            let _ = send_result(tx, id, true, Some(value), None);
        }
        Err(text) => {
            let _ = send_result(tx, id, false, Some(Value::String(text)), None);
        }
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) -> Result<(), ()> {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    tx.send(Message::Close(Some(frame))).map_err(|_| ())
}

/// The announcement queued on every open session before the server shuts a
/// connection down.
pub(crate) fn closing_message(code: u16, reason: &str) -> Message {
    let frame = json!({ "type": "closing", "code": code, "reason": reason });
    Message::Text(frame.to_string().into())
}
