//! Screen state: popup stack, popup register, interaction trigger, printing flag.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScreenError {
    #[error("no popup with id {0} is registered")]
    UnknownPopup(String),
}

/// A touch or click reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TouchEvent {
    pub x: i32,
    pub y: i32,
    pub action: TouchAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchAction {
    Press,
    Release,
    Hold,
}

/// The dashboard's main element as reported in the REST config snapshot.
///
/// `tabs` and `current_tab` are present only for tabbed containers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MainElement {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tab: Option<String>,
}

/// The screen half of the host runtime.
///
/// The popup stack and the touch cell are `watch` channels; API watchers
/// subscribe and diff on wake.
pub struct Screen {
    main_element: RwLock<Option<MainElement>>,
    registered_popups: RwLock<Vec<String>>,
    popups: watch::Sender<Vec<String>>,
    touch: watch::Sender<Option<TouchEvent>>,
    printing: AtomicBool,
}

impl Screen {
    pub fn new() -> Self {
        Screen {
            main_element: RwLock::new(None),
            registered_popups: RwLock::new(Vec::new()),
            popups: watch::channel(Vec::new()).0,
            touch: watch::channel(None).0,
            printing: AtomicBool::new(true),
        }
    }

    pub fn set_main_element(&self, element: MainElement) {
        *self.main_element.write() = Some(element);
    }

    pub fn main_element(&self) -> Option<MainElement> {
        self.main_element.read().clone()
    }

    /// Add a popup id to the register. Registering twice is a no-op.
    pub fn register_popup(&self, id: impl Into<String>) {
        let id = id.into();
        let mut registered = self.registered_popups.write();
        if !registered.contains(&id) {
            registered.push(id);
        }
    }

    pub fn registered_popups(&self) -> Vec<String> {
        self.registered_popups.read().clone()
    }

    /// Put a registered popup on top of the stack, firing the popup trigger.
    /// A popup already in the stack moves to the top.
    pub fn show_popup(&self, id: &str) -> Result<(), ScreenError> {
        if !self.registered_popups.read().contains(&id.to_string()) {
            return Err(ScreenError::UnknownPopup(id.to_string()));
        }
        self.popups.send_modify(|stack| {
            stack.retain(|shown| shown != id);
            stack.push(id.to_string());
        });
        Ok(())
    }

    /// Remove a popup from the stack. Returns whether it was shown.
    pub fn close_popup(&self, id: &str) -> bool {
        let mut removed = false;
        self.popups.send_modify(|stack| {
            let before = stack.len();
            stack.retain(|shown| shown != id);
            removed = stack.len() != before;
        });
        removed
    }

    /// Ids of the popups currently shown, bottom to top.
    pub fn popups_on_top(&self) -> Vec<String> {
        self.popups.borrow().clone()
    }

    /// The popup on top of the stack, if any.
    pub fn current_popup(&self) -> Option<String> {
        self.popups.borrow().last().cloned()
    }

    pub fn subscribe_popups(&self) -> watch::Receiver<Vec<String>> {
        self.popups.subscribe()
    }

    /// Host write path: report an interaction, waking interaction watchers.
    pub fn push_touch(&self, event: TouchEvent) {
        self.touch.send_replace(Some(event));
    }

    pub fn last_touch(&self) -> Option<TouchEvent> {
        *self.touch.borrow()
    }

    pub fn subscribe_touch(&self) -> watch::Receiver<Option<TouchEvent>> {
        self.touch.subscribe()
    }

    pub fn set_printing(&self, printing: bool) {
        self.printing.store(printing, Ordering::Relaxed);
    }

    /// Whether the dashboard's print loop is alive.
    pub fn printing(&self) -> bool {
        self.printing.load(Ordering::Relaxed)
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}
