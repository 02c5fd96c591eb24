//! Shorthand action registry: named invocables, group resolvers, and
//! argument validation.
//!
//! Actions declare their accepted keyword arguments up front so both the REST
//! and WebSocket callers can reject a bad call before invoking anything.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, PartialEq, Error)]
pub enum ActionError {
    #[error("No Shorthand Action {0}")]
    NotFound(String),

    #[error("No shorthand action group {0} is registered")]
    GroupNotFound(String),

    #[error("Shorthand action group {group} could not parse {action}")]
    GroupParse { group: String, action: String },

    /// Argument validation failed; the callable was not invoked.
    #[error("{0}")]
    Validation(String),

    /// The callable itself failed.
    #[error("{0}")]
    Failed(String),
}

pub type ActionResult = Result<Value, ActionError>;
pub type ActionFuture = BoxFuture<'static, ActionResult>;

/// The invocable behind a shorthand action. Receives the call's keyword
/// arguments as a JSON object.
pub type ActionFn = Arc<dyn Fn(Map<String, Value>) -> ActionFuture + Send + Sync>;

/// Resolves an action name within a group, given the caller's parser options.
/// `None` means the group cannot parse that name.
pub type GroupResolver =
    Arc<dyn Fn(&str, &Map<String, Value>) -> Option<RegisteredAction> + Send + Sync>;

/// Wrap a synchronous closure as an [`ActionFn`].
pub fn sync_handler<F>(f: F) -> ActionFn
where
    F: Fn(Map<String, Value>) -> ActionResult + Send + Sync + 'static,
{
    Arc::new(move |args| future::ready(f(args)).boxed())
}

/// A named invocable with its declared argument names.
#[derive(Clone)]
pub struct RegisteredAction {
    name: String,
    required: Vec<String>,
    optional: Vec<String>,
    accepts_any: bool,
    handler: ActionFn,
}

impl fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .field("accepts_any", &self.accepts_any)
            .finish_non_exhaustive()
    }
}

impl RegisteredAction {
    /// A zero-argument action. Declare arguments with the `with_*` builders.
    pub fn new(name: impl Into<String>, handler: ActionFn) -> Self {
        RegisteredAction {
            name: name.into(),
            required: Vec::new(),
            optional: Vec::new(),
            accepts_any: false,
            handler,
        }
    }

    pub fn with_required(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_optional(mut self, names: &[&str]) -> Self {
        self.optional = names.iter().map(|name| name.to_string()).collect();
        self
    }

    /// Accept arbitrary keyword arguments beyond the declared ones.
    pub fn accepting_any(mut self) -> Self {
        self.accepts_any = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check the call's keyword arguments against the declared names.
    pub fn validate_call(&self, kwargs: &Map<String, Value>) -> Result<(), ActionError> {
        for name in &self.required {
            if !kwargs.contains_key(name) {
                return Err(ActionError::Validation(format!(
                    "missing required argument {} for action {}",
                    name, self.name
                )));
            }
        }
        if !self.accepts_any {
            for key in kwargs.keys() {
                if !self.required.contains(key) && !self.optional.contains(key) {
                    return Err(ActionError::Validation(format!(
                        "unexpected argument {} for action {}",
                        key, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and invoke.
    pub async fn call(&self, kwargs: Map<String, Value>) -> ActionResult {
        self.validate_call(&kwargs)?;
        (self.handler)(kwargs).await
    }
}

/// Shorthand and group registration, the host side of action dispatch.
///
/// Access control (removed names) is the API coordinator's overlay, not the
/// registry's concern.
#[derive(Default)]
pub struct ActionRegistry {
    shorthands: RwLock<HashMap<String, RegisteredAction>>,
    groups: RwLock<HashMap<String, GroupResolver>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: RegisteredAction) {
        self.shorthands
            .write()
            .insert(action.name.clone(), action);
    }

    pub fn register_group(&self, name: impl Into<String>, resolver: GroupResolver) {
        self.groups.write().insert(name.into(), resolver);
    }

    pub fn shorthand(&self, name: &str) -> Option<RegisteredAction> {
        self.shorthands.read().get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<GroupResolver> {
        self.groups.read().get(name).cloned()
    }

    pub fn shorthand_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shorthands.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }
}
