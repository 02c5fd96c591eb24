//! Element register: dashboard elements and their property-change triggers.
//!
//! Elements hold a JSON property map inside a `watch` cell. Every property
//! write notifies subscribers; watcher loops re-gather the properties they
//! care about and diff against the last pushed set, so spurious wakeups never
//! produce duplicate pushes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ElementError {
    #[error("no element with id {0} is registered")]
    UnknownElement(String),

    #[error("element {element} has no property {property}")]
    UnknownProperty { element: String, property: String },
}

/// A registered dashboard element: id, type name, and a property map.
#[derive(Debug)]
pub struct Element {
    id: String,
    type_name: String,
    properties: watch::Sender<HashMap<String, Value>>,
}

impl Element {
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        properties: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        Element {
            id: id.into(),
            type_name: type_name.into(),
            properties: watch::channel(properties.into_iter().collect()).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Host write path: set one property and fire the change trigger.
    pub fn set_property(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.properties.send_modify(|props| {
            props.insert(name, value);
        });
    }

    /// Names of every registered property, sorted.
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.properties.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Gather the requested properties, or all of them when `names` is `None`.
    ///
    /// Requesting a property the element does not have is an error; the
    /// element's id is named in the message.
    pub fn gather(&self, names: Option<&[String]>) -> Result<Map<String, Value>, ElementError> {
        let props = self.properties.borrow();
        match names {
            Some(names) => {
                let mut out = Map::new();
                for name in names {
                    let value =
                        props
                            .get(name)
                            .cloned()
                            .ok_or_else(|| ElementError::UnknownProperty {
                                element: self.id.clone(),
                                property: name.clone(),
                            })?;
                    out.insert(name.clone(), value);
                }
                Ok(out)
            }
            None => Ok(props
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()),
        }
    }

    /// Subscribe to the property-change trigger.
    pub fn changes(&self) -> watch::Receiver<HashMap<String, Value>> {
        self.properties.subscribe()
    }
}

/// id -> element lookup backing `get_elements` and the element getters.
#[derive(Default)]
pub struct ElementRegistry {
    elements: RwLock<HashMap<String, Arc<Element>>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an element, replacing any previous one with the same id.
    pub fn register(&self, element: Element) -> Arc<Element> {
        let element = Arc::new(element);
        self.elements
            .write()
            .insert(element.id().to_string(), element.clone());
        element
    }

    pub fn get(&self, id: &str) -> Result<Arc<Element>, ElementError> {
        self.elements
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ElementError::UnknownElement(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }

    /// `{element_id: type name}` for every registered element, sorted by id.
    pub fn type_names(&self) -> BTreeMap<String, String> {
        self.elements
            .read()
            .values()
            .map(|element| (element.id().to_string(), element.type_name().to_string()))
            .collect()
    }
}
