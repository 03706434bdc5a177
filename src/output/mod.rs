/// Deferred resource outputs
///
/// Every declared resource owns one settlement channel. Typed `Output<T>`
/// values are projections of that channel: they can be handed around before
/// the provider runtime has answered and resolve once the resource settles.
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, ResolutionError, Result};
use crate::resource::{OutputRef, PropertyMap, Urn};

/// Lifecycle of a deferred value
#[derive(Debug, Clone, PartialEq)]
pub enum OutputState<T> {
    Pending,
    Resolved(T),
    Failed(Error),
    Cancelled,
}

impl<T> OutputState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, OutputState::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }
}

/// Settlement of a whole resource: its output map or why there is none
pub(crate) type Settlement = OutputState<PropertyMap>;

/// Write side of a resource's outputs, owned by the deployment graph
#[derive(Debug)]
pub(crate) struct OutputSettler {
    tx: watch::Sender<Settlement>,
}

impl OutputSettler {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(OutputState::Pending);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Settlement> {
        self.tx.subscribe()
    }

    /// Settle the outputs. Only the first settlement sticks.
    pub(crate) fn settle(&self, state: Settlement) -> bool {
        if state.is_pending() {
            return false;
        }
        self.tx.send_if_modified(move |current| {
            if current.is_pending() {
                *current = state;
                true
            } else {
                false
            }
        })
    }
}

type Projection<T> = Arc<dyn Fn(&PropertyMap) -> Result<T> + Send + Sync>;

/// A value that becomes known once the provider runtime answers
pub struct Output<T> {
    urn: Urn,
    key: Option<String>,
    rx: watch::Receiver<Settlement>,
    project: Projection<T>,
}

impl Output<PropertyMap> {
    /// The complete output map of a resource
    pub(crate) fn all(urn: Urn, rx: watch::Receiver<Settlement>) -> Self {
        Self {
            urn,
            key: None,
            rx,
            project: Arc::new(|outputs: &PropertyMap| -> Result<PropertyMap> { Ok(outputs.clone()) }),
        }
    }
}

impl<T: DeserializeOwned + 'static> Output<T> {
    /// A single named output, decoded into `T`
    pub(crate) fn key(urn: Urn, rx: watch::Receiver<Settlement>, key: &str) -> Self {
        let owner = urn.clone();
        let name = key.to_string();
        let project: Projection<T> = Arc::new(move |outputs: &PropertyMap| -> Result<T> {
            let value = outputs
                .get(&name)
                .ok_or_else(|| ResolutionError::MissingOutput {
                    urn: owner.clone(),
                    key: name.clone(),
                })?;
            serde_json::from_value(value.clone()).map_err(|e| {
                ResolutionError::MalformedOutput {
                    urn: owner.clone(),
                    key: name.clone(),
                    reason: e.to_string(),
                }
                .into()
            })
        });

        Self {
            urn,
            key: Some(key.to_string()),
            rx,
            project,
        }
    }
}

impl<T> Output<T> {
    /// Resource this output belongs to
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Reference usable as another resource's input, for single-key outputs
    pub fn reference(&self) -> Option<OutputRef> {
        self.key
            .as_ref()
            .map(|key| OutputRef::new(self.urn.clone(), key.clone()))
    }

    /// Current state without waiting
    pub fn state(&self) -> OutputState<T> {
        let settlement = self.rx.borrow().clone();
        let settlement = match settlement {
            OutputState::Pending if self.rx.has_changed().is_err() => OutputState::Cancelled,
            settlement => settlement,
        };
        self.project_state(settlement)
    }

    /// Wait until the resource settles and return the value
    pub async fn resolve(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        // A closed channel that never settled means the deployment went away.
        let settlement = match rx.wait_for(|s| s.is_settled()).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => OutputState::Cancelled,
        };

        match self.project_state(settlement) {
            OutputState::Resolved(value) => Ok(value),
            OutputState::Failed(err) => Err(err),
            OutputState::Pending | OutputState::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Derive a new output from this one
    pub fn map<U, F>(self, f: F) -> Output<U>
    where
        T: 'static,
        U: 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let project = self.project;
        Output {
            urn: self.urn,
            key: None,
            rx: self.rx,
            project: Arc::new(move |outputs: &PropertyMap| project(outputs).map(&f)),
        }
    }

    fn project_state(&self, settlement: Settlement) -> OutputState<T> {
        match settlement {
            OutputState::Pending => OutputState::Pending,
            OutputState::Resolved(outputs) => match (self.project)(&outputs) {
                Ok(value) => OutputState::Resolved(value),
                Err(err) => OutputState::Failed(err),
            },
            OutputState::Failed(err) => OutputState::Failed(err),
            OutputState::Cancelled => OutputState::Cancelled,
        }
    }
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            urn: self.urn.clone(),
            key: self.key.clone(),
            rx: self.rx.clone(),
            project: self.project.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("urn", &self.urn)
            .field("key", &self.key)
            .field("pending", &self.rx.borrow().is_pending())
            .finish()
    }
}

/// Handle to any declared resource
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    urn: Urn,
    outputs: Output<PropertyMap>,
}

impl ResourceHandle {
    pub(crate) fn new(urn: Urn, rx: watch::Receiver<Settlement>) -> Self {
        Self {
            outputs: Output::all(urn.clone(), rx),
            urn,
        }
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Every output the runtime returned
    pub fn outputs(&self) -> &Output<PropertyMap> {
        &self.outputs
    }

    /// A single named output
    pub fn output<T: DeserializeOwned + 'static>(&self, key: &str) -> Output<T> {
        Output::key(self.urn.clone(), self.outputs.rx.clone(), key)
    }
}
