use super::value::Value;
use crate::error::{Result, ServiceError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

pub type CallbackFn = Box<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// String-keyed command bus for out-of-band named commands.
///
/// Registration happens before dispatch begins. The first dispatch seals the
/// registry; later registrations are refused.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<String, CallbackFn>>,
    sealed: AtomicBool,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. An existing handler for the same kind
    /// is replaced.
    pub fn register<F>(&self, kind: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.is_sealed() {
            return Err(ServiceError::CallbacksSealed { kind });
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(kind.clone(), Box::new(handler)).is_some() {
            debug!(kind = %kind, "Replaced dynamic callback");
        } else {
            debug!(kind = %kind, "Registered dynamic callback");
        }
        Ok(())
    }

    /// Call the handler for `kind`. Unknown kinds are a no-op returning
    /// [`Value::Null`].
    pub fn invoke(&self, kind: &str, args: &[Value]) -> Value {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(kind) {
            Some(handler) => {
                debug!(kind = %kind, "Found and calling dynamic callback");
                handler(args)
            }
            None => {
                warn!(kind = %kind, "Unhandled callback");
                Value::Null
            }
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            debug!("Callback registry sealed");
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}
