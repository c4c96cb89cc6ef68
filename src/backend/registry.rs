use super::{BackendContext, BackendFactory, ServiceBackend, ServiceControl, StandardFactory};
use crate::error::BackendError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered backend name and its factory
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub factory: Arc<dyn BackendFactory>,
}

/// Name-to-factory map. Filled at startup, then moved into the
/// [`Service`](crate::Service), which only reads it.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process `standard` backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::clienv::DEFAULT_BACKEND, Arc::new(StandardFactory));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        let name = name.into();
        debug!(backend = %name, "Registered service backend");
        self.backends
            .insert(name.clone(), BackendDescriptor { name, factory });
    }

    /// Registered names, sorted
    pub fn backends(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&BackendDescriptor> {
        self.backends.get(name)
    }

    /// Exact, case-sensitive lookup
    pub fn find_backend(
        &self,
        name: &str,
        ctx: BackendContext,
    ) -> Result<Box<dyn ServiceBackend>, BackendError> {
        let factory = self.factory(name)?;
        let backend = factory.create_backend(ctx)?;
        info!(backend = %name, "Loaded service backend");
        Ok(backend)
    }

    pub fn create_control(
        &self,
        name: &str,
        service_id: impl Into<String>,
    ) -> Result<Box<dyn ServiceControl>, BackendError> {
        self.factory(name)?.create_control(service_id.into())
    }

    pub fn current_service_id(
        &self,
        name: &str,
        service_name: &str,
    ) -> Result<String, BackendError> {
        Ok(self.factory(name)?.current_service_id(service_name))
    }

    pub fn find_service_id(
        &self,
        name: &str,
        service_name: &str,
        domain: Option<&str>,
    ) -> Result<String, BackendError> {
        Ok(self.factory(name)?.find_service_id(service_name, domain))
    }

    /// Hand the whole process over to `backend`.
    pub async fn run_supervised(backend: &dyn ServiceBackend, args: &[String]) -> i32 {
        debug!(backend = backend.name(), args = ?args, "Running service under backend");
        backend.run_service(args).await
    }

    fn factory(&self, name: &str) -> Result<&Arc<dyn BackendFactory>, BackendError> {
        self.backends
            .get(name)
            .map(|d| &d.factory)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }
}
