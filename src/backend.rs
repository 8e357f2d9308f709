//! Process-wide backend selection.
//!
//! A process picks one backend before creating services. Picking the same
//! backend again is a no-op; picking a different one is an error until
//! [`teardown`] resets the selection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::catalog::KeywordCatalog;
use crate::client::{ClientKeyword, ClientService};
use crate::config::Config;
use crate::dispatcher::{DispatcherConfig, DispatcherService};
use crate::error::{Error, Result};

/// Available backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Zmq,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Zmq => f.write_str("zmq"),
        }
    }
}

/// Operations every backend provides.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> BackendKind;

    /// Prepare process-level resources.
    async fn setup(&self) -> Result<()>;

    /// Connect a client to `service`.
    async fn service(&self, service: &str) -> Result<ClientService>;

    /// Resolve a keyword through a connected client.
    async fn keyword(&self, service: &ClientService, name: &str) -> Result<Arc<ClientKeyword>>;

    /// Start a dispatcher; `setup` populates its keywords before it begins.
    async fn dispatcher(
        &self,
        service: &str,
        dispatcher: Option<&str>,
        catalog: Option<Arc<dyn KeywordCatalog>>,
        setup: Box<dyn for<'s> FnOnce(&'s mut DispatcherService) -> Result<()> + Send>,
    ) -> Result<DispatcherService>;

    /// Release process-level resources.
    async fn teardown(&self) -> Result<()>;
}

/// Backend over the ZeroMQ broker fabric.
#[derive(Debug, Clone)]
pub struct ZmqBackend {
    config: Config,
}

impl ZmqBackend {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl Backend for ZmqBackend {
    fn name(&self) -> BackendKind {
        BackendKind::Zmq
    }

    async fn setup(&self) -> Result<()> {
        select(BackendKind::Zmq)
    }

    async fn service(&self, service: &str) -> Result<ClientService> {
        ClientService::connect(service, &self.config).await
    }

    async fn keyword(&self, service: &ClientService, name: &str) -> Result<Arc<ClientKeyword>> {
        service.keyword(name).await
    }

    async fn dispatcher(
        &self,
        service: &str,
        dispatcher: Option<&str>,
        catalog: Option<Arc<dyn KeywordCatalog>>,
        setup: Box<dyn for<'s> FnOnce(&'s mut DispatcherService) -> Result<()> + Send>,
    ) -> Result<DispatcherService> {
        let config = DispatcherConfig::new(service, dispatcher, &self.config);
        DispatcherService::start(config, catalog, setup).await
    }

    async fn teardown(&self) -> Result<()> {
        teardown();
        Ok(())
    }
}

// ============================================================================
// Selection
// ============================================================================

static SELECTED: Mutex<Option<BackendKind>> = parking_lot::const_mutex(None);

/// Record `kind` as this process's backend.
pub fn select(kind: BackendKind) -> Result<()> {
    let mut selected = SELECTED.lock();
    match *selected {
        Some(current) if current != kind => Err(Error::Backend(format!(
            "backend '{current}' already selected, cannot switch to '{kind}'"
        ))),
        Some(_) => Ok(()),
        None => {
            info!(backend = %kind, "Backend selected");
            *selected = Some(kind);
            Ok(())
        }
    }
}

/// Select and set up the backend of `kind`.
pub async fn setup(kind: BackendKind, config: Config) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Zmq => Arc::new(ZmqBackend::new(config)),
    };
    backend.setup().await?;
    Ok(backend)
}

pub fn selected() -> Option<BackendKind> {
    *SELECTED.lock()
}

/// Clear the selection.
pub fn teardown() {
    SELECTED.lock().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_select_once() {
        teardown();
        assert_eq!(selected(), None);

        select(BackendKind::Zmq).unwrap();
        select(BackendKind::Zmq).unwrap();
        assert_eq!(selected(), Some(BackendKind::Zmq));

        teardown();
        assert_eq!(selected(), None);
    }

    #[tokio::test]
    #[serial]
    async fn test_setup_and_teardown() {
        teardown();
        let backend = setup(BackendKind::Zmq, Config::default()).await.unwrap();
        assert_eq!(backend.name(), BackendKind::Zmq);
        assert_eq!(selected(), Some(BackendKind::Zmq));

        backend.teardown().await.unwrap();
        assert_eq!(selected(), None);
    }
}
