//! Shared utilities for fabric integration tests.
//!
//! Each test runs its own broker over `ipc://` sockets in a temporary
//! directory, so tests do not contend for ports.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mktl::broker::Broker;
use mktl::client::ClientService;
use mktl::config::Config;
use mktl::dispatcher::{DispatcherConfig, DispatcherService};

pub const SERVICE: &str = "testsvc";

/// Time for PUB/SUB connections to settle before broadcasts matter.
pub const SETTLE: Duration = Duration::from_millis(300);

/// Configuration rooted in a fresh temporary directory.
pub fn ipc_config() -> (TempDir, Config) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = Config::for_ipc(dir.path());
    config.core.timeout = 5.0;
    config.zmq.join_timeout = 2.0;
    (dir, config)
}

/// A broker running in the background.
pub struct Fabric {
    pub config: Config,
    _dir: TempDir,
    shutdown: watch::Sender<bool>,
    broker: JoinHandle<mktl::Result<()>>,
}

impl Fabric {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let (dir, mut config) = ipc_config();
        adjust(&mut config);

        let broker = Broker::bind(&config).expect("Failed to bind broker");
        let (shutdown, rx) = watch::channel(false);
        let broker = tokio::spawn(broker.run(rx));

        Self {
            config,
            _dir: dir,
            shutdown,
            broker,
        }
    }

    /// Start a dispatcher for [`SERVICE`] populated by `setup`.
    pub async fn dispatcher<F>(&self, name: &str, setup: F) -> DispatcherService
    where
        F: FnOnce(&mut DispatcherService) -> mktl::Result<()>,
    {
        let config = DispatcherConfig::new(SERVICE, Some(name), &self.config);
        DispatcherService::start(config, None, setup)
            .await
            .expect("Failed to start dispatcher")
    }

    pub async fn client(&self) -> ClientService {
        let client = ClientService::connect(SERVICE, &self.config)
            .await
            .expect("Failed to connect client");
        tokio::time::sleep(SETTLE).await;
        client
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.broker)
            .await
            .expect("Broker did not stop")
            .expect("Broker task panicked")
            .expect("Broker failed");
    }
}
