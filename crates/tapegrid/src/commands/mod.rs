//! Command implementations and the state they share.

pub mod admin;
pub mod object;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tapegrid_core::TapegridConfig;
use tapegrid_lrs::{DeviceAdapter, Lrs, SimLibrary};
use tapegrid_state::StateStore;
use tapegrid_store::ObjectStore;
use tracing::debug;

/// Configuration, catalog and library opened once per invocation.
pub struct Context {
    pub config: TapegridConfig,
    pub catalog: StateStore,
    pub library: Arc<SimLibrary>,
}

impl Context {
    pub fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = TapegridConfig::load(config_path)?;

        if let Some(parent) = config.catalog.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let catalog = StateStore::open(&config.catalog.path)
            .with_context(|| format!("opening catalog {}", config.catalog.path.display()))?;
        let library = SimLibrary::open(&config.library.root)
            .with_context(|| format!("opening library {}", config.library.root.display()))?;

        debug!(
            host = %config.lrs.hostname,
            catalog = %config.catalog.path.display(),
            library = %config.library.root.display(),
            "context opened"
        );
        Ok(Self {
            config,
            catalog,
            library: Arc::new(library),
        })
    }

    /// Start a scheduler over this host's drives.
    pub async fn start_lrs(&self) -> anyhow::Result<Lrs> {
        let adapter: Arc<dyn DeviceAdapter> = self.library.clone();
        let lrs = Lrs::start(self.catalog.clone(), adapter, self.config.lrs.clone())
            .await
            .context("starting the resource scheduler")?;
        Ok(lrs)
    }

    /// Start a scheduler and an object store on top of it.
    pub async fn session(&self) -> anyhow::Result<Session> {
        let lrs = self.start_lrs().await?;
        let store = ObjectStore::new(&lrs, self.catalog.clone(), self.config.clone());
        Ok(Session { lrs, store })
    }
}

pub struct Session {
    lrs: Lrs,
    pub store: ObjectStore,
}

impl Session {
    pub async fn close(self) {
        self.lrs.shutdown().await;
    }
}
