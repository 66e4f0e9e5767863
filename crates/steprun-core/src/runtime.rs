// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine wiring.
//!
//! [`Engine`] bundles a state store, an async job manager and a process runner
//! built from one [`Config`]. When the config sets a snapshot TTL, the engine
//! also runs a background task evicting expired snapshots.
//!
//! # Example
//!
//! ```rust,ignore
//! use steprun_core::config::Config;
//! use steprun_core::process::{ProcessDefinition, RunProcessInput, StepDefinition};
//! use steprun_core::runtime::Engine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .config(Config::from_env()?)
//!         .process(
//!             ProcessDefinition::new("greet").with_step(StepDefinition::backend_fn(
//!                 "hello",
//!                 |ctx| {
//!                     ctx.set_value("greeting", "hello");
//!                     Ok(())
//!                 },
//!             )),
//!         )
//!         .build()
//!         .start();
//!
//!     let output = engine.runner().run(RunProcessInput::new("greet")).await?;
//!     println!("{:?}", output.values);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::jobs::AsyncJobManager;
use crate::process::{ProcessDefinition, ProcessRegistry, ProcessRunner};
use crate::state::{InMemoryStateStore, StateStore};

/// Default period of the snapshot eviction sweep.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn StateStore>>,
    registry: ProcessRegistry,
    eviction_interval: Duration,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("processes", &self.registry.names())
            .field("eviction_interval", &self.eviction_interval)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            registry: ProcessRegistry::new(),
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the state store.
    ///
    /// Default: an [`InMemoryStateStore`] using the configured TTL.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a process definition.
    pub fn process(mut self, definition: ProcessDefinition) -> Self {
        self.registry.register(definition);
        self
    }

    /// Replace the process registry.
    pub fn registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the period of the eviction sweep.
    ///
    /// Default: 60 seconds
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Wire the store, job manager and runner together.
    pub fn build(self) -> Engine {
        let store: Arc<dyn StateStore> = match (self.store, self.config.state_ttl) {
            (Some(store), _) => store,
            (None, Some(ttl)) => Arc::new(InMemoryStateStore::with_ttl(ttl)),
            (None, None) => Arc::new(InMemoryStateStore::new()),
        };
        let jobs = AsyncJobManager::new(store.clone(), self.config.jobs.clone());
        let runner = ProcessRunner::new(Arc::new(self.registry), store.clone(), jobs.clone())
            .with_etl_config(self.config.etl.clone());

        Engine {
            config: self.config,
            store,
            jobs,
            runner,
            eviction_interval: self.eviction_interval,
        }
    }
}

/// Store, job manager and runner sharing one configuration.
#[derive(Clone)]
pub struct Engine {
    config: Config,
    store: Arc<dyn StateStore>,
    jobs: AsyncJobManager,
    runner: ProcessRunner,
    eviction_interval: Duration,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Configuration the engine was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The async job manager.
    pub fn jobs(&self) -> &AsyncJobManager {
        &self.jobs
    }

    /// The process runner.
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Start background maintenance.
    ///
    /// Spawns the eviction sweep when a snapshot TTL is configured.
    pub fn start(self) -> RunningEngine {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweeper = self.config.state_ttl.map(|ttl| {
            info!(
                ttl_secs = ttl.as_secs(),
                interval_secs = self.eviction_interval.as_secs(),
                "Starting snapshot eviction sweep"
            );
            tokio::spawn(run_eviction_sweep(
                self.store.clone(),
                self.eviction_interval,
                shutdown_rx,
            ))
        });

        RunningEngine {
            engine: self,
            sweeper,
            shutdown_tx,
        }
    }
}

/// An [`Engine`] with its background tasks running.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct RunningEngine {
    engine: Engine,
    sweeper: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::ops::Deref for RunningEngine {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl RunningEngine {
    /// Check if the eviction sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop background tasks and wait for them to finish.
    ///
    /// Background async jobs are not cancelled.
    pub async fn shutdown(self) -> Result<()> {
        info!("Engine shutting down...");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.sweeper {
            if let Err(e) = handle.await {
                error!("Eviction sweep panicked: {}", e);
                return Err(anyhow::anyhow!("eviction sweep panicked: {}", e));
            }
        }

        info!("Engine shutdown complete");
        Ok(())
    }
}

async fn run_eviction_sweep(
    store: Arc<dyn StateStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Eviction sweep received shutdown signal");
                    break;
                }
            }

            _ = ticker.tick() => {
                match store.evict_expired().await {
                    Ok(0) => {}
                    Ok(evicted) => debug!(evicted, "Eviction sweep removed expired snapshots"),
                    Err(e) => warn!(error = %e, "Eviction sweep failed"),
                }
            }
        }
    }
}
