//! Engine construction from configuration, with overrides for tests and
//! embedding.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{run, sweep, Engine, Inner};
use crate::bandwidth::BandwidthGovernor;
use crate::checkpoint::ResumeCoordinator;
use crate::config::FerryConfig;
use crate::control::JobControl;
use crate::events::EventBus;
use crate::job::JobRegistry;
use crate::queue::AdmissionQueue;
use crate::retry::RetrySupervisor;
use crate::schedule::TimeScheduler;
use crate::store::{HistoryRecorder, HistoryStore, NoopStore};
use crate::transfer::{build_transports, ShareLinkResolver, TransferSettings, Transport};

pub struct EngineBuilder {
    config: FerryConfig,
    state_dir: Option<PathBuf>,
    transports: Option<Vec<Arc<dyn Transport>>>,
    history: Option<Arc<dyn HistoryStore>>,
    event_capacity: usize,
}

impl EngineBuilder {
    pub fn new(config: FerryConfig) -> Self {
        Self {
            config,
            state_dir: None,
            transports: None,
            history: None,
            event_capacity: 1024,
        }
    }

    /// Where checkpoints live; defaults to the configured state dir.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Replace the configured transport strategies, in fallback order.
    pub fn transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the engine and start its background tasks. Must be called
    /// inside a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let cfg = self.config;
        let state_dir = match self.state_dir {
            Some(dir) => dir,
            None => cfg.resolve_state_dir()?,
        };
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("create state dir {}", state_dir.display()))?;

        let settings = TransferSettings::from_config(&cfg);
        let transports = self
            .transports
            .unwrap_or_else(|| build_transports(&cfg.transports, &settings));
        if transports.is_empty() {
            anyhow::bail!("no transport strategies configured");
        }
        let history = self.history.unwrap_or_else(|| Arc::new(NoopStore));
        let links = cfg
            .resolve_share_links
            .then(|| ShareLinkResolver::new(&settings));

        let registry = Arc::new(JobRegistry::new());
        let events = EventBus::new(self.event_capacity);
        let supervisor = RetrySupervisor::new(
            cfg.retry_policy(),
            transports,
            Arc::clone(&registry),
            events.clone(),
        );
        let governor = Arc::new(BandwidthGovernor::new(
            cfg.bandwidth.default.clone(),
            cfg.bandwidth.owners.clone(),
        ));

        tracing::info!(
            max_concurrent = cfg.max_concurrent,
            state_dir = %state_dir.display(),
            transports = ?cfg.transports,
            "engine starting"
        );

        let inner = Arc::new(Inner {
            queue: AdmissionQueue::new(cfg.max_concurrent),
            checkpoints: ResumeCoordinator::new(&state_dir),
            history: HistoryRecorder::spawn(history),
            control: JobControl::new(),
            scheduler: TimeScheduler::new(),
            wake: Notify::new(),
            schedules_changed: Notify::new(),
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            settings,
            links,
            registry,
            supervisor,
            governor,
            events,
            state_dir,
            config: cfg,
        });

        inner.tasks.spawn(run::admission_loop(Arc::clone(&inner)));
        inner.tasks.spawn(sweep::sweep_loop(Arc::clone(&inner)));
        Ok(Engine { inner })
    }
}
