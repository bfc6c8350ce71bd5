//! Service orchestrator wiring the subsystems together.
//!
//! [`Homeshare`] loads the registry, owns the share engine and the preview
//! pipeline, and runs the periodic persistence task. It is the handle a
//! protocol front-end is given; there is no global state.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use model::UserConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::{Sandbox, ShareView, Visitor};
use crate::preview::{
    preview_output_path, Converter, ConverterScript, MediaKind, PreviewError, PreviewPipeline,
    SubmitOutcome,
};
use crate::registry::{spawn_persistence_task, RegistryStore};
use crate::shares::{ShareEngine, ShareError};

/// Service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not started, or fully stopped.
    Stopped,
    /// Persistence task and preview workers are running.
    Running,
    /// Stop requested; draining.
    ShuttingDown,
}

/// The running service.
pub struct Homeshare {
    /// Configuration.
    config: Config,
    /// Current state.
    state: ServiceState,
    /// Identity registry.
    registry: Arc<RegistryStore>,
    /// Share propagation and access.
    shares: ShareEngine,
    /// Converter script, when previews are enabled.
    script: Option<ConverterScript>,
    /// Preview pipeline; created on start.
    previews: Option<PreviewPipeline>,
    /// Periodic persistence task.
    persistence: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl Homeshare {
    /// Loads the registry and prepares the storage root.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(
            RegistryStore::load(&config.storage.registry_path)
                .context("Failed to load registry")?,
        );

        fs::create_dir_all(&config.storage.root).with_context(|| {
            format!(
                "Failed to create storage root: {}",
                config.storage.root.display()
            )
        })?;

        sync_settings(&registry, &config)?;

        let shares = ShareEngine::new(&config.storage.root, Arc::clone(&registry));
        let script = config.preview.converter_script();
        if script.is_none() {
            info!("No converter script configured, previews disabled");
        }

        Ok(Self {
            config,
            state: ServiceState::Stopped,
            registry,
            shares,
            script,
            previews: None,
            persistence: None,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Starts the persistence task and the preview workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServiceState::Stopped {
            anyhow::bail!("Service already started");
        }

        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }

        self.persistence = Some(spawn_persistence_task(
            Arc::clone(&self.registry),
            self.config.storage.save_interval(),
            self.shutdown_token.clone(),
        ));

        if self.script.is_some() {
            self.previews = Some(PreviewPipeline::new(
                Converter::new(&self.config.preview.shell),
                self.config.preview.pipeline_options(),
            ));
        }

        self.state = ServiceState::Running;
        info!(
            "Homeshare started (storage {:?}, registry {:?})",
            self.config.storage.root,
            self.registry.path()
        );
        Ok(())
    }

    /// Stops the workers and flushes the registry one last time.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != ServiceState::Running {
            debug!("Stop requested while {:?}", self.state);
            return Ok(());
        }
        self.state = ServiceState::ShuttingDown;
        self.shutdown_token.cancel();

        if let Some(handle) = self.persistence.take() {
            if let Err(e) = handle.await {
                warn!("Persistence task ended abnormally: {}", e);
            }
        }
        if let Some(previews) = self.previews.take() {
            previews.shutdown().await;
        }

        // The task's final flush may have failed; try once more.
        self.registry
            .flush()
            .context("Failed to persist registry on shutdown")?;

        self.state = ServiceState::Stopped;
        info!("Homeshare stopped");
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The identity registry.
    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.registry
    }

    /// The share engine.
    pub fn shares(&self) -> &ShareEngine {
        &self.shares
    }

    /// Token cancelled when the service stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The private sandbox of `name`, with that identity's permissions.
    pub fn sandbox_for(&self, name: &str) -> Result<Sandbox, ShareError> {
        let user = self
            .registry
            .lookup_by_name(name)?
            .ok_or_else(|| ShareError::NotFound(name.to_string()))?;
        Ok(Sandbox::for_user(&self.config.storage.root, &user))
    }

    /// The share behind `hash` as seen by `visitor`.
    pub fn share_view(&self, visitor: &Visitor, hash: &str) -> Result<ShareView, ShareError> {
        self.shares.open_view(visitor, hash)
    }

    /// Requests the preview of `virtual_path` in `owner`'s sandbox.
    ///
    /// Returns the preview path together with what the pipeline did.
    /// Fails with `QueueClosed` when previews are disabled or stopped.
    pub async fn request_preview(
        &self,
        owner: &UserConfig,
        virtual_path: &str,
    ) -> Result<(PathBuf, SubmitOutcome), PreviewError> {
        let (Some(previews), Some(script)) = (&self.previews, &self.script) else {
            return Err(PreviewError::QueueClosed);
        };

        let sandbox = Sandbox::for_user(&self.config.storage.root, owner);
        let input = sandbox
            .resolve(virtual_path)
            .map_err(|e| PreviewError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, e)))?;
        let kind = MediaKind::from_path(&input).ok_or_else(|| {
            PreviewError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no preview for {virtual_path}"),
            ))
        })?;

        let output = preview_output_path(
            &self.config.preview.cache_dir.join(&owner.username),
            virtual_path,
            kind,
        );
        let outcome = previews
            .submit(script.request(input, output.clone(), kind))
            .await?;
        Ok((output, outcome))
    }

    /// Drops the cached preview of `virtual_path` in `owner`'s sandbox.
    pub async fn invalidate_preview(
        &self,
        owner: &UserConfig,
        virtual_path: &str,
    ) -> Result<bool, PreviewError> {
        let Some(previews) = &self.previews else {
            return Ok(false);
        };
        let Some(kind) = MediaKind::from_path(std::path::Path::new(virtual_path)) else {
            return Ok(false);
        };
        let output = preview_output_path(
            &self.config.preview.cache_dir.join(&owner.username),
            virtual_path,
            kind,
        );
        previews.invalidate(&output).await
    }
}

/// Records the bootstrap configuration in the registry snapshot.
fn sync_settings(registry: &RegistryStore, config: &Config) -> Result<()> {
    let changed = registry
        .read(|state| {
            let settings = &state.config().settings;
            settings.listen_addr != config.storage.listen_addr
                || settings.persist_path != config.storage.registry_path
                || settings.save_interval_secs != config.storage.save_interval_secs
        })
        .context("Failed to read registry settings")?;
    if !changed {
        return Ok(());
    }

    registry
        .write(|state| {
            let settings = state.settings_mut();
            settings.listen_addr = config.storage.listen_addr.clone();
            settings.persist_path = config.storage.registry_path.clone();
            settings.save_interval_secs = config.storage.save_interval_secs;
            Ok(())
        })
        .context("Failed to update registry settings")?;
    debug!("Registry settings updated from configuration");
    Ok(())
}
