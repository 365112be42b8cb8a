//! Layer façade: runs a [`TileEngine`] on a host runtime.
//!
//! ```ignore
//! let scene = Scene::new();
//! let layer = QuadEarthLayer::start(config, source, Arc::clone(&scene), &Handle::current())?;
//! layer.set_camera(camera)?;
//!
//! // Renderer side.
//! let mut view = scene.subscribe();
//! let snapshot = view.changed().await?;
//!
//! // Host teardown.
//! let report = layer.cleanup().await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{LayerError, TeardownReport, TileEngine};
use crate::config::EngineConfig;
use crate::lod::CameraState;
use crate::scene::Scene;
use crate::source::TextureSource;
use crate::telemetry::{EngineMetrics, TelemetrySnapshot};

/// Default interval between engine updates (about 60 Hz).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Consecutive failed updates after which the worker tears the layer down.
pub const MAX_CONSECUTIVE_UPDATE_FAILURES: u32 = 3;

enum LayerCommand {
    Cleanup(oneshot::Sender<Result<TeardownReport, LayerError>>),
}

/// Entry point for starting a layer.
pub struct QuadEarthLayer;

impl QuadEarthLayer {
    /// Spawns the engine loop onto `handle`.
    ///
    /// The engine updates once per [`DEFAULT_FRAME_INTERVAL`] once a camera
    /// has been set. Fetch tasks run on the same handle.
    pub fn start(
        config: EngineConfig,
        source: Arc<dyn TextureSource>,
        scene: Arc<Scene>,
        handle: &Handle,
    ) -> Result<LayerHandle, LayerError> {
        Self::start_with_interval(config, source, scene, handle, DEFAULT_FRAME_INTERVAL)
    }

    pub fn start_with_interval(
        config: EngineConfig,
        source: Arc<dyn TextureSource>,
        scene: Arc<Scene>,
        handle: &Handle,
        frame_interval: Duration,
    ) -> Result<LayerHandle, LayerError> {
        let texture_group = config.texture_group.clone();
        let engine = TileEngine::new(config, source, Arc::clone(&scene), handle.clone())?;
        let metrics = Arc::clone(engine.metrics());

        let (camera_tx, camera_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = handle.spawn(run_layer(
            engine,
            camera_rx,
            command_rx,
            shutdown.clone(),
            frame_interval,
        ));
        tracing::info!(texture_group = %texture_group, "Layer started");

        Ok(LayerHandle {
            camera_tx,
            commands: command_tx,
            shutdown,
            task,
            scene,
            metrics,
            texture_group,
        })
    }
}

/// Host-side control of a running layer.
///
/// Dropping the handle without [`cleanup`](Self::cleanup) still tears the
/// engine down on its worker.
pub struct LayerHandle {
    camera_tx: watch::Sender<Option<CameraState>>,
    commands: mpsc::UnboundedSender<LayerCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    scene: Arc<Scene>,
    metrics: Arc<EngineMetrics>,
    texture_group: String,
}

impl LayerHandle {
    /// Replaces the camera used by subsequent updates.
    pub fn set_camera(&self, camera: CameraState) -> Result<(), LayerError> {
        self.camera_tx
            .send(Some(camera))
            .map_err(|_| LayerError::TornDown)
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn texture_group(&self) -> &str {
        &self.texture_group
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Token that stops the layer when cancelled, e.g. on host shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tears the layer down and waits for the worker to exit.
    ///
    /// On return every drawable has been removed from the scene by one
    /// removals-only batch and no fetch result will be applied any more.
    pub async fn cleanup(self) -> Result<TeardownReport, LayerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(LayerCommand::Cleanup(reply_tx))
            .map_err(|_| LayerError::TornDown)?;
        let report = reply_rx.await.map_err(|_| LayerError::TornDown)??;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Layer worker ended abnormally");
        }
        Ok(report)
    }
}

async fn run_layer(
    mut engine: TileEngine,
    camera_rx: watch::Receiver<Option<CameraState>>,
    mut commands: mpsc::UnboundedReceiver<LayerCommand>,
    shutdown: CancellationToken,
    frame_interval: Duration,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = FailureStreak::default();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Layer shutting down");
                teardown(&mut engine);
                break;
            }

            command = commands.recv() => {
                match command {
                    Some(LayerCommand::Cleanup(reply)) => {
                        let _ = reply.send(engine.cleanup());
                    }
                    None => teardown(&mut engine),
                }
                break;
            }

            _ = ticker.tick() => {
                let camera = *camera_rx.borrow();
                if let Some(camera) = camera {
                    let result = engine.update(&camera, Instant::now());
                    if failures.record(&result) {
                        tracing::error!(
                            failures = failures.count,
                            "Layer keeps failing to update, tearing down"
                        );
                        teardown(&mut engine);
                        break;
                    }
                }
            }
        }
    }
    tracing::info!("Layer worker stopped");
}

/// Run of consecutive failed updates.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    /// Records one update. Returns true once the run reaches
    /// [`MAX_CONSECUTIVE_UPDATE_FAILURES`].
    fn record<T>(&mut self, result: &Result<T, LayerError>) -> bool {
        match result {
            Ok(_) => {
                self.count = 0;
                false
            }
            Err(e) => {
                self.count += 1;
                tracing::error!(error = %e, consecutive = self.count, "Layer update failed");
                self.count >= MAX_CONSECUTIVE_UPDATE_FAILURES
            }
        }
    }
}

fn teardown(engine: &mut TileEngine) {
    if let Err(e) = engine.cleanup() {
        tracing::error!(error = %e, "Layer teardown failed");
    }
}
