//! Scripted camera flight against a running layer.
//!
//! Starts a [`QuadEarthLayer`] with the configured texture group, flies the
//! camera from one altitude to another over a fixed number of frames and
//! reports what the renderer side observed before tearing the layer down.

use std::f64::consts::FRAC_PI_3;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use quadearth::config::{ConfigFile, Size, SourceKind, SourceSettings};
use quadearth::engine::TeardownReport;
use quadearth::lod::CameraState;
use quadearth::scene::{PublishBatch, Scene};
use quadearth::source::{
    DirectoryTextureGroup, HttpTextureGroup, SyntheticTextureGroup, TextureSource,
};
use quadearth::QuadEarthLayer;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CliError;

/// Arguments of `quadearth simulate`.
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Longitude of the flight path in degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub lon: f64,

    /// Latitude of the flight path in degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub lat: f64,

    /// Starting altitude in globe radii
    #[arg(long, default_value_t = 3.0)]
    pub from: f64,

    /// Final altitude in globe radii
    #[arg(long, default_value_t = 0.01)]
    pub to: f64,

    /// Longitude drift over the whole flight, in degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub drift: f64,

    /// Number of camera updates
    #[arg(long, default_value_t = 600)]
    pub frames: u32,

    /// Milliseconds between camera updates
    #[arg(long, default_value_t = 16)]
    pub interval_ms: u64,

    /// Viewport size as WIDTHxHEIGHT
    #[arg(long, default_value = "1920x1080", value_parser = parse_viewport)]
    pub viewport: (u32, u32),

    /// Texture source (overrides [layer] source)
    #[arg(long)]
    pub source: Option<SourceKind>,

    /// Directory root or URL template (overrides [layer] location)
    #[arg(long)]
    pub location: Option<String>,

    /// Deepest level to refine to (overrides [lod] max_level)
    #[arg(long)]
    pub max_level: Option<u8>,

    /// Cache budget, e.g. 64MB (overrides [cache] budget)
    #[arg(long)]
    pub cache: Option<Size>,
}

/// What the renderer side saw during a flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: u64,
    pub additions: u64,
    pub removals: u64,
    pub lagged: u64,
    /// Whether the last batch seen removed without adding.
    pub last_removals_only: bool,
}

impl BatchStats {
    fn record(&mut self, batch: &PublishBatch) {
        self.batches += 1;
        self.additions += batch.additions().count() as u64;
        self.removals += batch.removals().count() as u64;
        self.last_removals_only = batch.is_removals_only();
    }
}

/// Runs the flight on a fresh multi-threaded runtime.
pub fn run(args: SimulateArgs, mut config: ConfigFile) -> Result<(), CliError> {
    apply_overrides(&args, &mut config);
    config
        .engine
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("quadearth")
        .build()
        .map_err(CliError::Runtime)?;
    let (stats, teardown) = runtime.block_on(fly(&args, config))?;

    println!();
    println!("Batches observed: {} ({} lagged)", stats.batches, stats.lagged);
    println!("  Drawables added:   {}", stats.additions);
    println!("  Drawables removed: {}", stats.removals);
    println!(
        "Teardown: version {}, {} drawables removed, {} fetches cancelled, {} entries released",
        teardown.version,
        teardown.removed,
        teardown.cancelled_in_flight,
        teardown.released_entries
    );
    if teardown.removed > 0 && !stats.last_removals_only {
        println!("Warning: final batch was not removals-only");
    }
    Ok(())
}

fn apply_overrides(args: &SimulateArgs, config: &mut ConfigFile) {
    if let Some(kind) = args.source {
        config.source.kind = kind;
    }
    if let Some(location) = &args.location {
        config.source.location = Some(location.clone());
    }
    if let Some(level) = args.max_level {
        config.engine.lod.max_level = level;
    }
    if let Some(budget) = args.cache {
        config.engine.cache.budget_bytes = budget.bytes();
    }
}

async fn fly(
    args: &SimulateArgs,
    config: ConfigFile,
) -> Result<(BatchStats, TeardownReport), CliError> {
    let source = build_source(&config.source, &config.engine.texture_group)?;
    let scene = Scene::with_batch_capacity(config.batch_capacity);
    let stop = CancellationToken::new();
    let watcher = watch_batches(&scene, stop.clone());

    let radius = config.engine.globe_radius;
    let layer = QuadEarthLayer::start(
        config.engine,
        source,
        Arc::clone(&scene),
        &tokio::runtime::Handle::current(),
    )?;
    info!(
        texture_group = layer.texture_group(),
        frames = args.frames,
        "Starting flight"
    );

    let (width, height) = args.viewport;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let report_every = (args.frames / 10).max(1);
    for frame in 0..args.frames {
        ticker.tick().await;
        let (lon, lat, altitude) = flight_position(args, frame);
        let camera = CameraState::orbit(
            lon.to_radians(),
            lat.to_radians(),
            altitude * radius,
            radius,
            FRAC_PI_3,
            width,
            height,
        );
        layer.set_camera(camera)?;

        if frame % report_every == 0 {
            let snapshot = scene.latest();
            info!(
                frame,
                altitude_km = altitude * radius / 1000.0,
                version = %snapshot.version(),
                drawn = snapshot.len(),
                "Flight progress"
            );
        }
    }

    let telemetry = layer.telemetry();
    let teardown = layer.cleanup().await?;
    stop.cancel();
    let stats = watcher.await.unwrap_or_default();

    println!("{}", telemetry);
    Ok((stats, teardown))
}

/// Camera position for `frame`: altitude falls geometrically from `from`
/// to `to` while longitude drifts linearly.
fn flight_position(args: &SimulateArgs, frame: u32) -> (f64, f64, f64) {
    let t = if args.frames > 1 {
        frame as f64 / (args.frames - 1) as f64
    } else {
        1.0
    };
    let from = args.from.max(1e-6);
    let to = args.to.max(1e-6);
    let altitude = from * (to / from).powf(t);
    (args.lon + args.drift * t, args.lat.clamp(-90.0, 90.0), altitude)
}

fn watch_batches(scene: &Scene, stop: CancellationToken) -> JoinHandle<BatchStats> {
    let mut batches = scene.subscribe_batches();
    tokio::spawn(async move {
        let mut stats = BatchStats::default();
        loop {
            tokio::select! {
                biased;

                batch = batches.recv() => match batch {
                    Ok(batch) => stats.record(&batch),
                    Err(RecvError::Lagged(n)) => stats.lagged += n,
                    Err(RecvError::Closed) => break,
                },

                _ = stop.cancelled() => break,
            }
        }
        stats
    })
}

/// Creates the texture group named by `settings`.
pub fn build_source(
    settings: &SourceSettings,
    group: &str,
) -> Result<Arc<dyn TextureSource>, CliError> {
    match settings.kind {
        SourceKind::Synthetic => Ok(Arc::new(SyntheticTextureGroup::new(group))),
        SourceKind::Directory => {
            let root = settings.location.as_deref().ok_or_else(|| {
                CliError::Config("directory source requires a location".to_string())
            })?;
            Ok(Arc::new(DirectoryTextureGroup::new(root, group)))
        }
        SourceKind::Http => {
            let template = settings.location.as_deref().ok_or_else(|| {
                CliError::Config("http source requires a URL template as location".to_string())
            })?;
            Ok(Arc::new(HttpTextureGroup::new(template, group)?))
        }
    }
}

fn parse_viewport(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let width: u32 = w.trim().parse().map_err(|_| format!("invalid width '{}'", w))?;
    let height: u32 = h.trim().parse().map_err(|_| format!("invalid height '{}'", h))?;
    if width == 0 || height == 0 {
        return Err("viewport must be non-empty".to_string());
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: SimulateArgs,
    }

    fn parse(argv: &[&str]) -> SimulateArgs {
        let mut full = vec!["simulate"];
        full.extend_from_slice(argv);
        Harness::parse_from(full).args
    }

    #[test]
    fn test_viewport_parsing() {
        assert_eq!(parse_viewport("800x600"), Ok((800, 600)));
        assert_eq!(parse_viewport("1920X1080"), Ok((1920, 1080)));
        assert!(parse_viewport("800").is_err());
        assert!(parse_viewport("0x600").is_err());
    }

    #[test]
    fn test_flight_descends_geometrically() {
        let args = parse(&["--from", "4", "--to", "0.04", "--frames", "3", "--drift", "-10"]);
        let (lon0, _, alt0) = flight_position(&args, 0);
        let (_, _, alt1) = flight_position(&args, 1);
        let (lon2, _, alt2) = flight_position(&args, 2);
        assert!((alt0 - 4.0).abs() < 1e-9);
        assert!((alt1 - 0.4).abs() < 1e-9);
        assert!((alt2 - 0.04).abs() < 1e-9);
        assert_eq!(lon0, 0.0);
        assert!((lon2 + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_overrides_replace_file_settings() {
        let args = parse(&[
            "--source", "directory", "--location", "/tiles", "--max-level", "7", "--cache",
            "64MB",
        ]);
        let mut config = ConfigFile::default();
        apply_overrides(&args, &mut config);
        assert_eq!(config.source.kind, SourceKind::Directory);
        assert_eq!(config.source.location.as_deref(), Some("/tiles"));
        assert_eq!(config.engine.lod.max_level, 7);
        assert_eq!(config.engine.cache.budget_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_sources_need_locations() {
        let settings = SourceSettings {
            kind: SourceKind::Http,
            location: None,
        };
        assert!(matches!(
            build_source(&settings, "earth"),
            Err(CliError::Config(_))
        ));
        let synthetic = build_source(&SourceSettings::default(), "earth").unwrap();
        assert_eq!(synthetic.name(), "earth");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_flight_tears_down_cleanly() {
        let args = parse(&[
            "--from", "5", "--to", "1", "--frames", "20", "--interval-ms", "2", "--max-level", "2",
        ]);
        let mut config = ConfigFile::default();
        apply_overrides(&args, &mut config);
        let (stats, teardown) = fly(&args, config).await.unwrap();
        assert_eq!(stats.removals, stats.additions);
        if teardown.removed > 0 {
            assert!(stats.last_removals_only);
        }
    }
}
