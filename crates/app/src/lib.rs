pub mod frames;
pub mod imaging;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use nss_core::config::{config_path, data_dir, BackendKind, NssConfig};
use nss_core::gpu::kernels::{upsample, warp};
use nss_core::gpu::{CommandQueue, Device, Texture, TextureDescriptor, TextureFormat};
use nss_core::host::{backend_for, build_upscaler};
use nss_core::logging::{self, FilterRequest, LogMode, DEFAULT_LOG_FILTER};
use nss_core::preprocess::InputFormats;
use nss_core::{EmbeddedModel, ModelDescriptor, Upscaler};

use crate::frames::{warped_output_name, FrameFiles, FrameSet};
use crate::imaging::Frame;

#[derive(Parser)]
#[command(name = "nss", about = "Temporal neural super-sampling of rendered frames")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Super-sample every color frame that has a full window of history.
    Upscale(UpscaleArgs),
    /// Upsample frames and reproject them along the following motion fields.
    Warp(WarpArgs),
    /// Print the model descriptor and its tensor layouts as JSON.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Directory with COLOR/DEPTH/MOTIONVECTORS frames")]
    input_dir: PathBuf,
    #[arg(help = "Directory that receives the upscaled COLOR frames")]
    output_dir: PathBuf,
    #[arg(long, default_value = "priamp-multi-frame-3fps-720p")]
    model: EmbeddedModel,
    #[arg(long, value_parser = parse_backend, help = "cuda, tensorrt, cpu or reference")]
    backend: Option<BackendKind>,
    #[arg(long)]
    models_dir: Option<PathBuf>,
}

#[derive(Args)]
struct WarpArgs {
    input_dir: PathBuf,
    output_dir: PathBuf,
    #[arg(long, default_value_t = 3)]
    frame_count: usize,
    #[arg(long, default_value_t = 2)]
    scale_factor: u32,
    #[arg(long, help = "Write EXR instead of the input's format")]
    float_output: bool,
    #[arg(long, help = "Warp DEPTH frames instead of COLOR frames")]
    depth_mode: bool,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long, default_value = "priamp-multi-frame-3fps-720p")]
    model: EmbeddedModel,
}

fn parse_backend(raw: &str) -> Result<BackendKind, String> {
    match raw.to_ascii_lowercase().as_str() {
        "cuda" | "tensorrt" | "trt" | "cpu" | "reference" | "ref" => {
            Ok(BackendKind::from_str_lossy(raw))
        }
        other => Err(format!("unknown backend `{other}`")),
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = LogMode::Cli;
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let lib_status = nss_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    nss_core::runtime::log_runtime_lib_status(&lib_status);
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));

    match cli.command {
        Commands::Upscale(args) => {
            let config = NssConfig::load_from_path(&cfg_path)?;
            tokio::task::spawn_blocking(move || run_upscale(args, config, &resolved_data_dir))
                .await
                .context("upscale task panicked")?
        }
        Commands::Warp(args) => {
            let config = NssConfig::load_from_path(&cfg_path)?;
            tokio::task::spawn_blocking(move || run_warp(args, &config))
                .await
                .context("warp task panicked")?
        }
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn init_logging(mode: LogMode, data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = data_dir.map(logging::install_panic_hook);
    if let Some(Err(error)) = &crash_hook {
        eprintln!("Warning: crash reports disabled: {error}");
    }

    let filters = FilterRequest::from_env(verbose, cli_log_filter).resolve();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let log_file = data_dir.map(|dir| logging::open_log_file(dir, mode));

    let installed = match log_file {
        Some(Ok(log_file)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file.writer)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(console_layer)
                    .with(file_layer),
            )
        }
        Some(Err(error)) => {
            let result = tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer),
            );
            warn!(%error, "Persistent file logging unavailable; continuing with console-only logging");
            result
        }
        None => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(console_layer),
        ),
    };
    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: LogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = mode.name(),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = mode.name(), pid, "Runtime startup metadata");
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 1;

fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }

    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn print_progress(done: u64, total: u64, total_elapsed: f64, fps_elapsed: f64) {
    let fps = compute_fps(done, fps_elapsed);
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    let eta = if fps > 0.0 {
        let remaining = total.saturating_sub(done) as f64;
        format!(" | ETA: {}", format_duration(remaining / fps))
    } else {
        String::new()
    };

    eprint!(
        "\r[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        done,
        total,
        fps,
        format_duration(total_elapsed),
        eta,
    );
}

/// Textures the upscale command feeds through the pipeline.
const CLI_INPUT_FORMATS: InputFormats = InputFormats {
    color: TextureFormat::Rgba32Float,
    depth: TextureFormat::R32Float,
    motion: Some(TextureFormat::Rg32Float),
};

struct UpscaleTask {
    device: Device,
    queue: CommandQueue,
    upscaler: Upscaler,
    output: Texture,
}

impl UpscaleTask {
    fn new(model: ModelDescriptor, config: &NssConfig, data_dir: &Path) -> Result<Self> {
        let device = Device::cpu_reference();
        let backend = backend_for(config, data_dir);
        let mut pipeline = config.pipeline.clone();
        pipeline.sync_mode = true;

        let output = device.create_texture(&TextureDescriptor::new(
            "nss.cli.output",
            model.output_extent(),
            TextureFormat::Rgba32Float,
        ));
        let upscaler = build_upscaler(
            &device,
            model,
            CLI_INPUT_FORMATS,
            &pipeline,
            backend,
            config.models_dir(data_dir),
        )
        .context("failed to load super-sampling model")?;
        let queue = device.create_command_queue("nss.cli");

        Ok(Self {
            device,
            queue,
            upscaler,
            output,
        })
    }

    fn texture(&self, label: &str, frame: &Frame, format: TextureFormat) -> Result<Texture> {
        let expected = self.upscaler.model().input_extent();
        if frame.extent != expected {
            bail!(
                "invalid resolution for {label}: expected {expected}, actual {}",
                frame.extent
            );
        }
        let texture = self
            .device
            .create_texture(&TextureDescriptor::new(label, frame.extent, format));
        texture.write_texels(&frame.texels)?;
        Ok(texture)
    }

    fn feed(&mut self, files: &FrameFiles) -> Result<()> {
        let color = imaging::load_rgba(&files.color)?;
        let depth = imaging::load_depth(&files.depth)?;
        let motion = imaging::load_motion(&files.motion)?;

        let color = self.texture("color", &color, CLI_INPUT_FORMATS.color)?;
        let depth = self.texture("depth", &depth, CLI_INPUT_FORMATS.depth)?;
        let motion = self.texture("motion", &motion, TextureFormat::Rg32Float)?;

        self.upscaler
            .process_with_queue(&color, &depth, Some(&motion), &self.output, &self.queue)
            .with_context(|| format!("failed to process frame {}", files.index))?;
        debug!(frame = files.index, "Frame processed");
        Ok(())
    }

    fn save_output(&self, path: &Path) -> Result<()> {
        let frame = Frame::rgba(self.output.extent(), self.output.read_texels());
        imaging::save_rgba(path, &frame)
    }
}

fn run_upscale(args: UpscaleArgs, mut config: NssConfig, data_dir: &Path) -> Result<()> {
    if let Some(backend) = args.backend {
        config.inference.backend = backend;
    }
    if let Some(models_dir) = args.models_dir {
        config.paths.models_dir = models_dir;
    }

    let model = args.model.descriptor();
    let frame_count = model.input_frame_count();
    let frames = FrameSet::discover(&args.input_dir)?;
    info!(
        color = frames.color.len(),
        depth = frames.depth.len(),
        motion = frames.motion.len(),
        input_dir = %args.input_dir.display(),
        "Discovered frames"
    );

    let windows = frames.upscale_windows(frame_count);
    if windows.is_empty() {
        warn!(frame_count, "No color frame has a complete window of history");
        return Ok(());
    }

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!(
            "failed to create output directory: {}",
            args.output_dir.display()
        )
    })?;

    info!(
        model = %args.model,
        backend = %config.inference.backend,
        windows = windows.len(),
        "Upscaling frames"
    );
    let mut task = UpscaleTask::new(model, &config, data_dir)?;

    let start = Instant::now();
    let total = windows.len() as u64;
    let mut last_fed = None;
    for (done, window) in windows.iter().enumerate() {
        let current = window
            .frames
            .last()
            .context("frame window is empty")?;
        let output_path = args.output_dir.join(
            current
                .color
                .file_name()
                .context("color frame has no file name")?,
        );
        if output_path.exists() {
            bail!("file already exists: {}", output_path.display());
        }

        for files in window.pending(last_fed) {
            task.feed(files)?;
        }
        last_fed = Some(window.index);

        task.save_output(&output_path)?;
        debug!(output = %output_path.display(), "Output frame written");

        let elapsed = start.elapsed().as_secs_f64();
        print_progress(done as u64 + 1, total, elapsed, elapsed);
    }

    eprintln!();
    info!(
        frames = total,
        elapsed = %format_duration(start.elapsed().as_secs_f64()),
        "Upscale completed"
    );
    Ok(())
}

/// Upsamples `source` and applies each motion field in turn, returning the
/// upsampled frame followed by every intermediate warp.
fn warp_sequence(
    source: &Frame,
    motion: &[Frame],
    scale: u32,
    filter: nss_core::gpu::UpsampleFilter,
) -> Result<Vec<Frame>> {
    let extent = source.extent.scaled(scale);
    let mut current = Frame {
        extent,
        channels: source.channels,
        texels: upsample(&source.texels, source.extent, source.channels, scale, filter),
    };
    let mut frames = Vec::with_capacity(motion.len() + 1);
    for field in motion {
        if field.extent != source.extent {
            bail!(
                "motion field is {}, expected {}",
                field.extent,
                source.extent
            );
        }
        let next = warp(
            &current.texels,
            extent,
            current.channels,
            &field.texels,
            field.extent,
            scale,
        );
        let warped = Frame {
            extent,
            channels: current.channels,
            texels: next,
        };
        frames.push(std::mem::replace(&mut current, warped));
    }
    frames.push(current);
    Ok(frames)
}

fn run_warp(args: WarpArgs, config: &NssConfig) -> Result<()> {
    if args.scale_factor == 0 {
        bail!("scale factor must be at least 1");
    }
    let frames = FrameSet::discover(&args.input_dir)?;
    let sources = if args.depth_mode {
        &frames.depth
    } else {
        &frames.color
    };
    info!(
        sources = sources.len(),
        motion = frames.motion.len(),
        depth_mode = args.depth_mode,
        "Discovered frames"
    );

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!(
            "failed to create output directory: {}",
            args.output_dir.display()
        )
    })?;

    for (&index, source_path) in sources {
        let motion_paths = frames.following_motion(index, args.frame_count);
        let extension = if args.float_output {
            "exr"
        } else {
            source_path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("png")
        };

        let outputs = (0..=motion_paths.len())
            .map(|k| {
                warped_output_name(source_path, k, extension)
                    .map(|name| args.output_dir.join(name))
                    .context("source frame has no usable file name")
            })
            .collect::<Result<Vec<_>>>()?;
        if outputs.iter().all(|path| path.exists()) {
            debug!(frame = index, "Warped outputs already exist, skipping");
            continue;
        }

        let source = imaging::load_rgba(source_path)?;
        let motion = motion_paths
            .iter()
            .map(|path| imaging::load_motion(path))
            .collect::<Result<Vec<_>>>()?;
        let warped = warp_sequence(
            &source,
            &motion,
            args.scale_factor,
            config.pipeline.upsample_filter,
        )?;

        for (path, frame) in outputs.iter().zip(&warped) {
            if path.exists() {
                continue;
            }
            imaging::save_rgba(path, frame)?;
            info!(output = %path.display(), "Warped frame written");
        }
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let summary = args.model.descriptor().summary();
    let rendered =
        serde_json::to_string_pretty(&summary).context("failed to render model summary")?;
    println!("{rendered}");
    Ok(())
}


#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn upscale_defaults_to_embedded_model() {
        let cli = Cli::try_parse_from(["nss", "upscale", "in", "out"]).expect("parse");
        let Commands::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.model, EmbeddedModel::PriampMultiFrame3fps720p);
        assert_eq!(args.backend, None);
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "nss",
            "warp",
            "in",
            "out",
            "--frame-count",
            "4",
            "-vv",
            "--data-dir",
            "/tmp/nss",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/nss")));
        let Commands::Warp(args) = cli.command else {
            panic!("expected warp");
        };
        assert_eq!(args.frame_count, 4);
        assert_eq!(args.scale_factor, 2);
        assert!(!args.depth_mode);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(parse_backend("metal").is_err());
        assert_eq!(parse_backend("TRT"), Ok(BackendKind::Tensorrt));
        assert_eq!(parse_backend("reference"), Ok(BackendKind::Reference));
    }
}
