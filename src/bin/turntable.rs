use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use turntable::selection::{self, Window};
use turntable::{
    DownloadCoordinator, Driver, EventLog, FfmpegEncoder, GpuDevices, GpuPool, HttpFetcher,
    ManifestResolver, PipelineConfig, Publisher, RenderOrchestrator, RenderSettings, Unpacker,
};

#[derive(Parser, Debug)]
#[command(name = "turntable", version)]
struct Cli {
    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download assets listed in a text file into the local cache.
    Download(DownloadArgs),
    /// Render, package and upload locally cached assets.
    Render(RenderArgs),
    /// Extract every archive in a renders directory.
    Unpack(UnpackArgs),
}

#[derive(Parser, Debug)]
struct DownloadArgs {
    /// Text file with one asset identifier per line.
    #[arg(long, required_unless_present = "category")]
    ids: Option<PathBuf>,

    /// Also take every asset annotated with this category (repeatable).
    #[arg(long)]
    category: Vec<String>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local cache root.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Parallel downloads (defaults to the host core count).
    #[arg(long)]
    processes: Option<usize>,

    /// First identifier to take from the list.
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Identifiers to take (defaults to the rest of the list).
    #[arg(long)]
    count: Option<usize>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Destination for archives: a path, `file://` or `ssh://[user@]host/path`.
    #[arg(long)]
    render_dir: Option<String>,

    /// Root that asset paths in the object mapping are relative to.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Frames per camera view.
    #[arg(long)]
    num_renders: Option<u32>,

    /// Device count (`0` for CPU) or comma-separated device indices.
    #[arg(long)]
    gpu_devices: Option<GpuDevices>,

    /// Renderer wall-clock limit in seconds.
    #[arg(long)]
    render_timeout: Option<u64>,

    #[arg(long)]
    only_northern_hemisphere: bool,

    /// Identifiers to render, one per line (default `<download dir>/objects_with_texture.txt`).
    #[arg(long)]
    objects_file: Option<PathBuf>,

    /// Gzipped identifier → path mapping (default `<download dir>/object-paths.json.gz`).
    #[arg(long)]
    object_paths: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    start: usize,

    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Keep job directories here so interrupted jobs resume.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Package format.
    #[arg(long, value_enum, default_value_t = ArchiveFormat::Zip)]
    format: ArchiveFormat,

    /// Skip assets that already have a success log entry.
    #[arg(long)]
    skip_completed: bool,
}

#[derive(Parser, Debug)]
struct UnpackArgs {
    /// Directory holding `*.zip` archives.
    dir: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ArchiveFormat {
    Zip,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Command::Download(args) => cmd_download(args),
        Command::Render(args) => cmd_render(args),
        Command::Unpack(args) => cmd_unpack(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(p) => Ok(PipelineConfig::from_path(p)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_download(args: DownloadArgs) -> anyhow::Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(dir) = args.download_dir {
        cfg.download_root = dir;
    }
    if args.processes.is_some() {
        cfg.processes = args.processes;
    }
    cfg.validate()?;
    let cfg = cfg.expanded();

    let fetcher = Arc::new(HttpFetcher::new()?);
    let resolver = Arc::new(ManifestResolver::new(
        &cfg.download_root,
        &cfg.remote_base_url,
        fetcher.clone(),
    ));

    let mut ids = match &args.ids {
        Some(path) => selection::read_ids(path)?,
        None => Vec::new(),
    };
    if !args.category.is_empty() {
        let tagged = resolver.ids_in_categories(args.category.as_slice())?;
        tracing::info!(categories = args.category.len(), assets = tagged.len(), "category selection");
        ids.extend(tagged);
    }
    let count = args.count.unwrap_or(ids.len());
    let ids = selection::window(
        &ids,
        Window {
            start: args.start,
            count,
        },
    )?;

    let coordinator =
        DownloadCoordinator::new(&cfg.download_root, &cfg.remote_base_url, resolver, fetcher);
    let report = coordinator.fetch(ids.as_slice(), cfg.download_parallelism())?;

    eprintln!(
        "{} available, {} downloaded, {} unknown, {} failed",
        report.paths.len(),
        report.downloaded,
        report.unknown.len(),
        report.failures.len()
    );
    for (id, err) in &report.failures {
        eprintln!("  {id}: {err}");
    }
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(dir) = args.render_dir {
        cfg.render_dir = dir;
    }
    if let Some(dir) = args.download_dir {
        cfg.download_root = dir;
    }
    if let Some(n) = args.num_renders {
        cfg.num_renders = n;
    }
    if let Some(devices) = args.gpu_devices {
        cfg.gpu_devices = Some(devices);
    }
    if let Some(secs) = args.render_timeout {
        cfg.render_timeout_secs = secs;
    }
    if args.work_dir.is_some() {
        cfg.work_dir = args.work_dir;
    }
    cfg.only_northern_hemisphere |= args.only_northern_hemisphere;
    cfg.skip_completed |= args.skip_completed;
    match args.format {
        ArchiveFormat::Zip => {}
    }
    cfg.validate()?;
    let cfg = cfg.expanded();

    let objects_file = args
        .objects_file
        .unwrap_or_else(|| cfg.download_root.join("objects_with_texture.txt"));
    let object_paths = args
        .object_paths
        .unwrap_or_else(|| cfg.download_root.join(turntable::manifest::MANIFEST_FILE));
    let assets = selection::select_local_from_files(
        &objects_file,
        &object_paths,
        &cfg.download_root,
        Window {
            start: args.start,
            count: args.count,
        },
    )?;

    let devices = cfg.gpu_devices.clone().unwrap_or_else(GpuDevices::detect);
    tracing::info!(devices = ?devices, "render devices");
    let orchestrator = RenderOrchestrator::new(
        RenderSettings::from_config(&cfg),
        GpuPool::new(devices, cfg.lease_dir()),
        FfmpegEncoder::new(cfg.encoder.clone())?,
    )?;

    let mut publisher = Publisher::for_destination(&cfg.render_dir)?;
    if cfg.unpack_after_upload {
        publisher = publisher.with_unpacker(Unpacker::spawn()?);
    }
    let log = EventLog::open(&cfg.log_dir)
        .with_context(|| format!("open event log in '{}'", cfg.log_dir.display()))?;

    let summary = Driver::new(orchestrator, publisher, log)
        .skip_completed(cfg.skip_completed)
        .run(&assets)?;

    eprintln!(
        "rendered {}, skipped {}, failed {}, {} camera views pending, {} archives unpacked",
        summary.rendered,
        summary.skipped,
        summary.failed,
        summary.pending_cameras,
        summary.unpack.extracted()
    );
    Ok(())
}

fn cmd_unpack(args: UnpackArgs) -> anyhow::Result<()> {
    let summary = turntable::publish::unpack::unpack_dir(&args.dir)?;
    for event in &summary.events {
        if let Err(e) = &event.result {
            eprintln!("failed {}: {e}", event.archive.display());
        }
    }
    eprintln!(
        "extracted {} of {} archives in {}",
        summary.extracted(),
        summary.events.len(),
        args.dir.display()
    );
    Ok(())
}
