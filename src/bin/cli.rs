//! bbsxfer CLI - Command-line interface
//!
//! Sends and receives files over TCP with the native protocols or the
//! configured external ones, and answers queue planning questions.

use anyhow::Context;
use bbsxfer_core::cli::{print_exit_codes, CliResult, ExitCodes};
use bbsxfer_core::config::{LoggingConfig, PolicySettings, XferConfig};
use bbsxfer_core::core::batch::{BatchEntry, BatchQueue, DirectoryId, Direction};
use bbsxfer_core::core::context::{LocalFileStore, SessionPolicy, TransferContext};
use bbsxfer_core::core::dispatch::{self, BatchSummary, SingleOutcome};
use bbsxfer_core::core::external::{ExternalDelegate, ExternalOutcome, SystemProcessRunner};
use bbsxfer_core::core::registry::{
    KeyPress, ProtocolId, ProtocolRegistry, ProtocolSelector, Selection, TransferKind,
};
use bbsxfer_core::core::transfer::{CancelFlag, TransferProgress};
use bbsxfer_core::core::transport::{TcpChannel, TcpConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Operation kinds as named on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Upload,
    Download,
    UploadTemp,
    DownloadTemp,
    UploadBatch,
    DownloadBatch,
    Bidirectional,
}

impl From<KindArg> for TransferKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Upload => TransferKind::Upload,
            KindArg::Download => TransferKind::Download,
            KindArg::UploadTemp => TransferKind::UploadTemp,
            KindArg::DownloadTemp => TransferKind::DownloadTemp,
            KindArg::UploadBatch => TransferKind::UploadBatch,
            KindArg::DownloadBatch => TransferKind::DownloadBatch,
            KindArg::Bidirectional => TransferKind::Bidirectional,
        }
    }
}

/// bbsxfer CLI
#[derive(Parser, Debug)]
#[command(
    name = "bbsxfer",
    version,
    about = "XMODEM/YMODEM file transfer with BBS-style batch queueing",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (no progress)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "BBSXFER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Host to connect to, or address to listen on with --listen
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// TCP port
    #[arg(short, long, default_value = "2323")]
    port: u16,

    /// Wait for the peer to connect instead of dialing
    #[arg(short, long)]
    listen: bool,

    /// Connect timeout (seconds)
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Protocol name or menu key; defaults to the remembered protocol
    #[arg(short = 'P', long)]
    protocol: Option<String>,

    /// Link speed for estimates and external programs (bps)
    #[arg(long)]
    speed: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send files to the peer
    Send {
        #[command(flatten)]
        link: LinkArgs,

        /// Files to send; more than one makes a batch
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Receive files from the peer
    Receive {
        #[command(flatten)]
        link: LinkArgs,

        /// Directory the files are stored in
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Receive a single file under this name instead of a batch
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List protocols and their keys for an operation
    Protocols {
        /// Operation kind
        #[arg(short, long, value_enum, default_value_t = KindArg::Download)]
        kind: KindArg,
    },

    /// Estimate batch download time
    Estimate {
        /// Link speed (bps)
        #[arg(short, long)]
        speed: Option<u32>,

        /// Files to queue
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print exit code table
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.message().unwrap_or("Configuration error"));
            return e.to_exit_code();
        }
    };
    init_logging(&cli, &config.logging);

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.cancel()) {
        tracing::warn!("Could not install Ctrl+C handler: {}", e);
    }

    let result = match run(&cli, config, cancel).await {
        Ok(result) => result,
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    };

    match (&result, cli.format) {
        (CliResult::Success(Some(msg)), OutputFormat::Text) if !cli.quiet => println!("{msg}"),
        (CliResult::Error(code, msg), _) => {
            tracing::error!(code, "{}", msg);
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": msg, "code": code }));
            }
        }
        _ => {}
    }
    result.to_exit_code()
}

fn load_config(path: Option<&Path>) -> Result<XferConfig, CliResult> {
    let loaded = match path {
        Some(path) => XferConfig::load_from(path),
        None => XferConfig::load(),
    };
    loaded.map_err(|e| CliResult::from(&e))
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) {
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: &Cli, config: XferConfig, cancel: CancelFlag) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Send { link, files } => send(cli, config, link, files, cancel).await,
        Commands::Receive { link, output, name } => {
            receive(cli, config, link, output, name.as_deref(), cancel).await
        }
        Commands::Protocols { kind } => list_protocols(cli, &config, (*kind).into()),
        Commands::Estimate { speed, files } => estimate(cli, &config, *speed, files),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

fn delegate_for(config: &XferConfig) -> ExternalDelegate {
    let mut delegate = ExternalDelegate::new(Arc::new(SystemProcessRunner), config.work_dir())
        .with_protocols(config.external.clone())
        .with_zmodem(config.zmodem.clone());
    if let Some(port) = &config.paths.port {
        delegate = delegate.with_port(port.clone());
    }
    if let Some(log) = &config.paths.dsz_log {
        delegate = delegate.with_dsz_log(log.clone());
    }
    delegate
}

fn policy_for(settings: &PolicySettings) -> SessionPolicy {
    let policy = match settings.time_limit_mins {
        Some(mins) => SessionPolicy::new(Duration::from_secs(mins * 60)),
        None => SessionPolicy::unlimited(),
    };
    policy
        .with_required_ratio(settings.required_ratio)
        .with_ratio_exempt(settings.ratio_exempt)
}

/// Pick a protocol the way the transfer menu does
///
/// A single character is a menu key, anything longer a protocol name, and
/// no argument means Enter. A first explicit choice is saved as the default.
fn choose_protocol(
    config: &mut XferConfig,
    config_path: Option<&Path>,
    registry: &ProtocolRegistry,
    kind: TransferKind,
    requested: Option<&str>,
) -> Result<ProtocolId, CliResult> {
    let listing = registry.listing(kind);
    let default = config
        .default_protocol
        .as_deref()
        .and_then(|name| registry.find_by_name(name))
        .map(|d| d.id);
    let mut selector = ProtocolSelector::new(default);

    let key = match requested {
        None => KeyPress::Enter,
        Some(arg) if arg.chars().count() == 1 => KeyPress::Char(arg.chars().next().unwrap_or('?')),
        Some(name) => match registry
            .find_by_name(name)
            .and_then(|d| listing.iter().find(|c| c.id == d.id))
        {
            Some(choice) => KeyPress::Char(choice.key),
            None => {
                return Err(CliResult::error(
                    ExitCodes::INVALID_ARGS,
                    format!("{name} cannot be used to {kind}"),
                ))
            }
        },
    };

    let id = match selector.select(&listing, key) {
        Selection::Chosen(ProtocolId::Batch) => {
            return Err(CliResult::error(
                ExitCodes::INVALID_ARGS,
                "Batch only queues files; pass several files to send a batch",
            ))
        }
        Selection::Chosen(id) => id,
        Selection::Quit => return Err(CliResult::error(ExitCodes::CANCELLED, "Quit")),
        Selection::Help | Selection::Invalid => {
            let names: Vec<String> = listing.iter().map(|c| format!("[{}] {}", c.key, c.name)).collect();
            return Err(CliResult::error(
                ExitCodes::INVALID_ARGS,
                format!("Choose a protocol for {kind}: {}", names.join(", ")),
            ));
        }
    };

    if selector.default_changed() {
        if let Some(descriptor) = registry.descriptor(id) {
            config.default_protocol = Some(descriptor.name.clone());
            let saved = match config_path {
                Some(path) => config.save_to(path),
                None => config.save(),
            };
            match saved {
                Ok(()) => tracing::info!(protocol = %descriptor.name, "Saved as default protocol"),
                Err(e) => tracing::warn!("Could not save default protocol: {}", e),
            }
        }
    }
    Ok(id)
}

async fn open_link(link: &LinkArgs) -> anyhow::Result<TcpChannel> {
    let tcp = TcpConfig::new(&link.host, link.port).timeout(link.timeout);
    let channel = if link.listen {
        tracing::info!(port = link.port, "Waiting for peer");
        TcpChannel::accept(&tcp).await
    } else {
        TcpChannel::connect(&tcp).await
    };
    let channel = channel.with_context(|| format!("{}:{}", link.host, link.port))?;
    tracing::info!(peer = channel.peer(), "Connected");
    Ok(channel)
}

fn progress_printer(quiet: bool) -> (mpsc::Sender<TransferProgress>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<TransferProgress>(64);
    let handle = tokio::spawn(async move {
        let mut shown = false;
        while let Some(p) = rx.recv().await {
            if quiet {
                continue;
            }
            shown = true;
            match (p.percent(), p.eta_secs) {
                (Some(pct), Some(eta)) => eprint!(
                    "\r{:<20} {:>6.1}% {:>10} bytes  {} left  {} err ",
                    p.file_name,
                    pct,
                    p.bytes,
                    format_secs(eta),
                    p.retries
                ),
                _ => eprint!("\r{:<20} {:>10} bytes  {} err ", p.file_name, p.bytes, p.retries),
            }
        }
        if shown {
            eprintln!();
        }
    });
    (tx, handle)
}

async fn send(
    cli: &Cli,
    mut config: XferConfig,
    link: &LinkArgs,
    files: &[PathBuf],
    cancel: CancelFlag,
) -> anyhow::Result<CliResult> {
    if let Some(missing) = files.iter().find(|f| !f.is_file()) {
        return Ok(CliResult::file_not_found(&missing.display().to_string()));
    }

    let delegate = delegate_for(&config);
    let registry = delegate.registry();
    let kind = if files.len() > 1 {
        TransferKind::DownloadBatch
    } else {
        TransferKind::Download
    };
    let protocol = match choose_protocol(&mut config, cli.config.as_deref(), &registry, kind, link.protocol.as_deref()) {
        Ok(id) => id,
        Err(result) => return Ok(result),
    };

    let work_dir = config.work_dir();
    let mut store = LocalFileStore::new(&work_dir, work_dir.join("staging"));
    let policy = policy_for(&config.policy);
    let speed = link.speed.unwrap_or(config.transfer.link_speed);
    let mut queue = BatchQueue::new(config.batch, speed);

    let mut entries = Vec::new();
    for file in files {
        entries.push(store.register(file, DirectoryId::Area(1))?);
    }

    let mut channel = open_link(link).await?;
    let (tx, printer) = progress_printer(cli.quiet || cli.format == OutputFormat::Json);
    let mut ctx = TransferContext::new(&mut channel, &policy, &mut store, &mut queue)
        .with_tuning(config.transfer.to_tuning())
        .with_cancel(cancel)
        .with_progress(tx)
        .with_delegate(&delegate);

    let result = if kind.is_batch() {
        let mut rejected = 0;
        for entry in entries {
            let name = entry.display_name();
            if let Err(e) = ctx.queue.add(entry, ctx.policy) {
                tracing::warn!(file = %name, "Not queued: {}", e);
                rejected += 1;
            }
        }
        let summary = dispatch::download_batch(&mut ctx, protocol).await;
        drop(ctx);
        let _ = printer.await;
        match summary {
            Ok(summary) => batch_result(cli, &summary, rejected),
            Err(e) => CliResult::from(&e),
        }
    } else {
        let outcome = dispatch::send_file(&mut ctx, protocol, &entries[0]).await;
        drop(ctx);
        let _ = printer.await;
        match outcome {
            Ok(outcome) => single_result(cli, &outcome),
            Err(e) => CliResult::from(&e),
        }
    };
    Ok(result)
}

async fn receive(
    cli: &Cli,
    mut config: XferConfig,
    link: &LinkArgs,
    output: &Path,
    name: Option<&str>,
    cancel: CancelFlag,
) -> anyhow::Result<CliResult> {
    std::fs::create_dir_all(output).with_context(|| output.display().to_string())?;

    let delegate = delegate_for(&config);
    let registry = delegate.registry();
    let kind = if name.is_some() {
        TransferKind::Upload
    } else {
        TransferKind::UploadBatch
    };
    let protocol = match choose_protocol(&mut config, cli.config.as_deref(), &registry, kind, link.protocol.as_deref()) {
        Ok(id) => id,
        Err(result) => return Ok(result),
    };

    let staging = config
        .paths
        .staging_dir
        .clone()
        .unwrap_or_else(|| output.join(".staging"));
    let mut store = LocalFileStore::new(output, staging);
    let policy = policy_for(&config.policy);
    let speed = link.speed.unwrap_or(config.transfer.link_speed);
    let mut queue = BatchQueue::new(config.batch, speed);

    let mut channel = open_link(link).await?;
    let (tx, printer) = progress_printer(cli.quiet || cli.format == OutputFormat::Json);
    let mut ctx = TransferContext::new(&mut channel, &policy, &mut store, &mut queue)
        .with_tuning(config.transfer.to_tuning())
        .with_cancel(cancel)
        .with_progress(tx)
        .with_delegate(&delegate);

    let result = match name {
        Some(name) => {
            let entry = BatchEntry::new(name, DirectoryId::Area(1), 0, Direction::Upload);
            let outcome = dispatch::receive_file(&mut ctx, protocol, &entry).await;
            drop(ctx);
            let _ = printer.await;
            match outcome {
                Ok(outcome) => single_result(cli, &outcome),
                Err(e) => CliResult::from(&e),
            }
        }
        None => {
            let summary = dispatch::upload_batch(&mut ctx, protocol).await;
            drop(ctx);
            let _ = printer.await;
            match summary {
                Ok(summary) => batch_result(cli, &summary, 0),
                Err(e) => CliResult::from(&e),
            }
        }
    };
    Ok(result)
}

fn single_result(cli: &Cli, outcome: &SingleOutcome) -> CliResult {
    let (bytes, errors, failure) = match outcome {
        SingleOutcome::Queued => (0, 0, None),
        SingleOutcome::Sent(report) => (report.bytes, report.total_errors, report.error().map(CliResult::from)),
        SingleOutcome::Received(report) => (
            report.bytes,
            report.total_errors,
            report.error().map(CliResult::from).or_else(|| {
                report
                    .files
                    .is_empty()
                    .then(|| CliResult::error(ExitCodes::TRANSFER_FAILED, "No file received"))
            }),
        ),
        SingleOutcome::External(ExternalOutcome::Sent) => (0, 0, None),
        SingleOutcome::External(ExternalOutcome::Failed { code }) => (
            0,
            0,
            Some(CliResult::error(
                ExitCodes::EXTERNAL_FAILED,
                format!("External protocol exited with {code}"),
            )),
        ),
    };

    if cli.format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "bytes": bytes, "errors": errors, "ok": failure.is_none() })
        );
    }
    failure.unwrap_or_else(|| CliResult::success_with_message(format!("{bytes} bytes, {errors} errors")))
}

fn batch_result(cli: &Cli, summary: &BatchSummary, rejected: usize) -> CliResult {
    let names = |entries: &[BatchEntry]| -> Vec<String> { entries.iter().map(BatchEntry::display_name).collect() };

    if cli.format == OutputFormat::Json {
        let skipped: Vec<serde_json::Value> = summary
            .skipped
            .iter()
            .map(|(e, why)| serde_json::json!({ "file": e.display_name(), "reason": why.to_string() }))
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "completed": names(&summary.completed),
                "failed": names(&summary.failed),
                "unexpected": names(&summary.unexpected),
                "skipped": skipped,
                "rejected": rejected,
                "stopped_by": summary.stopped_by.as_ref().map(ToString::to_string),
                "bytes": summary.bytes,
                "errors": summary.total_errors,
                "error": summary.error.as_ref().map(ToString::to_string),
            })
        );
    }

    if let Some(e) = &summary.error {
        return CliResult::from(e);
    }
    if let Some(ExternalOutcome::Failed { code }) = summary.external {
        return CliResult::error(ExitCodes::EXTERNAL_FAILED, format!("External protocol exited with {code}"));
    }
    let moved = summary.completed.len() + summary.unexpected.len();
    if !summary.is_clean() || rejected > 0 {
        return CliResult::error(
            ExitCodes::PARTIAL_BATCH,
            format!(
                "{moved} file(s) transferred, {} not",
                summary.failed.len() + summary.skipped.len() + rejected
            ),
        );
    }
    CliResult::success_with_message(format!("{moved} file(s), {} bytes", summary.bytes))
}

fn list_protocols(cli: &Cli, config: &XferConfig, kind: TransferKind) -> anyhow::Result<CliResult> {
    let registry = ProtocolRegistry::new(config.zmodem.as_ref(), &config.external);
    let listing = registry.listing(kind);

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
        OutputFormat::Text => {
            println!("Protocols for {kind}:");
            for choice in &listing {
                let internal = registry
                    .descriptor(choice.id)
                    .map_or("", |d| if d.internal { "" } else { " (external)" });
                println!("  [{}] {}{}", choice.key, choice.name, internal);
            }
            println!("  [Q] Quit");
            println!("  [?] Help");
        }
    }
    Ok(CliResult::success())
}

fn estimate(cli: &Cli, config: &XferConfig, speed: Option<u32>, files: &[PathBuf]) -> anyhow::Result<CliResult> {
    let speed = speed.unwrap_or(config.transfer.link_speed);
    let mut store = LocalFileStore::new(config.work_dir(), config.work_dir().join("staging"));
    let mut queue = BatchQueue::new(config.batch, speed);
    let policy = policy_for(&config.policy);

    let mut rows = Vec::new();
    for file in files {
        let entry = match store.register(file, DirectoryId::Area(1)) {
            Ok(entry) => entry,
            Err(_) => return Ok(CliResult::file_not_found(&file.display().to_string())),
        };
        let secs = queue.entry_time(&entry);
        let verdict = queue.add(entry.clone(), &policy).err();
        rows.push((entry, secs, verdict));
    }
    let total = queue.aggregate_time(Direction::Download);

    match cli.format {
        OutputFormat::Json => {
            let files: Vec<serde_json::Value> = rows
                .iter()
                .map(|(e, secs, verdict)| {
                    serde_json::json!({
                        "file": e.display_name(),
                        "bytes": e.length(),
                        "seconds": secs,
                        "rejected": verdict.as_ref().map(ToString::to_string),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "speed": speed,
                    "files": files,
                    "total_seconds": total,
                }))?
            );
        }
        OutputFormat::Text => {
            println!("At {speed} bps:");
            for (entry, secs, verdict) in &rows {
                let note = verdict.as_ref().map(|v| format!("  ({v})")).unwrap_or_default();
                println!(
                    "  {:<12} {:>10} bytes  {:>9}{}",
                    entry.display_name(),
                    entry.length(),
                    format_secs(*secs),
                    note
                );
            }
            println!("  {:<12} {:>10} bytes  {:>9}", "Total", queue.total_bytes(Direction::Download), format_secs(total));
        }
    }
    Ok(CliResult::success())
}

fn format_secs(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
