//! objunpack - extract zip/tar objects and publish manifests

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use objunpack::archive::{ArchiveKind, EntryReader};
use objunpack::destination::sanitize_entry_name;
use objunpack::engine::ErrorIsolation;
use objunpack::manifest::ManifestMode;
use objunpack::pipeline::ProgressCallback;
use objunpack::publish::{Dispatcher, JsonLinesTransport};
use objunpack::store::{match_objects, LocalStore, ObjectStore, ObjectUri};
use objunpack::writer::{ImageConversion, ImageTarget};
use objunpack::{BatchRunner, CancelToken, ExtractConfig, ExtractionReport};

#[derive(Parser)]
#[command(name = "objunpack")]
#[command(version)]
#[command(about = "Extract zip/tar objects from an object store and publish extraction manifests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every archive matching the input pattern
    Extract {
        /// JSON config file (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Source glob, e.g. gs://bucket/in/**/*.zip
        #[arg(short, long)]
        input: Option<String>,

        /// Output directory, e.g. gs://bucket/out
        #[arg(short, long)]
        output: Option<String>,

        /// Local directory holding one subdirectory per bucket
        #[arg(long, default_value = ".")]
        store_root: PathBuf,

        /// Append published messages to this JSON-lines file (default: stdout)
        #[arg(long)]
        messages: Option<PathBuf>,

        #[arg(long)]
        output_topic: Option<String>,

        #[arg(long)]
        error_topic: Option<String>,

        /// Manifest shape: simple, bucketed or images
        #[arg(long)]
        manifest: Option<ManifestMode>,

        /// On entry failure: continue or abort
        #[arg(long)]
        isolation: Option<ErrorIsolation>,

        /// Write a transcoded sibling for .tif entries (png or jpeg)
        #[arg(long)]
        convert: Option<ImageTarget>,

        /// Copy buffer size in bytes
        #[arg(long, env = "UNPACK_BUFFER_SIZE")]
        buffer_size: Option<usize>,

        /// Public URL prefix for image keys
        #[arg(long)]
        public_base_url: Option<String>,

        /// Seconds to wait for the publisher to drain on shutdown
        #[arg(long)]
        drain_timeout: Option<u64>,

        /// Publish an error record for non-archive sources
        #[arg(long)]
        report_unsupported: bool,

        /// Keep keys written before an abort in the manifest
        #[arg(long)]
        keep_partial: bool,

        /// Only extract entries with this extension (repeatable)
        #[arg(long = "only-ext")]
        only_extensions: Vec<String>,

        /// Worker threads (defaults to CPU thread count)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// List the objects a pattern matches
    Match {
        pattern: String,

        #[arg(long, default_value = ".")]
        store_root: PathBuf,
    },

    /// List the entries of one archive without extracting
    Inspect {
        source: String,

        #[arg(long, default_value = ".")]
        store_root: PathBuf,
    },
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let directive = if cli.verbose { "objunpack=debug" } else { "objunpack=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let (writer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(guard)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    match cli.command {
        Commands::Extract {
            config,
            input,
            output,
            store_root,
            messages,
            output_topic,
            error_topic,
            manifest,
            isolation,
            convert,
            buffer_size,
            public_base_url,
            drain_timeout,
            report_unsupported,
            keep_partial,
            only_extensions,
            threads,
        } => {
            let mut cfg = match &config {
                Some(path) => ExtractConfig::load(path)?,
                None => ExtractConfig::default(),
            };

            if let Some(v) = input {
                cfg.input_pattern = v;
            }
            if let Some(v) = output {
                cfg.output_dir = v;
            }
            if let Some(v) = output_topic {
                cfg.output_topic = v;
            }
            if let Some(v) = error_topic {
                cfg.error_topic = v;
            }
            if let Some(v) = manifest {
                cfg.manifest_mode = v;
            }
            if let Some(v) = isolation {
                cfg.isolation = v;
            }
            if let Some(v) = convert {
                cfg.image_conversion = Some(ImageConversion::new(v));
            }
            if let Some(v) = buffer_size {
                cfg.buffer_size = v;
            }
            if let Some(v) = public_base_url {
                cfg.public_base_url = v;
            }
            if let Some(v) = drain_timeout {
                cfg.drain_timeout_secs = v;
            }
            if let Some(v) = threads {
                cfg.threads = v;
            }
            cfg.report_unsupported |= report_unsupported;
            cfg.keep_partial_on_abort |= keep_partial;
            if !only_extensions.is_empty() {
                cfg.only_extensions = only_extensions;
            }
            cfg.validate().context("Invalid configuration")?;

            run_extract(&cfg, &store_root, messages.as_deref())?;
        }

        Commands::Match { pattern, store_root } => {
            let store = LocalStore::new(store_root);
            let matched = match_objects(&store, &pattern)?;
            for uri in &matched {
                println!("{:<12} {}", ArchiveKind::from_name(uri.key()), uri);
            }
            eprintln!("\nTotal: {} objects", matched.len());
        }

        Commands::Inspect { source, store_root } => {
            let store = LocalStore::new(store_root);
            inspect(&store, &ObjectUri::parse(&source)?)?;
        }
    }

    Ok(())
}

fn run_extract(cfg: &ExtractConfig, store_root: &Path, messages: Option<&Path>) -> Result<()> {
    let store = LocalStore::new(store_root);
    let dispatcher = match messages {
        Some(path) => Dispatcher::spawn(
            JsonLinesTransport::append_to(path)
                .with_context(|| format!("Failed to open message file {}", path.display()))?,
        )?,
        None => Dispatcher::spawn(JsonLinesTransport::stdout())?,
    };

    let runner = BatchRunner::from_config(cfg)?;
    let sources = runner.plan(&store, &cfg.input_pattern)?;

    let pb = ProgressBar::new(sources.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} sources | {msg}")?
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let progress_pb = pb.clone();
    let progress: ProgressCallback = Arc::new(move |report: &ExtractionReport| {
        progress_pb.set_message(report.source.file_name().to_string());
        progress_pb.inc(1);
    });
    let runner = runner.with_progress(progress);

    let cancel = CancelToken::new();
    let stats = runner.run(&store, &sources, &dispatcher.publisher(), &cancel)?;
    pb.finish_with_message("done");

    let drain = dispatcher.shutdown(cfg.drain_timeout());

    eprintln!("\n=== Extraction Summary ===");
    eprintln!(
        "Sources:  {} matched, {} processed, {} unsupported, {} aborted",
        stats.matched, stats.processed, stats.unsupported, stats.aborted
    );
    eprintln!(
        "Entries:  {} written, {} failed, {} derived",
        stats.entries_written, stats.entry_failures, stats.derived_artifacts
    );
    eprintln!(
        "Messages: {} delivered, {} failed, {} pending",
        drain.delivered,
        drain.failed + stats.publish_failures,
        drain.pending
    );
    if !drain.drained {
        eprintln!("\nPublisher did not drain within {}s.", cfg.drain_timeout_secs);
    }
    Ok(())
}

fn inspect(store: &dyn ObjectStore, source: &ObjectUri) -> Result<()> {
    let kind = ArchiveKind::from_name(source.key());
    if !kind.is_supported() {
        println!("{} is not a zip or tar object", source);
        return Ok(());
    }

    let stream = store.open(source)?;
    let reader = EntryReader::new(kind, stream, source.to_string())?;
    let count = reader
        .for_each_entry(|mut entry| {
            let size = match io::copy(&mut entry, &mut io::sink()) {
                Ok(n) => n.to_string(),
                Err(e) => format!("unreadable ({})", e),
            };
            let verdict = match sanitize_entry_name(entry.name()) {
                Ok(_) => "",
                Err(_) => "  (unsafe name, would be rejected)",
            };
            println!("{:>12}  {}{}", size, entry.name(), verdict);
            ControlFlow::Continue(())
        })
        .with_context(|| format!("Failed to read entries of {}", source))?;
    eprintln!("\nTotal: {} entries ({})", count, kind);
    Ok(())
}
