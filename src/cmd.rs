use std::collections::{HashMap, HashSet};
use std::env;
use std::error::Error as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use console::Style;
use indicatif::{
    HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::container::{self, ContainerKind};
use crate::error::Error;
use crate::extract::{
    self, ExtractObserver, ExtractOptions, PartitionOutcome, PartitionSummary, PayloadExtractor,
    SizePolicy,
};
use crate::payload::PayloadHeader;

const MAX_THREADS: usize = 256;
const PROGRESS_UPDATE_FREQUENCY: u8 = 2; // Hz

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputType {
    /// OTA zip archive containing payload.bin
    Zip,
    /// Raw payload.bin
    Bin,
    /// HTTP(S) URL of an OTA zip or payload.bin
    Url,
}

impl From<InputType> for ContainerKind {
    fn from(value: InputType) -> Self {
        match value {
            InputType::Zip => Self::Zip,
            InputType::Bin => Self::Bin,
            InputType::Url => Self::Url,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(
    about,
    author,
    disable_help_subcommand = true,
    help_template = FRIENDLY_HELP,
    propagate_version = true,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cmd {
    /// OTA file or URL: a .zip, a payload.bin or an http(s):// link to either.
    #[clap(short = 'p', long = "path", value_hint = ValueHint::AnyPath, value_name = "PATH")]
    payload: Option<String>,

    /// Input type. Detected from the URL scheme or the file contents if omitted
    #[clap(long = "type", value_enum, value_name = "TYPE")]
    input_type: Option<InputType>,

    /// List partitions instead of extracting them
    #[clap(
        conflicts_with = "threads",
        conflicts_with = "output_dir",
        conflicts_with = "partitions",
        conflicts_with = "no_verify",
        conflicts_with = "keep_partial",
        long,
        short
    )]
    list: bool,

    /// Number of decompression threads (0 = all CPU cores)
    #[clap(long, short, value_name = "NUMBER")]
    threads: Option<usize>,

    /// Output directory (default: a timestamped folder in the current directory)
    #[clap(long, short, value_hint = ValueHint::DirPath, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Dump only selected partitions (comma-separated)
    #[clap(long, value_delimiter = ',', value_name = "PARTITIONS")]
    partitions: Vec<String>,

    /// Skip SHA-256 verification of operation data and images
    #[clap(long)]
    no_verify: bool,

    /// Accept payload format versions other than 2
    #[clap(long)]
    force: bool,

    /// Size images by the furthest extent of any operation instead of the last one
    #[clap(long)]
    scan_extents: bool,

    /// Keep images of partitions that failed to extract
    #[clap(long)]
    keep_partial: bool,

    /// Increase log verbosity (-v: info, -vv: debug). RUST_LOG overrides this
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Positional argument for the payload file or URL
    #[clap(value_hint = ValueHint::AnyPath)]
    #[clap(index = 1, value_name = "PATH")]
    positional_payload: Option<String>,
}

impl Cmd {
    pub fn run(&self) -> Result<()> {
        init_logging(self.verbose);

        if let Some(t) = self.threads.filter(|&t| t > MAX_THREADS) {
            bail!(
                "Thread count must be between 1 and {MAX_THREADS}, got {t}. \
                Use 0 or omit -t to use all available CPU cores (recommended)."
            );
        }

        let input = self.input()?;
        let kind = match self.input_type {
            Some(t) => t.into(),
            None => ContainerKind::detect(input)
                .with_context(|| format!("unable to open {input}"))?,
        };
        debug!("Opening {input} as {kind:?}");

        let stream =
            container::open(kind, input).with_context(|| format!("unable to open {input}"))?;
        let extractor = PayloadExtractor::new(stream, self.extract_options())
            .context("unable to parse payload")?;

        if self.list {
            return self.list_partitions(extractor.header());
        }

        let cancel = interrupt_flag()?;
        let mut extractor = extractor.with_cancel_signal(cancel.clone());

        let header = extractor.header();
        let selected_count = if self.partitions.is_empty() {
            header.partitions().len()
        } else {
            self.partitions
                .iter()
                .filter(|name| header.partition(name).is_some())
                .collect::<HashSet<_>>()
                .len()
        };

        let (partition_dir, created_new_dir) = self.create_partition_dir()?;

        let bold_bright_red = Style::new().bold().red();
        let bold_yellow = Style::new().bold().yellow();
        let bold_bright_green = Style::new().bold().green();
        eprintln!(
            "\n{}: do {} close this window! Use {} to cancel safely.",
            bold_yellow.apply_to("Extraction in progress"),
            bold_bright_red.apply_to("NOT"),
            bold_bright_green.apply_to("Ctrl+C")
        );
        eprintln!(
            "Processing {} partitions using {} threads...",
            selected_count,
            extractor.threads()
        );
        eprintln!();

        let observer = ProgressObserver::new()?;
        let outcomes = extractor
            .extract_all(&self.partitions, &partition_dir, &observer)
            .with_context(|| format!("extraction into {} failed", partition_dir.display()))?;
        let started = observer.into_started();

        let report = Report::new(&outcomes);
        report.print();

        if !self.keep_partial {
            remove_partial_images(&outcomes, &started, &partition_dir);
        }

        if report.extracted == 0 && created_new_dir {
            let _ = fs::remove_dir_all(&partition_dir);
        }

        if cancel.load(Ordering::Acquire) {
            bail!("Extraction was cancelled");
        }
        if report.failed > 0 {
            bail!(
                "{} of {} partitions failed to extract",
                report.failed,
                report.failed + report.extracted
            );
        }
        if report.extracted == 0 {
            eprintln!("\nNo partitions were extracted.");
            return Ok(());
        }

        self.display_extracted_folder_size(&partition_dir)?;

        Ok(())
    }

    fn input(&self) -> Result<&str> {
        self.payload
            .as_deref()
            .or(self.positional_payload.as_deref())
            .ok_or_else(|| anyhow!(
                "No payload file specified. Please provide an OTA file or URL using -p/--path or as a positional argument.\n\nExamples:\n  payload-extract payload.bin\n  payload-extract -p ota.zip\n  payload-extract https://example.com/ota.zip"
            ))
    }

    fn size_policy(&self) -> SizePolicy {
        if self.scan_extents {
            SizePolicy::MaxExtent
        } else {
            SizePolicy::LastExtent
        }
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            threads: self.threads.unwrap_or(0),
            verify: !self.no_verify,
            size_policy: self.size_policy(),
            queue_depth: None,
            allow_unknown_version: self.force,
        }
    }

    fn list_partitions(&self, header: &PayloadHeader) -> Result<()> {
        let mut partitions: Vec<_> = header.partitions().iter().collect();
        partitions.sort_unstable_by(|p1, p2| p1.partition_name.cmp(&p2.partition_name));

        let dim = Style::new().dim();
        eprintln!(
            "{}",
            dim.apply_to(format!(
                "Payload v{}, minor version {}, block size {}, {} partitions",
                header.raw.file_format_version,
                header.manifest.minor_version(),
                header.block_size(),
                partitions.len(),
            ))
        );

        let bold_green = Style::new().bold().green();
        for partition in partitions {
            let size = extract::partition_size(partition, header.block_size(), self.size_policy())
                .map(|size| HumanBytes(size).to_string());
            let size = size.as_deref().unwrap_or("???");

            println!(
                "{} ({size}, {} operations)",
                bold_green.apply_to(&partition.partition_name),
                partition.operations.len(),
            );
        }

        Ok(())
    }

    fn create_partition_dir(&self) -> Result<(PathBuf, bool)> {
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => {
                let current_dir = env::current_dir().with_context(|| {
                    "Failed to determine current directory. Please specify --output-dir explicitly."
                })?;
                let folder = Utc::now().format("extracted_%Y%m%d_%H%M%S").to_string();
                current_dir.join(folder)
            }
        };
        let existed = dir.exists();
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create output directory: {dir:?}"))?;
        Ok((dir, !existed))
    }

    /// Calculate and display the total size of the extracted folder
    fn display_extracted_folder_size(&self, partition_dir: &Path) -> Result<()> {
        let mut total_size = 0u64;
        let entries = fs::read_dir(partition_dir)
            .with_context(|| format!("failed to read directory: {}", partition_dir.display()))?;

        for entry in entries {
            let metadata = entry.and_then(|e| e.metadata()).with_context(|| {
                format!("failed to read directory entry in: {}", partition_dir.display())
            })?;
            if metadata.is_file() {
                total_size += metadata.len();
            }
        }

        println!("\nExtraction completed successfully!");
        println!("Output directory: {}", partition_dir.display());
        println!("Total extracted size: {}", HumanBytes(total_size));
        Ok(())
    }
}

/// Flag raised by Ctrl+C. The handler can only be installed once per
/// process, so later runs share the first run's flag.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    static FLAG: Mutex<Option<Arc<AtomicBool>>> = Mutex::new(None);

    let mut slot = FLAG.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(flag) = slot.as_ref() {
        return Ok(flag.clone());
    }

    let flag = Arc::new(AtomicBool::new(false));
    {
        let flag = flag.clone();
        ctrlc::set_handler(move || {
            eprintln!("\n\nReceived interrupt signal (Ctrl+C). Stopping extraction...");
            flag.store(true, Ordering::Release);
        })
        .context("Failed to set up Ctrl+C handler")?;
    }
    *slot = Some(flag.clone());

    Ok(flag)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={level}", env!("CARGO_CRATE_NAME"))));

    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Delete images of partitions that started but did not finish, so they
/// are never mistaken for complete output.
fn remove_partial_images(outcomes: &[PartitionOutcome], started: &HashSet<String>, dir: &Path) {
    for outcome in outcomes {
        if outcome.result.is_ok() || !started.contains(&outcome.name) {
            continue;
        }

        let path = extract::image_path(dir, &outcome.name);
        match fs::remove_file(&path) {
            Ok(()) => eprintln!("Removed partial image {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => eprintln!("Failed to remove {}: {e}", path.display()),
        }
    }
}

/// Render an error and its sources as `outer: inner: root`.
fn error_chain(error: &Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }

    message
}

struct Report<'a> {
    outcomes: &'a [PartitionOutcome],
    extracted: usize,
    failed: usize,
}

impl<'a> Report<'a> {
    fn new(outcomes: &'a [PartitionOutcome]) -> Self {
        let mut extracted = 0;
        let mut failed = 0;

        for outcome in outcomes {
            match &outcome.result {
                Ok(_) => extracted += 1,
                Err(Error::PartitionNotFound(_)) => {}
                Err(_) => failed += 1,
            }
        }

        Self {
            outcomes,
            extracted,
            failed,
        }
    }

    fn print(&self) {
        let bold_green = Style::new().bold().green();
        let bold_yellow = Style::new().bold().yellow();
        let bold_red = Style::new().bold().red();

        eprintln!();
        for outcome in self.outcomes {
            match &outcome.result {
                Ok(summary) => eprintln!(
                    "{} {}",
                    bold_green.apply_to(&outcome.name),
                    describe_summary(summary)
                ),
                Err(Error::PartitionNotFound(_)) => eprintln!(
                    "{} not found in payload, skipped",
                    bold_yellow.apply_to(&outcome.name)
                ),
                Err(e) => eprintln!(
                    "{} failed: {}",
                    bold_red.apply_to(&outcome.name),
                    error_chain(e)
                ),
            }
        }
    }
}

fn describe_summary(summary: &PartitionSummary) -> String {
    let verified = if summary.verified { ", verified" } else { "" };
    format!(
        "{} in {:.2?} ({} operations{verified})",
        HumanBytes(summary.size),
        summary.elapsed,
        summary.operations,
    )
}

/// One progress bar per partition, advanced per completed operation.
struct ProgressObserver {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
    started: Mutex<HashSet<String>>,
}

impl ProgressObserver {
    fn new() -> Result<Self> {
        // Setting a fixed update frequency reduces flickering.
        let draw_target = ProgressDrawTarget::stderr_with_hz(PROGRESS_UPDATE_FREQUENCY);
        let style = ProgressStyle::with_template(
            "{prefix:>16!.green.bold} [{wide_bar:.white.dim}] {percent:>3.white}% {msg:.red}",
        )
        .context("unable to build progress bar template")?
        .progress_chars("=> ");

        Ok(Self {
            multi: MultiProgress::with_draw_target(draw_target),
            style,
            bars: Mutex::default(),
            started: Mutex::default(),
        })
    }

    fn into_started(self) -> HashSet<String> {
        self.started.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExtractObserver for ProgressObserver {
    fn on_partition_start(&self, name: &str, operations: usize, _size: u64) {
        let bar = ProgressBar::new(operations as u64)
            .with_finish(ProgressFinish::AndLeave)
            .with_prefix(name.to_owned())
            .with_style(self.style.clone());
        let bar = self.multi.add(bar);

        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.insert(name.to_owned(), bar);

        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.insert(name.to_owned());
    }

    fn on_operation_done(&self, name: &str) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.get(name) {
            bar.inc(1);
        }
    }

    fn on_partition_finish(&self, name: &str, result: &crate::error::Result<PartitionSummary>) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.remove(name) {
            match result {
                Ok(_) => bar.finish(),
                Err(_) => bar.abandon_with_message("failed"),
            }
        }
    }
}

// Friendlier, task-oriented help template shown for -h/--help
const FRIENDLY_HELP: &str = color_print::cstr!(
    "\
{before-help}<bold><underline>{name} {version}</underline></bold>
{about}

Quick start:
  payload-extract [ota.zip|payload.bin|https://host/ota.zip]

Common tasks:
  - List partitions only:
    payload-extract -l [ota.zip]
  - Extract everything into a timestamped folder:
    payload-extract [ota.zip]
  - Extract specific partition(s):
    payload-extract [ota.zip] --partitions boot,init_boot
  - Extract straight from a server that supports range requests:
    payload-extract https://example.com/ota.zip --partitions boot
  - Choose output directory and threads:
    payload-extract [ota.zip] -o out -t 8

Safety and integrity:
  - Verification is on by default (SHA-256).
  - Only full payloads are supported; delta (incremental) OTAs are rejected.
  - Images of failed partitions are deleted unless --keep-partial is given.

{usage-heading}
{usage}

Options:
{all-args}
{after-help}"
);
