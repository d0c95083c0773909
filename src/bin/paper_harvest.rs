use std::fs::File;
use std::io::{self, BufReader};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use paper_harvest::aggregate::RunSummary;
use paper_harvest::cancel::CancelToken;
use paper_harvest::config::{Config, ConfigLoader};
use paper_harvest::domain::{BackendKind, PaperRecord, read_records};
use paper_harvest::error::HarvestError;
use paper_harvest::layout::Layout;
use paper_harvest::output::{JsonOutput, LogSink, OutputMode, ProgressSink};
use paper_harvest::pipeline::Pipeline;

const EXIT_FAILURES: u8 = 4;

#[derive(Parser)]
#[command(name = "paper-harvest")]
#[command(about = "Download arXiv paper PDFs and metadata into a date-partitioned archive")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of the human summary.
    #[arg(long, global = true)]
    json: bool,

    /// Only log warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    /// Destination root (defaults to ~/papers).
    #[arg(long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch PDFs for a list of paper records")]
    Fetch(FetchArgs),
    #[command(about = "List papers already stored under the root")]
    List,
}

#[derive(Args)]
struct FetchArgs {
    /// JSON file of paper records, or `-` for stdin.
    #[arg(long, default_value = "-")]
    records: String,

    #[arg(long)]
    workers: Option<usize>,

    /// Per-attempt timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Total attempts per paper.
    #[arg(long)]
    retries: Option<u32>,

    /// Backend preference, repeatable: --backend segmented --backend direct.
    #[arg(long = "backend", value_enum)]
    backends: Vec<BackendKind>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<HarvestError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidPaperId(_)
        | HarvestError::InvalidRecord(_)
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidConfig(_)
        | HarvestError::RecordsRead(_) => 2,
        HarvestError::Filesystem(_) | HarvestError::RootNotWritable(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = Some(root);
    }

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, config, output_mode),
        Commands::List => run_list(config, output_mode),
    }
}

fn run_fetch(args: FetchArgs, mut config: Config, output_mode: OutputMode) -> miette::Result<ExitCode> {
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    if args.timeout.is_some() {
        config.attempt_timeout_secs = args.timeout;
    }
    if args.retries.is_some() {
        config.max_attempts = args.retries;
    }
    if !args.backends.is_empty() {
        config.backends = Some(args.backends);
    }
    let config = ConfigLoader::resolve_config(config)?;
    let records = load_records(&args.records)?;
    let pipeline = Pipeline::from_config(config)?;

    let cancel = CancelToken::new();
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogSink,
    };
    let summary = pipeline.run(records, &cancel, sink)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Human => print_fetch_summary(&summary),
    }

    if summary.failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURES))
    }
}

fn run_list(config: Config, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let config = ConfigLoader::resolve_config(config)?;
    let entries = Layout::new(config.root.clone()).list_entries()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_list(&entries).into_diagnostic()?,
        OutputMode::Human => {
            for entry in &entries {
                println!("{}  {}  {}", entry.published, entry.id, entry.title);
            }
            println!("{} papers under {}", entries.len(), config.root);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_records(source: &str) -> Result<Vec<PaperRecord>, HarvestError> {
    if source == "-" {
        return read_records(io::stdin().lock());
    }
    let file = File::open(source).map_err(|err| HarvestError::RecordsRead(format!("{source}: {err}")))?;
    read_records(BufReader::new(file))
}

fn print_fetch_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}paper-harvest summary{reset}");
    println!("  requested:        {}", summary.requested);
    println!(
        "{green}  verified:         {} ({} already present){reset}",
        summary.verified, summary.already_present
    );
    println!("{yellow}  retried, then ok: {}{reset}", summary.retried_success);
    if !summary.failed.is_empty() {
        println!("{red}  failed:           {}{reset}", summary.failed.len());
        for failed in &summary.failed {
            println!(
                "{red}    {} [{}] after {} attempts: {}{reset}",
                failed.id, failed.reason, failed.attempts, failed.detail
            );
        }
    }
    if !summary.cancelled.is_empty() {
        println!("{yellow}  cancelled:        {}{reset}", summary.cancelled.len());
    }
    println!("  elapsed:          {:.1}s", summary.elapsed.as_secs_f64());
}
