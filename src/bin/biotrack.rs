//! Binary entry point for the biotrack administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use biotrack::{
    allocator::PatternContext,
    cli::admin::{open_tracker, seed_demo, OpenOptions, SeedSummary},
    cli::import_export::{
        run_export, run_import, CliError, ExportConfig, ExportSummary, ImportConfig,
        ImportSummary,
    },
    config::EngineConfig,
    model::{BarcodeSequence, SequenceCategory},
    telemetry,
    types::User,
};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "biotrack",
    version,
    about = "Administrative CLI for biotrack sample databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Engine config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (repeatable)"
    )]
    verbose: u8,

    #[arg(
        long,
        global = true,
        env = "BIOTRACK_USER",
        default_value = "admin",
        help = "User recorded in audit stamps"
    )]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct NextIdCmd {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(value_name = "PATTERN", help = "Pattern such as 'AB' or '{StudyId}-####'")]
    pattern: String,

    #[arg(long, value_enum, default_value_t = CategoryArg::Sample)]
    category: CategoryArg,

    #[arg(long, default_value_t = 1, help = "Number of identifiers to reserve")]
    count: usize,

    #[arg(long, value_name = "CODE", help = "Study code substituted for {StudyId}")]
    study: Option<String>,
}

#[derive(Args, Debug)]
struct ImportCmd {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(long, value_name = "FILE", help = "CSV file containing biosamples")]
    samples: PathBuf,

    #[arg(long, default_value = ",", help = "Field delimiter")]
    delimiter: char,
}

#[derive(Args, Debug)]
struct ExportCmd {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(long, value_name = "FILE", help = "Output CSV for biosamples")]
    samples: PathBuf,

    #[arg(long, default_value = ",", help = "Field delimiter")]
    delimiter: char,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty database")]
    Init {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
    #[command(about = "Populate a demo study, biotypes, locations and samples")]
    SeedDemo {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, help = "Create the database if it does not exist")]
        create: bool,
    },
    #[command(about = "Reserve identifiers from a sequence")]
    NextId(NextIdCmd),
    #[command(about = "List stored sequence counters")]
    Sequences {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
    #[command(about = "Import biosamples from a CSV file")]
    Import(ImportCmd),
    #[command(about = "Export biosamples to a CSV file")]
    Export(ExportCmd),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CategoryArg {
    Sample,
    Container,
    Location,
}

impl From<CategoryArg> for SequenceCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Sample => SequenceCategory::Sample,
            CategoryArg::Container => SequenceCategory::Container,
            CategoryArg::Location => SequenceCategory::Location,
        }
    }
}

#[derive(Serialize)]
struct InitReport {
    path: PathBuf,
}

#[derive(Serialize)]
struct NextIdReport {
    category: SequenceCategory,
    pattern: String,
    ids: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    let config = EngineConfig::load(cli.config.clone()).map_err(CliError::from)?;
    let user = User {
        admin: true,
        ..User::new(cli.user.clone())
    };
    let open = |create_if_missing: bool| OpenOptions {
        create_if_missing,
        config: config.clone(),
    };

    match cli.command {
        Command::Init { db_path } => {
            open_tracker(&db_path, &open(true))?;
            let report = InitReport { path: db_path };
            emit(&cli.format, &report, || {
                println!("Initialized {}", report.path.display())
            })?;
        }
        Command::SeedDemo { db_path, create } => {
            let tracker = open_tracker(&db_path, &open(create))?;
            let summary = seed_demo(&tracker, &user)?;
            emit(&cli.format, &summary, || print_seed_text(&db_path, &summary))?;
        }
        Command::NextId(cmd) => {
            if cmd.count == 0 {
                return Err(Box::new(CliError::from("--count must be at least 1")));
            }
            let tracker = open_tracker(&cmd.db_path, &open(false))?;
            let mut ctx = PatternContext::today();
            if let Some(study) = &cmd.study {
                ctx = ctx.with_study(study.clone());
            }
            let category = SequenceCategory::from(cmd.category);
            let ids = tracker
                .allocator()
                .next_ids(category, &cmd.pattern, &ctx, cmd.count)?;
            let report = NextIdReport {
                category,
                pattern: tracker.allocator().format_pattern(&cmd.pattern, &ctx),
                ids,
            };
            emit(&cli.format, &report, || {
                for id in &report.ids {
                    println!("{id}");
                }
            })?;
        }
        Command::Sequences { db_path } => {
            let tracker = open_tracker(&db_path, &open(false))?;
            let sequences = tracker.sequences()?;
            emit(&cli.format, &sequences, || print_sequences_text(&sequences))?;
        }
        Command::Import(cmd) => {
            let tracker = open_tracker(&cmd.db_path, &open(false))?;
            let import_cfg = ImportConfig {
                path: cmd.samples.clone(),
                delimiter: delimiter_byte(cmd.delimiter)?,
            };
            let summary = run_import(&tracker, &user, &import_cfg)?;
            emit(&cli.format, &summary, || print_import_text(&summary))?;
        }
        Command::Export(cmd) => {
            let tracker = open_tracker(&cmd.db_path, &open(false))?;
            let export_cfg = ExportConfig {
                path: cmd.samples.clone(),
                delimiter: delimiter_byte(cmd.delimiter)?,
            };
            let summary = run_export(&tracker, &export_cfg)?;
            emit(&cli.format, &summary, || print_export_text(&cmd.samples, &summary))?;
        }
    }
    Ok(())
}

fn delimiter_byte(delimiter: char) -> Result<u8, CliError> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        Err(CliError::Message(format!(
            "delimiter '{delimiter}' must be a single ASCII character"
        )))
    }
}

fn print_seed_text(db_path: &std::path::Path, summary: &SeedSummary) {
    println!(
        "Demo data inserted into {} ({} biotypes, {} locations, {} biosamples)",
        db_path.display(),
        summary.biotypes,
        summary.locations,
        summary.biosamples
    );
    for id in &summary.sample_ids {
        println!("  {id}");
    }
}

fn print_sequences_text(sequences: &[BarcodeSequence]) {
    if sequences.is_empty() {
        println!("No sequences issued yet");
        return;
    }
    let width = sequences
        .iter()
        .map(|s| s.pattern.len())
        .max()
        .unwrap_or(0);
    for seq in sequences {
        println!(
            "{:<10} {:<width$} {}",
            seq.category.name(),
            seq.pattern,
            seq.last_barcode
        );
    }
}

fn print_import_text(summary: &ImportSummary) {
    println!(
        "Imported {} new and {} updated biosamples ({} descendants updated)",
        summary.inserted, summary.updated, summary.propagated
    );
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
}

fn print_export_text(path: &std::path::Path, summary: &ExportSummary) {
    println!("Exported {} biosamples to {}", summary.exported, path.display());
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
