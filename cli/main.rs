#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use fitscreen::config::ScreeningConfig;
use fitscreen::data::{load_item_declarations, load_wide_matrix, write_person_outcomes_to_path};
use fitscreen::pipeline::{self, fit_reference};
use fitscreen::progress::ConsoleLoocvProgress;
use fitscreen::vectorize::{ItemDeclaration, vectorize};

#[derive(Args)]
pub struct InputArgs {
    /// Tab-separated response matrix with person_id, age, reference, [eligible] and item columns
    #[arg(value_name = "MATRIX_TSV")]
    pub matrix: PathBuf,

    /// Optional item declarations with item_id, type and [categories] columns
    #[arg(long, value_name = "PATH")]
    pub items: Option<PathBuf>,

    /// TOML run configuration; defaults are used for anything it does not set
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Minimum number of answered items for a person to be scored
    #[arg(long, value_name = "N")]
    pub min_responses: Option<usize>,
}

#[derive(Args)]
pub struct ScreenArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Output table with one row per person
    #[arg(long, short, value_name = "PATH", default_value = "screening.tsv")]
    pub output: PathBuf,

    /// Directory holding the cached run and its LOOCV checkpoint
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Discard any cached run and rerun every LOOCV fold
    #[arg(long)]
    pub rebuild: bool,

    /// Number of LOOCV worker threads (default: half of the logical cores)
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Run at most this many folds now; the rest are resumed on the next invocation
    #[arg(long, value_name = "N")]
    pub max_folds: Option<usize>,

    /// Stop scheduling folds after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub budget_secs: Option<f64>,
}

#[derive(Args)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Where the fitted parameter set is written
    #[arg(long, short, value_name = "PATH", default_value = "parameters.toml")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "fitscreen",
    about = "Person-fit screening of survey respondents",
    long_about = "Fits an ordinal mixed model to a known-genuine reference population, builds a \
                 leave-one-out null distribution of person-fit statistics, and scores \
                 out-of-sample respondents against it."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the complete screening pipeline
    #[command(about = "Screen respondents (outputs: screening.tsv)")]
    Screen(ScreenArgs),

    /// Fit the model to the reference population only
    #[command(about = "Fit the reference model (outputs: parameters.toml)")]
    Fit(FitArgs),

    /// Print the default configuration as TOML
    #[command(about = "Print the default configuration")]
    DefaultConfig,

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn load_config(input: &InputArgs) -> Result<ScreeningConfig, Box<dyn Error>> {
    let mut config = match &input.config {
        Some(path) => ScreeningConfig::load(path)?,
        None => ScreeningConfig::default(),
    };
    if let Some(n) = input.min_responses {
        config.vectorize.min_responses = n;
    }
    Ok(config)
}

fn load_declarations(path: Option<&Path>) -> Result<Vec<ItemDeclaration>, Box<dyn Error>> {
    match path {
        Some(path) => Ok(load_item_declarations(path)?),
        None => Ok(Vec::new()),
    }
}

fn run_screen(args: ScreenArgs) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(&args.input)?;
    if let Some(dir) = args.cache_dir {
        config.cache.dir = dir;
    }
    config.cache.rebuild |= args.rebuild;
    if args.threads.is_some() {
        config.loocv.threads = args.threads;
    }
    if args.max_folds.is_some() {
        config.loocv.max_folds = args.max_folds;
    }
    if args.budget_secs.is_some() {
        config.loocv.wall_clock_budget_secs = args.budget_secs;
    }
    config.validate()?;

    let matrix = load_wide_matrix(&args.input.matrix)?;
    let declarations = load_declarations(args.input.items.as_deref())?;
    let mut progress = ConsoleLoocvProgress::new();
    let output = pipeline::run(&matrix, &declarations, &config, &mut progress)?;
    write_person_outcomes_to_path(&args.output, &output.outcomes)?;

    let report = &output.report;
    println!(
        "Screened {} persons: {} reference ({} folds converged, {} failed, {} skipped), {} scored, {} flagged, {} excluded.",
        output.outcomes.len(),
        report.n_reference,
        report.loocv.converged,
        report.loocv.failed,
        report.loocv.skipped,
        report.n_scored,
        report.flagged,
        report.n_excluded
    );
    println!(
        "lz cutoff {:.4} (reference lz {:.3} +/- {:.3}); results written to {}",
        report.null.lz_cutoff,
        report.null.lz_mean,
        report.null.lz_sd,
        args.output.display()
    );
    if !report.loocv.complete {
        println!("LOOCV is incomplete; rerun the same command to resume from the checkpoint.");
    }
    Ok(())
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.input)?;
    config.validate()?;
    let matrix = load_wide_matrix(&args.input.matrix)?;
    let declarations = load_declarations(args.input.items.as_deref())?;
    let set = vectorize(&matrix, &declarations, &config.vectorize)?;
    let (_, result) = fit_reference(&set, &config)?;
    result.params.save(&args.output)?;
    println!(
        "Fit {} after {} iterations; parameters written to {}",
        result.status,
        result.diagnostics.iterations,
        args.output.display()
    );
    Ok(())
}

fn print_default_config() -> Result<(), Box<dyn Error>> {
    print!("{}", toml::to_string_pretty(&ScreeningConfig::default())?);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Screen(args)) => run_screen(args),
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::DefaultConfig) => print_default_config(),
        Some(Commands::Version) => {
            println!("fitscreen {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
