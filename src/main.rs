//! Restack CLI - Command-line interface for the restack library
//!
//! Usage:
//!   restack-cli optimize <project_dir> -o <output_dir> [options]
//!   restack-cli optimize <project_dir> --max-height 0.10 --strip-aa
//!   restack-cli check <project_dir> [options]
//!   restack-cli info <project_dir>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use restack::config::{ExposureSetType, StackConfig};
use restack::project::Project;
use restack::stack::{CancelToken, StackBuilder};
use std::fs;
use std::path::PathBuf;

/// A dynamic layer-height optimizer for resin slicer projects
#[derive(Parser, Debug)]
#[command(name = "restack-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge runs of near-identical thin layers into thicker ones
    Optimize {
        /// Input project directory (manifest.json + layer buffers)
        #[arg(value_name = "PROJECT")]
        project: PathBuf,

        /// Output project directory (default: <PROJECT>-stacked)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Run configuration file (JSON) - flags below override its values
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Minimum merged layer height in mm
        #[arg(long, default_value = "0.03")]
        min_height: f64,

        /// Maximum merged layer height in mm
        #[arg(long, default_value = "0.10")]
        max_height: f64,

        /// Erosion attempts allowed per window extension
        #[arg(long, default_value = "10")]
        max_erodes: usize,

        /// Frame cache memory budget in megabytes
        #[arg(long, default_value = "256")]
        cache_mb: usize,

        /// Binarize buffers and discard grayscale before merging
        #[arg(long)]
        strip_aa: bool,

        /// Re-blur merged buffers after stripping
        #[arg(long)]
        reconstruct_aa: bool,

        /// Exposure strategy (linear, multiplier, manual)
        #[arg(long, default_value = "linear")]
        exposure_set: String,

        /// Grow bottom exposure per height level
        #[arg(long)]
        iterate_bottom: bool,

        /// Bottom exposure step per height level (s)
        #[arg(long, default_value = "0.5")]
        bottom_step: f64,

        /// Normal exposure step per height level (s)
        #[arg(long, default_value = "0.2")]
        exposure_step: f64,

        /// First layer index to optimize (inclusive)
        #[arg(long)]
        start: Option<usize>,

        /// Last layer index to optimize (inclusive)
        #[arg(long)]
        end: Option<usize>,

        /// Number of worker threads for pixel kernels (0 = all cores)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Validate a project against a run configuration without optimizing
    Check {
        /// Input project directory
        #[arg(value_name = "PROJECT")]
        project: PathBuf,

        /// Run configuration file (JSON)
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print project statistics
    Info {
        /// Input project directory
        #[arg(value_name = "PROJECT")]
        project: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(level).init();

    match cli.command {
        Commands::Optimize {
            project,
            output,
            config,
            min_height,
            max_height,
            max_erodes,
            cache_mb,
            strip_aa,
            reconstruct_aa,
            exposure_set,
            iterate_bottom,
            bottom_step,
            exposure_step,
            start,
            end,
            threads,
        } => {
            // A config file takes the place of the individual flags.
            let stack_config = match config {
                Some(path) => load_config(Some(&path))?,
                None => {
                    let mut built = StackConfig::default()
                        .minimum_layer_height(min_height)
                        .maximum_layer_height(max_height)
                        .maximum_erodes(max_erodes)
                        .cache_ram_budget(cache_mb * 1024 * 1024)
                        .strip_antialiasing(strip_aa)
                        .reconstruct_antialiasing(reconstruct_aa)
                        .exposure_set_type(parse_exposure_set(&exposure_set)?)
                        .iterate_bottom_exposure_time(iterate_bottom)
                        .exposure_steps(bottom_step, exposure_step);
                    built.layer_index_start = start;
                    built.layer_index_end = end;
                    built
                }
            };
            run_optimize(project, output, stack_config, threads)
        }
        Commands::Check { project, config } => run_check(project, config),
        Commands::Info { project } => run_info(project),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<StackConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        }
        None => Ok(StackConfig::default()),
    }
}

fn parse_exposure_set(name: &str) -> Result<ExposureSetType> {
    match name.to_lowercase().as_str() {
        "linear" => Ok(ExposureSetType::Linear),
        "multiplier" => Ok(ExposureSetType::Multiplier),
        "manual" => Ok(ExposureSetType::Manual),
        other => bail!("Unknown exposure strategy: {other}"),
    }
}

fn run_optimize(
    input: PathBuf,
    output: Option<PathBuf>,
    config: StackConfig,
    threads: usize,
) -> Result<()> {
    // Set thread count if specified
    if threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to initialize thread pool")?;
    }

    let output_path = output.unwrap_or_else(|| {
        let name = input
            .file_name()
            .map(|n| format!("{}-stacked", n.to_string_lossy()))
            .unwrap_or_else(|| "stacked".into());
        input.with_file_name(name)
    });

    info!("Loading project: {}", input.display());
    let mut store = Project::load(&input).context("Failed to load project")?;
    info!("  Layers: {}", store.layer_count());
    info!(
        "  Resolution: {}x{}",
        store.resolution().0,
        store.resolution().1
    );
    info!("  Base layer height: {} mm", store.layer_height());

    let progress = ProgressBar::new(100);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    progress.set_message("Stacking layers...");

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let builder = StackBuilder::new(config).with_cancel_token(cancel);
    let bar = progress.clone();
    let report = builder
        .run(&mut store, move |p| {
            bar.set_position((p * 100.0) as u64);
        })
        .context("Optimization failed")?;
    progress.finish_with_message("done");

    Project::save(&output_path, &store).context("Failed to save optimized project")?;
    info!("Saved optimized project to {}", output_path.display());

    println!("{report}");
    Ok(())
}

fn run_check(input: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let store = Project::load(&input).context("Failed to load project")?;
    let config = load_config(config_path.as_deref())?;

    if let Err(e) = config.check_preconditions(&store) {
        bail!("{e}");
    }
    let errors = config.validate(&store);
    if errors.is_empty() {
        println!("OK: the project can be optimized with this configuration");
        Ok(())
    } else {
        for error in &errors {
            eprintln!("error: {error}");
        }
        bail!("{} configuration problem(s) found", errors.len());
    }
}

fn run_info(input: PathBuf) -> Result<()> {
    let store = Project::load(&input).context("Failed to load project")?;
    let (width, height) = store.resolution();

    println!("Project: {}", input.display());
    println!("  Layers:             {}", store.layer_count());
    println!("  Resolution:         {width}x{height}");
    println!("  Base layer height:  {} mm", store.layer_height());
    println!("  Bottom layers:      {}", store.bottom_layer_count());
    println!(
        "  Bottom exposure:    {} s",
        store.settings().bottom_exposure_time
    );
    println!("  Normal exposure:    {} s", store.settings().exposure_time);
    println!("  Total print time:   {:.0} s", store.print_time());
    if let Some(last) = store.layers().last() {
        println!("  Model height:       {:.3} mm", last.position_z);
    }
    Ok(())
}
