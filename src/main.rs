//! Command-line entry point.
//!
//! ```bash
//! # Z stack of 21 planes, written to <output_dir>/beads.dv
//! cockpit run --z-height 2 --slice-height 0.1 --exposure 50 --output beads.dv
//!
//! # Print the table of a structured illumination run without running it
//! cockpit plan --strategy si --si-order "Z, Phase, Angle"
//!
//! # Three fast volumes, then one every two seconds, for 12 volumes
//! cockpit run --strategy stuttered --reps 12 --sample-rate 0:3 --sample-rate 2000:1
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cockpit::acquisition::{AcquisitionRequest, Strategy};
use cockpit::config::{CockpitConfig, DEFAULT_CONFIG_PATH};
use cockpit::core::events::USER_ABORT;
use cockpit::core::{EventPayload, TimeMs};
use cockpit::experiment::{CollectionOrder, Experiment, SampleRate};
use cockpit::tracing_init::{self, OutputFormat, TracingConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cockpit")]
#[command(about = "Timed microscope experiments on a simulated rig", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment and save the images
    Run {
        #[command(flatten)]
        acquisition: AcquisitionArgs,

        /// File name under the storage directory; omit to run without saving
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Build the action table and print it
    Plan {
        #[command(flatten)]
        acquisition: AcquisitionArgs,
    },
}

#[derive(Args)]
struct AcquisitionArgs {
    #[arg(long, value_enum, default_value_t = Strategy::ZStack)]
    strategy: Strategy,

    #[arg(long, default_value_t = 1)]
    reps: u32,

    /// Start-to-start time between repetitions in ms; 0 runs them back to back
    #[arg(long, default_value = "0", value_parser = TimeMs::parse)]
    rep_duration: TimeMs,

    /// Bottom of the stack in µm
    #[arg(long, default_value_t = 0.0)]
    z_bottom: f64,

    /// Stack height in µm; 0 images a single plane
    #[arg(long, default_value_t = 0.0)]
    z_height: f64,

    #[arg(long, default_value_t = 0.1)]
    slice_height: f64,

    /// Light time per exposure in ms
    #[arg(long, default_value = "10", value_parser = TimeMs::parse)]
    exposure: TimeMs,

    /// Cameras to use (repeatable); all when omitted
    #[arg(long = "camera")]
    cameras: Vec<String>,

    /// Lights to use (repeatable); all when omitted
    #[arg(long = "light")]
    lights: Vec<String>,

    #[arg(long, default_value = "Z, Angle, Phase", value_parser = parse_order)]
    si_order: CollectionOrder,

    /// Handler that advances the illumination pattern
    #[arg(long)]
    pattern_trigger: Option<String>,

    /// Stuttered stack rate as INTERVAL_MS:REPS (repeatable)
    #[arg(long = "sample-rate", value_parser = parse_sample_rate)]
    sample_rates: Vec<SampleRate>,

    #[arg(long, default_value = "")]
    metadata: String,
}

fn parse_order(text: &str) -> Result<CollectionOrder, String> {
    text.parse().map_err(|e: cockpit::core::CockpitError| e.to_string())
}

fn parse_sample_rate(text: &str) -> Result<SampleRate, String> {
    let (interval, reps) = text
        .split_once(':')
        .ok_or_else(|| format!("expected INTERVAL_MS:REPS, got '{text}'"))?;
    Ok(SampleRate {
        interval: TimeMs::parse(interval.trim()).map_err(|e| e.to_string())?,
        num_reps: reps.trim().parse().map_err(|e| format!("bad repetition count: {e}"))?,
    })
}

impl AcquisitionArgs {
    fn into_request(self, output: Option<PathBuf>) -> AcquisitionRequest {
        AcquisitionRequest {
            strategy: self.strategy,
            num_reps: self.reps,
            rep_duration: self.rep_duration,
            z_bottom: self.z_bottom,
            z_height: self.z_height,
            slice_height: self.slice_height,
            exposure: self.exposure,
            cameras: self.cameras,
            lights: self.lights,
            si_order: self.si_order,
            pattern_trigger: self.pattern_trigger,
            sample_rates: self.sample_rates,
            metadata: self.metadata,
            output,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CockpitConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, "starting");

    let rig = cockpit::rig::assemble(&config.rig).await?;
    let ctx = rig.context();

    match cli.command {
        Commands::Run {
            acquisition,
            output,
        } => {
            let request = acquisition.into_request(output);
            if request.output.is_some() {
                std::fs::create_dir_all(&config.storage.output_dir).with_context(|| {
                    format!("creating {}", config.storage.output_dir.display())
                })?;
            }
            let mut experiment = Experiment::new(
                request.params(&rig, &config.storage)?,
                request.generator(&rig)?,
            )
            .with_settings(config.execution_settings());

            let bus = std::sync::Arc::clone(&rig.bus);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, aborting experiment");
                    bus.publish(USER_ABORT, EventPayload::None);
                }
            });

            let outcome = experiment.run(&ctx).await?;
            info!(
                reps = outcome.summary.reps_completed,
                aborted = outcome.summary.aborted,
                lines = outcome.table_len,
                duration = %outcome.table_duration,
                "experiment finished"
            );
            for file in &outcome.files {
                println!("{}", file.display());
            }
        }
        Commands::Plan { acquisition } => {
            let request = acquisition.into_request(None);
            let experiment = Experiment::new(
                request.params(&rig, &config.storage)?,
                request.generator(&rig)?,
            );
            let planned = experiment.plan(&ctx).await?;
            println!("{}", planned.table);
            println!(
                "{} lines, {} ms per repetition",
                planned.table.len(),
                planned.table.duration()
            );
        }
    }
    Ok(())
}
