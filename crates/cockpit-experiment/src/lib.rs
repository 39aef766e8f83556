//! Experiment orchestration for the cockpit engine.
//!
//! - [`params`]: what to acquire and runtime knobs
//! - [`planner`]: camera exposure insertion and readiness bookkeeping
//! - [`strategies`]: table generation for Z stacks, sweeps and structured illumination
//! - [`execute`]: the repetition loop that hands table slices to executors
//! - [`titles`]: provenance lines for the output file header
//! - [`experiment`]: run lifecycle tying it all together
//!
//! # Example
//!
//! ```rust,ignore
//! use cockpit_experiment::{Experiment, ExperimentParams, strategies::ZStack};
//!
//! let mut experiment = Experiment::new(params, Box::new(ZStack));
//! let outcome = experiment.run(&ctx).await?;
//! println!("wrote {:?}", outcome.files);
//! ```

pub mod execute;
pub mod experiment;
pub mod params;
pub mod planner;
pub mod strategies;
pub mod titles;

pub use execute::{ExecutionSummary, Scheduler};
pub use experiment::{Experiment, ExperimentOutcome, ExperimentState, PlannedTable};
pub use params::{ExecutionSettings, ExperimentParams, ExposureSetting, LightExposure};
pub use planner::ExposurePlanner;
pub use strategies::{
    ActionGenerator, CollectionOrder, RepBlock, SampleRate, StructuredIllumination,
    StutteredZStack, SweptShutter, ZStack,
};
pub use titles::generate_titles;
