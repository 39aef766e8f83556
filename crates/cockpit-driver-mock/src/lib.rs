//! Simulated hardware for the cockpit experiment engine.
//!
//! Provides cameras, light sources, a stage axis and an executor board that
//! behave like the real devices at the handler boundary, for tests and for
//! running the CLI without hardware.
//!
//! # Operational Modes
//!
//! - **Instant**: programs and moves complete immediately; deterministic
//! - **Realistic**: programs play out on the wall clock, moves take time
//!
//! # Error Injection
//!
//! Every device accepts an [`ErrorConfig`] to fail selected operations,
//! after N calls, or at random with a fixed seed.

pub mod common;
pub mod mock_camera;
pub mod mock_executor_backend;
pub mod mock_light;
pub mod mock_stage;
pub mod pattern;
pub mod rig;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use mock_camera::{MockCamera, MockCameraBuilder, MockCameraConfig};
pub use mock_executor_backend::{MockExecutorBackend, TriggerListener};
pub use mock_light::{MockLight, MockLightConfig};
pub use mock_stage::{MockStage, MockStageConfig};
pub use pattern::generate_test_pattern;
pub use rig::{DelegatedTriggerConfig, SimulatedRig, SimulatedRigBuilder};
