//! DV file output for the cockpit experiment engine.
//!
//! - [`dv_header`]: base header and per-plane extended header layout
//! - [`data_saver`]: queue-fed writer that places camera images into planes
//! - [`reorder`]: rewrites structured illumination stacks into reconstruction order

pub mod data_saver;
pub mod dv_header;
pub mod reorder;

pub use data_saver::{DataSaver, DataSaverBuilder, SaverCamera, SaverStats, DEFAULT_IDLE_TIMEOUT};
pub use dv_header::{DvHeader, PlaneMetadata};
pub use reorder::{reorder_stack, PackedStack, StackAxis, RECONSTRUCTION_ORDER};
