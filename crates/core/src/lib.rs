pub mod config;
pub mod dataset;
pub mod error;
pub mod identity;
pub mod schedule;

pub use config::{DatasetConfig, JoinConfig, PipelineConfig, Settings};
pub use dataset::*;
pub use error::*;
pub use identity::*;
pub use schedule::Recurrence;
