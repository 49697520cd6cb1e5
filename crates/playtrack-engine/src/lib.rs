pub mod error;
pub mod health;
pub mod scheduler;
pub mod tracker;

pub use error::EngineError;
pub use health::HealthState;
pub use scheduler::{RetentionScheduler, SchedulerConfig};
pub use tracker::{Tracker, TrackerConfig};
