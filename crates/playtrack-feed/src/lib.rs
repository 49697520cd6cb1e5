pub mod client;
pub mod importer;
pub mod protocol;

pub use client::{FeedClient, FeedStatus, FeedStatusSnapshot, RetryConfig};
pub use importer::{HistoryImporter, ImportOutcome};
