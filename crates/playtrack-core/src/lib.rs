pub mod config;
pub mod errors;
pub mod events;
pub mod ids;

pub use config::Settings;
pub use errors::FeedError;
pub use events::{PlaybackEvent, SessionDims};
