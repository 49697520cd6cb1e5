pub mod aggregates;
pub mod database;
pub mod error;
pub mod query;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use query::QueryFacade;
