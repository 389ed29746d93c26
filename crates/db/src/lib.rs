pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod reporting;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use fixtures::{DemoSeedDataset, SeedResult, VerificationResult};
pub use reporting::{QueryRows, RelationalStore, ReportingError, ResultRow, SqliteRelationalStore};
