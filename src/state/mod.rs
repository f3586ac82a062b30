pub mod backend;
pub mod lock;
pub mod migration;
pub mod models;
pub mod query;
pub mod schema;
pub mod sqlite;

pub use backend::StateBackend;
pub use lock::ReleaseTargetMutex;
pub use sqlite::SqliteBackend;
