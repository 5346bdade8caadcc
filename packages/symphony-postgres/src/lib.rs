//! PostgreSQL persistence drivers for the symphony message bus.
//!
//! [`PostgresMessageStore`] and [`PostgresScheduleStore`] implement the core
//! store traits over `sqlx`. Leasing uses a CTE with `FOR UPDATE SKIP
//! LOCKED`, so concurrent workers never observe the same row as leasable.
//!
//! Run [`MIGRATOR`] against the pool before first use:
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! symphony_postgres::MIGRATOR.run(&pool).await?;
//!
//! let messenger = Messenger::builder()
//!     .message_store(Arc::new(PostgresMessageStore::new(pool.clone())))
//!     .schedule_store(Arc::new(PostgresScheduleStore::new(pool)))
//!     .build()?;
//! ```

mod messages;
mod schedules;

pub use messages::PostgresMessageStore;
pub use schedules::PostgresScheduleStore;

/// Embedded migrations for the two messenger tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub(crate) fn backend_error(err: sqlx::Error) -> symphony::StoreError {
    symphony::StoreError::Backend(err.to_string())
}
