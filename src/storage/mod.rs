pub mod models;
pub mod schema;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::DatabaseErrorKind;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use models::{Machine, NewMachine, NewReport, Report};
use tracing::warn;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),
}

/// SQLite-backed store for machines and their inspection reports.
///
/// All Diesel work runs on the blocking pool; connections come from an r2d2
/// pool and are configured with WAL journaling and a busy timeout so that
/// concurrent requests are isolated by SQLite's own transaction handling.
#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                run_migrations(&mut conn)
            })
            .await??;
        }

        Ok(Store { pool })
    }

    /// All machines, sorted by name.
    ///
    /// On a database error this re-applies pending migrations once and
    /// retries, so a store whose schema went missing recovers in-place
    /// instead of failing every listing.
    pub async fn list_machines(&self) -> Result<Vec<Machine>, StorageError> {
        use schema::machines::dsl::*;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Machine>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            match machines.order(name.asc()).load::<Machine>(&mut conn) {
                Ok(rows) => Ok(rows),
                Err(e) => {
                    warn!(error=%e, "machine listing failed; re-applying schema and retrying");
                    run_migrations(&mut conn)?;
                    Ok(machines.order(name.asc()).load::<Machine>(&mut conn)?)
                }
            }
        })
        .await?
    }

    /// Insert a machine. Returns `false` when the name is already taken.
    pub async fn add_machine(&self, machine_name: &str) -> Result<bool, StorageError> {
        use schema::machines;
        let pool = self.pool.clone();
        let name_owned = machine_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new_machine = NewMachine { name: &name_owned };
            match diesel::insert_into(machines::table)
                .values(&new_machine)
                .execute(&mut conn)
            {
                Ok(_) => Ok(true),
                Err(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::UniqueViolation,
                    _,
                )) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    /// Delete a machine and all of its reports in one transaction.
    ///
    /// The two-step contract is explicit: reports go first, then the machine
    /// row. Returns whether the machine existed.
    pub async fn delete_machine(&self, machine_name: &str) -> Result<bool, StorageError> {
        use schema::{machines, reports};
        let pool = self.pool.clone();
        let name_owned = machine_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let mut existed = false;
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                diesel::delete(reports::table.filter(reports::machine_name.eq(&name_owned)))
                    .execute(conn)?;
                let deleted =
                    diesel::delete(machines::table.filter(machines::name.eq(&name_owned)))
                        .execute(conn)?;
                existed = deleted > 0;
                Ok(())
            })?;
            Ok(existed)
        })
        .await?
    }

    /// Reports for one machine, newest first (date desc, time desc).
    pub async fn list_reports_for_machine(
        &self,
        machine: &str,
    ) -> Result<Vec<Report>, StorageError> {
        use schema::reports::dsl as r;
        let pool = self.pool.clone();
        let machine_owned = machine.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Report>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(r::reports
                .filter(r::machine_name.eq(&machine_owned))
                .order((r::report_date.desc(), r::report_time.desc()))
                .load::<Report>(&mut conn)?)
        })
        .await?
    }

    /// All reports, ordered for export: machine asc, then (date, time) asc.
    pub async fn list_all_reports(&self) -> Result<Vec<Report>, StorageError> {
        use schema::reports::dsl as r;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Report>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(r::reports
                .order((
                    r::machine_name.asc(),
                    r::report_date.asc(),
                    r::report_time.asc(),
                ))
                .load::<Report>(&mut conn)?)
        })
        .await?
    }

    /// Reports whose date falls within `[start, end]` (inclusive bounds),
    /// same shape and order as [`Store::list_all_reports`].
    pub async fn list_reports_between(
        &self,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Result<Vec<Report>, StorageError> {
        use schema::reports::dsl as r;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Report>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(r::reports
                .filter(r::report_date.ge(start))
                .filter(r::report_date.le(end))
                .order((
                    r::machine_name.asc(),
                    r::report_date.asc(),
                    r::report_time.asc(),
                ))
                .load::<Report>(&mut conn)?)
        })
        .await?
    }

    /// Insert a report and return its generated id. `created_at` is assigned
    /// by the database.
    pub async fn add_report(
        &self,
        machine: &str,
        date: chrono::NaiveDate,
        time: chrono::NaiveTime,
        description: &str,
        image: Option<&str>,
    ) -> Result<i32, StorageError> {
        use schema::reports;
        let pool = self.pool.clone();
        let machine_owned = machine.to_string();
        let description_owned = description.to_string();
        let image_owned = image.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<i32, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new_report = NewReport {
                machine_name: &machine_owned,
                report_date: date,
                report_time: time,
                description: &description_owned,
                image: image_owned.as_deref(),
            };
            Ok(diesel::insert_into(reports::table)
                .values(&new_report)
                .returning(reports::id)
                .get_result::<i32>(&mut conn)?)
        })
        .await?
    }
}

fn run_migrations(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(())
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    Ok(())
}
