//! Conflict and retry discipline shared by the loader and the enricher.
//!
//! Every multi-row write is one [`UnitOfWork`]: a single transaction per
//! logical unit (one batch file, or one run's detection set). Inside it each
//! row is applied with insert-or-ignore semantics and the outcome classified:
//!
//! | Outcome | Meaning | Counted as |
//! |---------|---------|------------|
//! | [`WriteOutcome::Inserted`] | new row | `inserted` |
//! | [`WriteOutcome::AlreadyExists`] | key conflict, row already stored | `skipped` |
//! | [`WriteOutcome::Rejected`] | any other integrity violation | `errored` |
//!
//! A fatal error rolls the whole unit back and surfaces as a
//! [`PipelineError`]. There is no in-process retry: the external scheduler
//! repeats the run, and idempotent writes make the repeat safe.
//!
//! SQLite rolls back only the failing statement on a constraint error, so a
//! rejected row leaves the surrounding transaction usable. CHECK constraints
//! are evaluated before `ON CONFLICT DO NOTHING`, so writers whose key may
//! already be stored look it up with [`UnitOfWork::exists`] first.

use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqlitePool};
use sqlx::Transaction;
use tracing::{debug, error};

use crate::error::{PipelineError, PipelineResult};

/// Primary result code for `SQLITE_CONSTRAINT`; extended codes keep it in the low byte.
const SQLITE_CONSTRAINT: i32 = 19;

/// Classification of a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Unique or primary-key conflict: the row already exists.
    Duplicate,
    /// Any other integrity violation (CHECK, NOT NULL, foreign key, ...).
    Constraint,
    /// Connectivity, I/O, protocol or schema errors.
    Fatal,
}

pub fn classify(err: &sqlx::Error) -> Conflict {
    match err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation => Conflict::Duplicate,
            ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => Conflict::Constraint,
            _ if is_constraint_code(db.code().as_deref()) => Conflict::Constraint,
            _ => Conflict::Fatal,
        },
        _ => Conflict::Fatal,
    }
}

fn is_constraint_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| c & 0xff == SQLITE_CONSTRAINT)
        .unwrap_or(false)
}

/// Result of applying one row inside a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyExists,
    Rejected(String),
}

/// Execute an insert-or-ignore statement and classify the outcome.
///
/// Returns `Err` only for [`Conflict::Fatal`] errors.
pub async fn insert_or_ignore<'q>(
    conn: &mut SqliteConnection,
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
) -> Result<WriteOutcome, sqlx::Error> {
    match query.execute(&mut *conn).await {
        Ok(done) if done.rows_affected() > 0 => Ok(WriteOutcome::Inserted),
        Ok(_) => Ok(WriteOutcome::AlreadyExists),
        Err(err) => match classify(&err) {
            Conflict::Duplicate => Ok(WriteOutcome::AlreadyExists),
            Conflict::Constraint => Ok(WriteOutcome::Rejected(err.to_string())),
            Conflict::Fatal => Err(err),
        },
    }
}

/// One transaction per logical unit.
pub struct UnitOfWork {
    unit: String,
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub async fn begin(pool: &SqlitePool, unit: impl Into<String>) -> PipelineResult<Self> {
        let unit = unit.into();
        let tx = pool.begin().await.map_err(PipelineError::StoreUnavailable)?;
        debug!(unit = %unit, "unit of work started");
        Ok(Self { unit, tx })
    }

    /// Whether `query` yields a row, read inside the unit's transaction.
    pub async fn exists<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<bool, sqlx::Error> {
        Ok(query.fetch_optional(&mut *self.tx).await?.is_some())
    }

    pub async fn apply<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<WriteOutcome, sqlx::Error> {
        insert_or_ignore(&mut self.tx, query).await
    }

    pub async fn commit(self) -> PipelineResult<()> {
        let unit = self.unit;
        self.tx
            .commit()
            .await
            .map_err(|err| PipelineError::write(unit.clone(), err))?;
        debug!(unit = %unit, "unit of work committed");
        Ok(())
    }

    /// Roll the unit back in full and turn the fatal error into a
    /// [`PipelineError`].
    pub async fn abort(self, err: sqlx::Error) -> PipelineError {
        error!(unit = %self.unit, error = %err, "rolling back unit");
        if let Err(rollback_err) = self.tx.rollback().await {
            error!(unit = %self.unit, error = %rollback_err, "rollback failed");
        }
        PipelineError::write(self.unit, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_codes() {
        // SQLITE_CONSTRAINT_CHECK, _NOTNULL, _TRIGGER
        assert!(is_constraint_code(Some("275")));
        assert!(is_constraint_code(Some("1299")));
        assert!(is_constraint_code(Some("1811")));
        assert!(is_constraint_code(Some("19")));
        // SQLITE_BUSY, SQLITE_CANTOPEN
        assert!(!is_constraint_code(Some("5")));
        assert!(!is_constraint_code(Some("14")));
        assert!(!is_constraint_code(None));
        assert!(!is_constraint_code(Some("not-a-number")));
    }

    #[test]
    fn non_database_errors_are_fatal() {
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), Conflict::Fatal);
        assert_eq!(classify(&sqlx::Error::PoolClosed), Conflict::Fatal);
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify(&sqlx::Error::Io(io)), Conflict::Fatal);
    }
}
