//! Tenant-scoped SQLite persistence.
//!
//! [`Store`] owns the connection; all data access goes through [`Db`], a
//! borrowed view handed out by [`Store::read`] (plain statements) or
//! [`Store::write`] (one transaction, committed only if the closure
//! succeeds). Every `Db` method takes a [`Scope`] and filters on both
//! `tenant_id` and `world_id`.

mod entities;
mod refs;
mod review;
pub mod schema;
mod worlds;

use crate::catalog::Catalog;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::id::Scope;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to the relational store.
pub struct Store {
    conn: Mutex<Connection>,
    catalog: Arc<Catalog>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("types", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store and apply the catalog's DDL.
    pub fn open(config: &DatabaseConfig, catalog: Arc<Catalog>) -> Result<Self, StoreError> {
        let conn = match &config.path {
            Some(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        if config.path.is_some() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
            debug!(journal_mode = %mode, "opened database file");
        }

        let statements = schema::ddl(&catalog);
        conn.execute_batch(&statements.join("\n"))?;
        conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
        info!(
            tables = statements.len(),
            path = ?config.path,
            "store ready"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            catalog,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Run statements outside an explicit transaction.
    pub fn read<R>(&self, f: impl FnOnce(&Db<'_>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let conn = self.conn.lock();
        let db = Db {
            conn: &conn,
            catalog: &self.catalog,
        };
        f(&db)
    }

    /// Run `f` inside one transaction; any error rolls everything back.
    pub fn write<R>(&self, f: impl FnOnce(&Db<'_>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = {
            let db = Db {
                conn: &tx,
                catalog: &self.catalog,
            };
            f(&db)?
        };
        tx.commit()?;
        Ok(result)
    }
}

/// Borrowed data-access view over a connection or transaction.
pub struct Db<'c> {
    conn: &'c Connection,
    catalog: &'c Catalog,
}

impl Db<'_> {
    pub fn catalog(&self) -> &Catalog {
        self.catalog
    }

    /// Fail unless the scope's world exists and belongs to its tenant.
    pub fn check_scope(&self, scope: &Scope) -> Result<(), StoreError> {
        if self.world(scope)?.is_some() {
            Ok(())
        } else {
            Err(crate::error::IntegrityError::UnknownWorld {
                tenant: scope.tenant().to_string(),
                world: scope.world(),
            }
            .into())
        }
    }
}

/// Whether an error is a UNIQUE or PRIMARY KEY violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

fn corrupt(table: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorld;

    #[test]
    fn test_write_rolls_back_on_error() {
        let store = Store::open(
            &DatabaseConfig::default(),
            Arc::new(Catalog::builtin().unwrap()),
        )
        .unwrap();
        let tenant = crate::id::TenantId::new("acme").unwrap();

        let result: Result<(), StoreError> = store.write(|db| {
            db.insert_world(&tenant, &NewWorld::new("Aerth"))?;
            Err(corrupt("worlds", "forced failure"))
        });
        assert!(result.is_err());

        let worlds = store.read(|db| db.worlds(&tenant)).unwrap();
        assert!(worlds.is_empty());
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let store = Store::open(
            &DatabaseConfig::default(),
            Arc::new(Catalog::builtin().unwrap()),
        )
        .unwrap();
        let enabled: bool = store
            .read(|db| Ok(db.conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .unwrap();
        assert!(enabled);
    }
}
