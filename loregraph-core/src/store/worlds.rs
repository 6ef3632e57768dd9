//! World rows.

use super::{is_unique_violation, Db};
use crate::error::StoreError;
use crate::id::{Scope, TenantId, WorldId};
use crate::model::{NewWorld, World};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const WORLD_COLUMNS: &str = "id, tenant_id, name, genre, power_level, created_at";

fn world_from_row(row: &Row<'_>) -> rusqlite::Result<World> {
    Ok(World {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        genre: row.get(3)?,
        power_level: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Db<'_> {
    /// Create a world; names are unique per tenant.
    pub fn insert_world(&self, tenant: &TenantId, new: &NewWorld) -> Result<World, StoreError> {
        let world = World {
            id: WorldId::new(),
            tenant_id: tenant.clone(),
            name: new.name.trim().to_string(),
            genre: new.genre.clone(),
            power_level: new.power_level,
            created_at: Utc::now(),
        };
        let result = self.conn.execute(
            &format!("INSERT INTO worlds ({WORLD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                world.id,
                world.tenant_id,
                world.name,
                world.genre,
                world.power_level,
                world.created_at
            ],
        );
        match result {
            Ok(_) => Ok(world),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateWorld {
                    tenant: tenant.to_string(),
                    name: world.name,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The scope's world, if the tenant owns it.
    pub fn world(&self, scope: &Scope) -> Result<Option<World>, StoreError> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "SELECT {WORLD_COLUMNS} FROM worlds WHERE id = ?1 AND tenant_id = ?2"
            ))?
            .query_row(params![scope.world(), scope.tenant()], world_from_row)
            .optional()?)
    }

    /// Owner of a world id, whatever the tenant.
    pub fn world_owner(&self, id: WorldId) -> Result<Option<TenantId>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT tenant_id FROM worlds WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All worlds of a tenant, by name.
    pub fn worlds(&self, tenant: &TenantId) -> Result<Vec<World>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {WORLD_COLUMNS} FROM worlds WHERE tenant_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![tenant], world_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a world; everything it owns goes with it.
    pub fn delete_world(&self, scope: &Scope) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM worlds WHERE id = ?1 AND tenant_id = ?2",
            params![scope.world(), scope.tenant()],
        )?;
        Ok(deleted > 0)
    }
}
