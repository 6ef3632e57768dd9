//! Canonical index, aliases and entity rows.
//!
//! Rich types are stored one typed column per declared attribute plus an
//! `extra` JSON column; thin types share the generic `entities` table with a
//! single `attributes` JSON column.

use super::schema::ENVELOPE_COLUMNS;
use super::{corrupt, is_unique_violation, Db};
use crate::catalog::{AttrKind, TypeSchema};
use crate::error::StoreError;
use crate::id::{EntityId, Scope, WorldId};
use crate::model::Entity;
use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde_json::{Map, Number, Value};

/// Columns an update never touches.
const IMMUTABLE_COLUMNS: &[&str] = &["id", "tenant_id", "world_id", "entity_type", "created_at"];

/// Tables that carry a `world_id` column, besides the entity tables.
const OWNED_BASE_TABLES: &[&str] = &[
    "entity_index",
    "entity_aliases",
    "cross_references",
    "relationships",
    "review_queue",
    "entities",
];

/// One row of the canonical name index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: EntityId,
    pub entity_type: String,
    pub normalized_name: String,
    pub display_name: String,
}

fn index_entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        normalized_name: row.get(2)?,
        display_name: row.get(3)?,
    })
}

impl Db<'_> {
    /// Canonical id registered under an exact normalized name.
    pub fn find_canonical(
        &self,
        scope: &Scope,
        entity_type: &str,
        normalized: &str,
    ) -> Result<Option<EntityId>, StoreError> {
        Ok(self
            .conn
            .prepare_cached(
                "SELECT id FROM entity_index
                 WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3 AND normalized_name = ?4",
            )?
            .query_row(
                params![scope.tenant(), scope.world(), entity_type, normalized],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Canonical id an alias is bound to.
    pub fn find_alias(
        &self,
        scope: &Scope,
        entity_type: &str,
        normalized: &str,
    ) -> Result<Option<EntityId>, StoreError> {
        Ok(self
            .conn
            .prepare_cached(
                "SELECT entity_id FROM entity_aliases
                 WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3 AND alias = ?4",
            )?
            .query_row(
                params![scope.tenant(), scope.world(), entity_type, normalized],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Claim a canonical key for `candidate`.
    ///
    /// Returns the id that owns the key afterwards; it equals `candidate`
    /// only if this call created the entry.
    pub fn reserve(
        &self,
        scope: &Scope,
        entity_type: &str,
        normalized: &str,
        display_name: &str,
        candidate: EntityId,
    ) -> Result<EntityId, StoreError> {
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO entity_index
                 (id, tenant_id, world_id, entity_type, normalized_name, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?
            .execute(params![
                candidate,
                scope.tenant(),
                scope.world(),
                entity_type,
                normalized,
                display_name,
                Utc::now()
            ])?;
        self.find_canonical(scope, entity_type, normalized)?
            .ok_or_else(|| corrupt("entity_index", format!("key {normalized:?} vanished after insert")))
    }

    /// Bind an alias to an entity unless it is already taken.
    ///
    /// Returns the entity the alias belongs to afterwards.
    pub fn insert_alias(
        &self,
        scope: &Scope,
        entity_type: &str,
        alias: &str,
        entity_id: EntityId,
    ) -> Result<EntityId, StoreError> {
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO entity_aliases
                 (tenant_id, world_id, entity_type, alias, entity_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                scope.tenant(),
                scope.world(),
                entity_type,
                alias,
                entity_id,
                Utc::now()
            ])?;
        self.find_alias(scope, entity_type, alias)?
            .ok_or_else(|| corrupt("entity_aliases", format!("alias {alias:?} vanished after insert")))
    }

    /// Normalized aliases of an entity, sorted.
    pub fn aliases(&self, scope: &Scope, entity_id: EntityId) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT alias FROM entity_aliases
             WHERE tenant_id = ?1 AND world_id = ?2 AND entity_id = ?3 ORDER BY alias",
        )?;
        let rows = stmt.query_map(params![scope.tenant(), scope.world(), entity_id], |row| {
            row.get(0)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every canonical name registered for a type.
    pub fn index_entries(
        &self,
        scope: &Scope,
        entity_type: &str,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, entity_type, normalized_name, display_name FROM entity_index
             WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant(), scope.world(), entity_type],
            index_entry_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Index entry of a canonical id within the scope.
    pub fn index_entry(
        &self,
        scope: &Scope,
        id: EntityId,
    ) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self
            .conn
            .prepare_cached(
                "SELECT id, entity_type, normalized_name, display_name FROM entity_index
                 WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3",
            )?
            .query_row(params![scope.tenant(), scope.world(), id], index_entry_from_row)
            .optional()?)
    }

    /// Load an entity row of a known type.
    pub fn load_entity(
        &self,
        scope: &Scope,
        entity_type: &str,
        id: EntityId,
    ) -> Result<Option<Entity>, StoreError> {
        let schema = self.catalog.schema(entity_type)?;
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3 AND id = ?4",
            select_columns(schema),
            schema.table_name()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![scope.tenant(), scope.world(), entity_type, id])?;
        match rows.next()? {
            Some(row) => Ok(Some(entity_from_row(schema, row)?)),
            None => Ok(None),
        }
    }

    /// Whether a row of `entity_type` is stored under `id`.
    ///
    /// A registry entry alone does not count: ids are reserved before their
    /// row is written and stay reserved if that write rolls back.
    pub fn entity_exists(
        &self,
        scope: &Scope,
        entity_type: &str,
        id: EntityId,
    ) -> Result<bool, StoreError> {
        let schema = self.catalog.schema(entity_type)?;
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3 AND id = ?4",
            schema.table_name()
        );
        Ok(self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![scope.tenant(), scope.world(), entity_type, id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Load an entity by id alone.
    pub fn get_entity(&self, scope: &Scope, id: EntityId) -> Result<Option<Entity>, StoreError> {
        match self.index_entry(scope, id)? {
            Some(entry) => self.load_entity(scope, &entry.entity_type, id),
            None => Ok(None),
        }
    }

    /// All stored entities of a type, ordered by name.
    pub fn entities(&self, scope: &Scope, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        let schema = self.catalog.schema(entity_type)?;
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE tenant_id = ?1 AND world_id = ?2 AND entity_type = ?3
             ORDER BY name, id",
            select_columns(schema),
            schema.table_name()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![scope.tenant(), scope.world(), entity_type])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(entity_from_row(schema, row)?);
        }
        Ok(entities)
    }

    /// Insert a new entity row.
    ///
    /// Returns `false` if a row with this id already exists, which means a
    /// concurrent writer got there first.
    pub fn insert_entity(&self, entity: &Entity) -> Result<bool, StoreError> {
        let schema = self.catalog.schema(&entity.entity_type)?;
        let columns = row_values(schema, entity)?;
        let names: Vec<String> = columns.iter().map(|(c, _)| quote(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            schema.table_name(),
            names.join(", "),
            placeholders.join(", ")
        );
        let result = self
            .conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(columns.into_iter().map(|(_, v)| v)));
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite an entity row if it is still at `expected_version`.
    ///
    /// Returns `false` on a version mismatch.
    pub fn update_entity(&self, entity: &Entity, expected_version: i64) -> Result<bool, StoreError> {
        let schema = self.catalog.schema(&entity.entity_type)?;
        let columns: Vec<(String, SqlValue)> = row_values(schema, entity)?
            .into_iter()
            .filter(|(c, _)| !IMMUTABLE_COLUMNS.contains(&c.as_str()))
            .collect();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", quote(c), i + 1))
            .collect();
        let n = columns.len();
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = ?{} AND tenant_id = ?{} AND world_id = ?{} AND version = ?{}",
            schema.table_name(),
            assignments.join(", "),
            n + 1,
            n + 2,
            n + 3,
            n + 4
        );
        let mut values: Vec<SqlValue> = columns.into_iter().map(|(_, v)| v).collect();
        values.push(SqlValue::Text(entity.id.to_string()));
        values.push(SqlValue::Text(entity.tenant_id.to_string()));
        values.push(SqlValue::Text(entity.world_id.to_string()));
        values.push(SqlValue::Integer(expected_version));
        let updated = self
            .conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(values))?;
        Ok(updated == 1)
    }

    /// Rows in any owned table that still reference a world.
    ///
    /// Deliberately unscoped by tenant; used to audit world deletion.
    pub fn owned_rows(&self, world: WorldId) -> Result<u64, StoreError> {
        let mut tables: Vec<String> = OWNED_BASE_TABLES.iter().map(|t| t.to_string()).collect();
        tables.extend(
            self.catalog
                .bespoke_types()
                .map(|s| s.table_name().to_string()),
        );
        let mut total = 0u64;
        for table in tables {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{table}\" WHERE world_id = ?1"),
                params![world],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }
}

fn quote(column: &str) -> String {
    format!("\"{column}\"")
}

fn select_columns(schema: &TypeSchema) -> String {
    let mut columns: Vec<String> = ENVELOPE_COLUMNS.iter().map(|c| quote(c)).collect();
    if schema.is_bespoke() {
        columns.extend(schema.attributes.iter().map(|a| quote(&a.name)));
        columns.push(quote("extra"));
    } else {
        columns.push(quote("attributes"));
    }
    columns.join(", ")
}

fn timestamp(at: &DateTime<Utc>) -> SqlValue {
    SqlValue::Text(at.to_rfc3339())
}

/// Column/value pairs for every column of an entity row.
fn row_values(schema: &TypeSchema, entity: &Entity) -> Result<Vec<(String, SqlValue)>, StoreError> {
    let mut columns: Vec<(String, SqlValue)> = vec![
        ("id".into(), SqlValue::Text(entity.id.to_string())),
        ("tenant_id".into(), SqlValue::Text(entity.tenant_id.to_string())),
        ("world_id".into(), SqlValue::Text(entity.world_id.to_string())),
        ("entity_type".into(), SqlValue::Text(entity.entity_type.clone())),
        ("name".into(), SqlValue::Text(entity.name.clone())),
        (
            "description".into(),
            entity
                .description
                .clone()
                .map_or(SqlValue::Null, SqlValue::Text),
        ),
        ("created_at".into(), timestamp(&entity.created_at)),
        ("updated_at".into(), timestamp(&entity.updated_at)),
        ("source_at".into(), timestamp(&entity.source_at)),
        ("version".into(), SqlValue::Integer(entity.version)),
    ];

    if schema.is_bespoke() {
        let mut extra = Map::new();
        for attribute in &schema.attributes {
            let value = entity.attributes.get(&attribute.name);
            columns.push((attribute.name.clone(), to_column(attribute.kind, value)?));
        }
        for (key, value) in &entity.attributes {
            if schema.attribute(key).is_none() {
                extra.insert(key.clone(), value.clone());
            }
        }
        columns.push((
            "extra".into(),
            SqlValue::Text(serde_json::to_string(&Value::Object(extra))?),
        ));
    } else {
        columns.push((
            "attributes".into(),
            SqlValue::Text(serde_json::to_string(&entity.attributes)?),
        ));
    }
    Ok(columns)
}

fn to_column(kind: AttrKind, value: Option<&Value>) -> Result<SqlValue, StoreError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(SqlValue::Null),
        Some(v) => v,
    };
    Ok(match (kind, value) {
        (AttrKind::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (AttrKind::Boolean, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (AttrKind::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Integer(n.as_f64().unwrap_or_default() as i64),
        },
        (AttrKind::Number, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or_default()),
        // Lists, objects and anything of an unexpected shape keep their JSON.
        (_, other) => SqlValue::Text(serde_json::to_string(other)?),
    })
}

fn from_column(table: &str, kind: AttrKind, value: ValueRef<'_>) -> Result<Option<Value>, StoreError> {
    Ok(match (kind, value) {
        (_, ValueRef::Null) => None,
        (AttrKind::Boolean, ValueRef::Integer(i)) => Some(Value::Bool(i != 0)),
        (AttrKind::List | AttrKind::Object, ValueRef::Text(text)) => {
            Some(serde_json::from_slice(text)?)
        }
        (_, ValueRef::Integer(i)) => Some(Value::from(i)),
        (_, ValueRef::Real(f)) => Some(
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| corrupt(table, format!("non-finite number {f}")))?,
        ),
        (AttrKind::Text, ValueRef::Text(text)) => Some(Value::String(
            std::str::from_utf8(text)
                .map_err(|e| corrupt(table, e))?
                .to_string(),
        )),
        // Text in a numeric column was written as JSON by `to_column`.
        (_, ValueRef::Text(text)) => Some(serde_json::from_slice(text)?),
        (_, ValueRef::Blob(_)) => return Err(corrupt(table, "unexpected blob value")),
    })
}

fn entity_from_row(schema: &TypeSchema, row: &Row<'_>) -> Result<Entity, StoreError> {
    let table = schema.table_name();
    let mut attributes = Map::new();
    let mut index = ENVELOPE_COLUMNS.len();

    let json_column = if schema.is_bespoke() {
        for attribute in &schema.attributes {
            if let Some(value) = from_column(table, attribute.kind, row.get_ref(index)?)? {
                attributes.insert(attribute.name.clone(), value);
            }
            index += 1;
        }
        "extra"
    } else {
        "attributes"
    };

    let raw: String = row.get(index)?;
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => attributes.extend(map),
        other => return Err(corrupt(table, format!("{json_column} is not an object: {other}"))),
    }

    Ok(Entity {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        world_id: row.get(2)?,
        entity_type: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        source_at: row.get(8)?,
        version: row.get(9)?,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::DatabaseConfig;
    use crate::id::TenantId;
    use crate::model::NewWorld;
    use crate::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Store, Scope) {
        let store = Store::open(
            &DatabaseConfig::default(),
            Arc::new(Catalog::builtin().unwrap()),
        )
        .unwrap();
        let tenant = TenantId::new("acme").unwrap();
        let world = store
            .write(|db| db.insert_world(&tenant, &NewWorld::new("Aerth")))
            .unwrap();
        let scope = Scope::new("acme", world.id).unwrap();
        (store, scope)
    }

    fn entity(scope: &Scope, id: EntityId, entity_type: &str, attributes: Value) -> Entity {
        let now = Utc::now();
        Entity {
            id,
            tenant_id: scope.tenant().clone(),
            world_id: scope.world(),
            entity_type: entity_type.to_string(),
            name: "Kira".to_string(),
            description: Some("A wandering blade".to_string()),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            created_at: now,
            updated_at: now,
            source_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_reserve_is_first_wins() {
        let (store, scope) = setup();
        let first = EntityId::new();
        let second = EntityId::new();
        store
            .write(|db| {
                assert_eq!(db.reserve(&scope, "character", "kira", "Kira", first)?, first);
                assert_eq!(db.reserve(&scope, "character", "kira", "kira", second)?, first);
                // Same name, different type: separate key.
                assert_eq!(db.reserve(&scope, "location", "kira", "Kira", second)?, second);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_alias_owner_is_stable() {
        let (store, scope) = setup();
        let kira = EntityId::new();
        let other = EntityId::new();
        store
            .write(|db| {
                db.reserve(&scope, "character", "kira", "Kira", kira)?;
                db.reserve(&scope, "character", "mara", "Mara", other)?;
                assert_eq!(db.insert_alias(&scope, "character", "the blade", kira)?, kira);
                assert_eq!(db.insert_alias(&scope, "character", "the blade", other)?, kira);
                assert_eq!(db.aliases(&scope, kira)?, vec!["the blade".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_bespoke_row_roundtrip_keeps_extra() {
        let (store, scope) = setup();
        let id = EntityId::new();
        let stored = entity(
            &scope,
            id,
            "character",
            json!({
                "power_level": 7,
                "personality_traits": ["brave"],
                "favourite_food": "plums"
            }),
        );
        store
            .write(|db| {
                db.reserve(&scope, "character", "kira", "Kira", id)?;
                assert!(db.insert_entity(&stored)?);
                assert!(!db.insert_entity(&stored)?);
                Ok(())
            })
            .unwrap();

        let loaded = store.read(|db| db.get_entity(&scope, id)).unwrap().unwrap();
        assert_eq!(loaded.attributes, stored.attributes);
        assert_eq!(loaded.source_at, stored.source_at);
        assert_eq!(loaded.description.as_deref(), Some("A wandering blade"));
    }

    #[test]
    fn test_thin_row_roundtrip() {
        let (store, scope) = setup();
        let id = EntityId::new();
        let stored = entity(&scope, id, "trade_route", json!({ "hazards": ["bandits"] }));
        store
            .write(|db| {
                db.reserve(&scope, "trade_route", "kira", "Kira", id)?;
                db.insert_entity(&stored)
            })
            .unwrap();
        let all = store.read(|db| db.entities(&scope, "trade_route")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].attributes, stored.attributes);
    }

    #[test]
    fn test_reserved_id_is_not_a_stored_entity() {
        let (store, scope) = setup();
        let id = EntityId::new();
        let exists = |entity_type: &str| {
            store
                .read(|db| db.entity_exists(&scope, entity_type, id))
                .unwrap()
        };
        store
            .write(|db| db.reserve(&scope, "location", "eldoria village", "Eldoria Village", id))
            .unwrap();
        assert!(!exists("location"));

        store
            .write(|db| db.insert_entity(&entity(&scope, id, "location", json!({}))))
            .unwrap();
        assert!(exists("location"));
        assert!(!exists("character"));
    }

    #[test]
    fn test_update_is_version_guarded() {
        let (store, scope) = setup();
        let id = EntityId::new();
        let mut stored = entity(&scope, id, "character", json!({ "strength": 5 }));
        store
            .write(|db| {
                db.reserve(&scope, "character", "kira", "Kira", id)?;
                db.insert_entity(&stored)
            })
            .unwrap();

        stored.attributes.insert("strength".into(), json!(9));
        stored.version = 2;
        assert!(store.write(|db| db.update_entity(&stored, 1)).unwrap());
        // A second writer still holding version 1 loses.
        assert!(!store.write(|db| db.update_entity(&stored, 1)).unwrap());

        let loaded = store.read(|db| db.get_entity(&scope, id)).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.attribute("strength"), Some(&json!(9)));
    }
}
