//! DDL generated from the catalog.
//!
//! This is the single source of table definitions: the base tables, the
//! generic `entities` table for thin types, and one table per bespoke type.

use crate::catalog::{AttrKind, Catalog, TypeSchema};

/// Bumped whenever the generated DDL changes shape.
pub const SCHEMA_VERSION: i64 = 1;

/// Columns shared by every entity table, in insert order.
pub(crate) const ENVELOPE_COLUMNS: &[&str] = &[
    "id",
    "tenant_id",
    "world_id",
    "entity_type",
    "name",
    "description",
    "created_at",
    "updated_at",
    "source_at",
    "version",
];

const BASE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS worlds (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    genre TEXT,
    power_level INTEGER CHECK (power_level IS NULL OR power_level BETWEEN 1 AND 10),
    created_at TEXT NOT NULL,
    UNIQUE (tenant_id, name)
);

CREATE TABLE IF NOT EXISTS entity_index (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    world_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (tenant_id, world_id, entity_type, normalized_name),
    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS entity_aliases (
    tenant_id TEXT NOT NULL,
    world_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    alias TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, world_id, entity_type, alias),
    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE,
    FOREIGN KEY(entity_id) REFERENCES entity_index(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS entity_aliases_entity ON entity_aliases(entity_id);

CREATE TABLE IF NOT EXISTS cross_references (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    world_id TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_skill TEXT,
    target_hint TEXT NOT NULL,
    hint_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'resolved', 'unresolvable')),
    resolved_target_id TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (tenant_id, world_id, source_type, source_id, target_type, hint_key),
    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE,
    FOREIGN KEY(source_id) REFERENCES entity_index(id) ON DELETE CASCADE,
    FOREIGN KEY(resolved_target_id) REFERENCES entity_index(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS cross_references_pending
    ON cross_references(tenant_id, world_id, target_type, status);

CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    world_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    cross_reference_id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE,
    FOREIGN KEY(source_id) REFERENCES entity_index(id) ON DELETE CASCADE,
    FOREIGN KEY(target_id) REFERENCES entity_index(id) ON DELETE CASCADE,
    FOREIGN KEY(cross_reference_id) REFERENCES cross_references(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS relationships_scope ON relationships(tenant_id, world_id);

CREATE TABLE IF NOT EXISTS review_queue (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    world_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    field TEXT NOT NULL,
    current_value TEXT NOT NULL,
    proposed_value TEXT NOT NULL,
    reason TEXT NOT NULL,
    skill TEXT,
    status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'resolved')),
    decision TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE,
    FOREIGN KEY(entity_id) REFERENCES entity_index(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS review_queue_entity ON review_queue(entity_id, field, status);
"#;

/// Every statement needed to create the store, in dependency order.
pub fn ddl(catalog: &Catalog) -> Vec<String> {
    let mut statements = vec![BASE_TABLES.trim().to_string(), generic_table()];
    statements.extend(catalog.bespoke_types().map(bespoke_table));
    statements
}

fn envelope_columns() -> String {
    [
        "    id TEXT PRIMARY KEY,",
        "    tenant_id TEXT NOT NULL,",
        "    world_id TEXT NOT NULL,",
        "    entity_type TEXT NOT NULL,",
        "    name TEXT NOT NULL,",
        "    description TEXT,",
        "    created_at TEXT NOT NULL,",
        "    updated_at TEXT NOT NULL,",
        "    source_at TEXT NOT NULL,",
        "    version INTEGER NOT NULL DEFAULT 1,",
    ]
    .join("\n")
}

fn ownership_constraints() -> &'static str {
    "    FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE,\n    \
     FOREIGN KEY(id) REFERENCES entity_index(id) ON DELETE CASCADE"
}

fn generic_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS entities (\n{}\n    attributes TEXT NOT NULL DEFAULT '{{}}',\n{}\n);\n\
         CREATE INDEX IF NOT EXISTS entities_scope ON entities(tenant_id, world_id, entity_type);",
        envelope_columns(),
        ownership_constraints()
    )
}

fn bespoke_table(schema: &TypeSchema) -> String {
    let table = schema.table_name();
    let mut columns = Vec::new();
    for attribute in &schema.attributes {
        let check = match attribute.kind {
            AttrKind::Boolean => format!(" CHECK (\"{}\" IN (0, 1))", attribute.name),
            _ => String::new(),
        };
        columns.push(format!(
            "    \"{}\" {}{},",
            attribute.name,
            attribute.kind.column_type(),
            check
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (\n{}\n{}\n    extra TEXT NOT NULL DEFAULT '{{}}',\n{}\n);\n\
         CREATE INDEX IF NOT EXISTS \"{table}_scope\" ON \"{table}\"(tenant_id, world_id);",
        envelope_columns(),
        columns.join("\n"),
        ownership_constraints()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_ddl_executes() {
        let catalog = Catalog::builtin().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&ddl(&catalog).join("\n")).unwrap();
        // Running twice is harmless.
        conn.execute_batch(&ddl(&catalog).join("\n")).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'characters'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_bespoke_table_has_typed_columns() {
        let catalog = Catalog::builtin().unwrap();
        let statements = ddl(&catalog);
        let characters = statements
            .iter()
            .find(|s| s.contains("\"characters\""))
            .unwrap();
        assert!(characters.contains("\"power_level\" INTEGER"));
        assert!(characters.contains("\"backstory\" TEXT"));
        assert!(characters.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn test_every_owned_table_cascades_from_worlds() {
        let catalog = Catalog::builtin().unwrap();
        let all = ddl(&catalog).join("\n");
        let tables = all.matches("CREATE TABLE").count();
        // worlds itself is the only table without the cascade.
        let cascading = all
            .matches("FOREIGN KEY(world_id) REFERENCES worlds(id) ON DELETE CASCADE")
            .count();
        assert_eq!(cascading, tables - 1);
    }
}
