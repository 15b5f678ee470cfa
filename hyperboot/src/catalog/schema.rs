//! Column contract between hyperboot and the externally owned schema.

use rusqlite::Connection;

use super::db_err;
use crate::errors::{ProvisionError, ProvisionResult};

/// Tables and the columns hyperboot reads or writes in each.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("flavors", &["id", "name", "vcpu", "memory"]),
    ("images", &["id", "name", "fmt", "size"]),
    ("mac_address_pool", &["id", "address", "is_free"]),
    ("instance", &["id", "domain_name", "state", "mac_addr"]),
];

/// Fail with `SchemaMismatch` when a table or column is missing.
pub(super) fn validate(conn: &Connection) -> ProvisionResult<()> {
    for (table, columns) in REQUIRED_COLUMNS {
        let present = table_columns(conn, table)?;
        if present.is_empty() {
            return Err(ProvisionError::SchemaMismatch(format!(
                "table {} is missing",
                table
            )));
        }
        if let Some(missing) = columns.iter().find(|c| !present.iter().any(|p| p == *c)) {
            return Err(ProvisionError::SchemaMismatch(format!(
                "table {} has no column {}",
                table, missing
            )));
        }
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> ProvisionResult<Vec<String>> {
    let mut stmt = db_err!(conn.prepare(&format!("PRAGMA table_info({})", table)))?;
    let names = db_err!(stmt.query_map([], |row| row.get::<_, String>(1)))?;
    db_err!(names.collect::<Result<Vec<_>, _>>())
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Catalog files shaped like the production schema.

    use std::path::{Path, PathBuf};

    use rusqlite::{Connection, params};

    pub const SCHEMA: &str = "
        CREATE TABLE flavors (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50),
            vcpu INTEGER,
            memory INTEGER
        );
        CREATE TABLE images (
            id VARCHAR(50) PRIMARY KEY,
            name VARCHAR(50),
            fmt VARCHAR(20),
            size INTEGER
        );
        CREATE TABLE mac_address_pool (
            id INTEGER PRIMARY KEY,
            address VARCHAR(50),
            is_free BOOLEAN
        );
        CREATE TABLE instance (
            id VARCHAR(50) PRIMARY KEY,
            domain_name VARCHAR(50),
            state VARCHAR(50),
            mac_addr INTEGER REFERENCES mac_address_pool(id)
        );
    ";

    pub const IMAGE_ID: &str = "522700a8a063d875c192d818";
    pub const IMAGE_NAME: &str = "ubuntu12.04server";
    pub const FIRST_ADDRESS: &str = "52:54:00:83:df:a1";

    /// Create an empty catalog with the production schema.
    pub fn create_empty(dir: &Path) -> PathBuf {
        let path = dir.join("catalog.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        path
    }

    /// Create a catalog seeded with four flavors, one image and `addresses`
    /// free addresses `52:54:00:83:df:a1`, `...:a2`, ...
    pub fn create_with_addresses(dir: &Path, addresses: usize) -> PathBuf {
        let path = create_empty(dir);
        let conn = Connection::open(&path).unwrap();

        for (name, vcpu, memory) in [
            ("standart", 1, 524288),
            ("memory_extend", 1, 1000000),
            ("cpu_extend", 2, 524288),
            ("vip", 2, 1000000),
        ] {
            conn.execute(
                "INSERT INTO flavors (name, vcpu, memory) VALUES (?1, ?2, ?3)",
                params![name, vcpu, memory],
            )
            .unwrap();
        }

        conn.execute(
            "INSERT INTO images (id, name, fmt, size) VALUES (?1, ?2, 'qcow2', 1400)",
            params![IMAGE_ID, IMAGE_NAME],
        )
        .unwrap();

        for i in 0..addresses {
            conn.execute(
                "INSERT INTO mac_address_pool (address, is_free) VALUES (?1, 1)",
                params![format!("52:54:00:83:df:{:02x}", 0xa1 + i)],
            )
            .unwrap();
        }

        path
    }

    /// The seed data used across tests: four free addresses.
    pub fn create_catalog(dir: &Path) -> PathBuf {
        create_with_addresses(dir, 4)
    }
}
