//! Row types for the catalog tables.

use std::fmt;

use rusqlite::Row;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};

/// Virtual hardware profile (`flavors` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: i64,
    pub name: String,
    pub vcpu: u32,
    pub memory_kib: u64,
}

impl Flavor {
    pub(super) const COLUMNS: &'static str = "id, name, vcpu, memory";

    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            vcpu: row.get(2)?,
            memory_kib: non_negative(row, 3)?,
        })
    }
}

/// Disk image metadata (`images` table). `id` is also the blob store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub name: String,
    pub format: String,
    pub size: u64,
}

impl ImageMetadata {
    pub(super) const COLUMNS: &'static str = "id, name, fmt, size";

    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            format: row.get(2)?,
            size: non_negative(row, 3)?,
        })
    }

    /// Key under which the image bytes live in the blob store.
    pub fn storage_key(&self) -> &str {
        &self.id
    }
}

/// Entry of the `mac_address_pool` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub id: i64,
    pub address: String,
    pub is_free: bool,
}

impl NetworkAddress {
    pub(super) const COLUMNS: &'static str = "id, address, is_free";

    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            is_free: row.get(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Running,
    /// Written by another tool; kept verbatim.
    Other(String),
}

impl InstanceState {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Other(s) => s,
        }
    }
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => InstanceState::Running,
            _ => InstanceState::Other(s),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Booted instance (`instance` table).
///
/// `id` is the hypervisor-assigned domain UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub domain_name: String,
    pub state: InstanceState,
    pub address_id: i64,
}

impl Instance {
    pub(super) const COLUMNS: &'static str = "id, domain_name, state, mac_addr";

    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            domain_name: row.get(1)?,
            state: InstanceState::from(state),
            address_id: row.get(3)?,
        })
    }
}

fn non_negative(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}
