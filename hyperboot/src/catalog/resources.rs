//! Catalog operations used by the provisioning pipeline.

use rusqlite::{Connection, OptionalExtension, Params, Row, TransactionBehavior, params};

use super::records::{Flavor, ImageMetadata, Instance, NetworkAddress};
use super::{Catalog, db_err};
use crate::errors::{ProvisionError, ProvisionResult};

impl Catalog {
    /// Look up a flavor by id.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no row matches
    /// - `AmbiguousResult` if more than one row matches
    pub fn get_flavor(&self, id: i64) -> ProvisionResult<Flavor> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            exactly_one(
                tx,
                "flavor",
                &id.to_string(),
                &format!("SELECT {} FROM flavors WHERE id = ?1", Flavor::COLUMNS),
                params![id],
                Flavor::from_row,
            )
        })
    }

    /// Look up image metadata by id. Same error semantics as [`get_flavor`](Self::get_flavor).
    pub fn get_image(&self, id: &str) -> ProvisionResult<ImageMetadata> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            exactly_one(
                tx,
                "image",
                id,
                &format!("SELECT {} FROM images WHERE id = ?1", ImageMetadata::COLUMNS),
                params![id],
                ImageMetadata::from_row,
            )
        })
    }

    pub fn list_flavors(&self) -> ProvisionResult<Vec<Flavor>> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            all_rows(
                tx,
                &format!("SELECT {} FROM flavors ORDER BY id", Flavor::COLUMNS),
                Flavor::from_row,
            )
        })
    }

    pub fn list_images(&self) -> ProvisionResult<Vec<ImageMetadata>> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            all_rows(
                tx,
                &format!("SELECT {} FROM images ORDER BY id", ImageMetadata::COLUMNS),
                ImageMetadata::from_row,
            )
        })
    }

    pub fn list_addresses(&self) -> ProvisionResult<Vec<NetworkAddress>> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            all_rows(
                tx,
                &format!(
                    "SELECT {} FROM mac_address_pool ORDER BY id",
                    NetworkAddress::COLUMNS
                ),
                NetworkAddress::from_row,
            )
        })
    }

    pub fn get_address(&self, id: i64) -> ProvisionResult<NetworkAddress> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            exactly_one(
                tx,
                "network address",
                &id.to_string(),
                &format!(
                    "SELECT {} FROM mac_address_pool WHERE id = ?1",
                    NetworkAddress::COLUMNS
                ),
                params![id],
                NetworkAddress::from_row,
            )
        })
    }

    /// Reserve the free address with the lowest id.
    ///
    /// Selection and the `is_free` flip are one conditional `UPDATE` under
    /// the database write lock, so two callers (in any process) never get
    /// the same row.
    ///
    /// # Errors
    ///
    /// `ResourcePoolExhausted` when no address is free; nothing is mutated.
    pub fn allocate_free_address(&self) -> ProvisionResult<NetworkAddress> {
        self.with_transaction(TransactionBehavior::Immediate, |tx| {
            let allocated = db_err!(
                tx.query_row(
                    "UPDATE mac_address_pool SET is_free = 0
                     WHERE id = (
                         SELECT id FROM mac_address_pool
                         WHERE is_free = 1
                         ORDER BY id
                         LIMIT 1
                     )
                     RETURNING id, address",
                    [],
                    |row| {
                        Ok(NetworkAddress {
                            id: row.get(0)?,
                            address: row.get(1)?,
                            is_free: false,
                        })
                    },
                )
                .optional()
            )?;

            let address = allocated.ok_or(ProvisionError::ResourcePoolExhausted)?;
            tracing::debug!(
                address_id = address.id,
                address = %address.address,
                "Reserved network address"
            );
            Ok(address)
        })
    }

    /// Return a reserved address to the free pool.
    ///
    /// Refuses to release an address still referenced by an instance row.
    /// Returns whether the address was flipped back to free.
    pub fn release_address(&self, id: i64) -> ProvisionResult<bool> {
        self.with_transaction(TransactionBehavior::Immediate, |tx| {
            let changed = db_err!(tx.execute(
                "UPDATE mac_address_pool SET is_free = 1
                 WHERE id = ?1
                   AND is_free = 0
                   AND NOT EXISTS (SELECT 1 FROM instance WHERE mac_addr = ?1)",
                params![id],
            ))?;
            tracing::debug!(address_id = id, released = changed > 0, "Release address");
            Ok(changed > 0)
        })
    }

    /// Persist the binding between a started domain and its address.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the address row does not exist
    /// - `InvalidArgument` if the address is still marked free
    pub fn record_instance(&self, instance: &Instance) -> ProvisionResult<()> {
        self.with_transaction(TransactionBehavior::Immediate, |tx| {
            let is_free: Option<bool> = db_err!(
                tx.query_row(
                    "SELECT is_free FROM mac_address_pool WHERE id = ?1",
                    params![instance.address_id],
                    |row| row.get(0),
                )
                .optional()
            )?;

            match is_free {
                None => {
                    return Err(ProvisionError::NotFound {
                        entity: "network address",
                        id: instance.address_id.to_string(),
                    });
                }
                Some(true) => {
                    return Err(ProvisionError::InvalidArgument(format!(
                        "address {} is not reserved",
                        instance.address_id
                    )));
                }
                Some(false) => {}
            }

            db_err!(tx.execute(
                "INSERT INTO instance (id, domain_name, state, mac_addr) VALUES (?1, ?2, ?3, ?4)",
                params![
                    instance.id,
                    instance.domain_name,
                    instance.state.as_str(),
                    instance.address_id
                ],
            ))?;

            tracing::debug!(
                instance_id = %instance.id,
                domain_name = %instance.domain_name,
                address_id = instance.address_id,
                "Recorded instance"
            );
            Ok(())
        })
    }

    pub fn get_instance(&self, id: &str) -> ProvisionResult<Instance> {
        self.with_transaction(TransactionBehavior::Deferred, |tx| {
            exactly_one(
                tx,
                "instance",
                id,
                &format!("SELECT {} FROM instance WHERE id = ?1", Instance::COLUMNS),
                params![id],
                Instance::from_row,
            )
        })
    }
}

/// Run a query that must match exactly one row.
fn exactly_one<T, P: Params>(
    conn: &Connection,
    entity: &'static str,
    id: &str,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> ProvisionResult<T> {
    let mut stmt = db_err!(conn.prepare(sql))?;
    let mut rows = db_err!(stmt.query_map(params, map))?;

    let first = match rows.next() {
        Some(row) => db_err!(row)?,
        None => {
            return Err(ProvisionError::NotFound {
                entity,
                id: id.to_string(),
            });
        }
    };

    let extra = rows.count();
    if extra > 0 {
        return Err(ProvisionError::AmbiguousResult {
            entity,
            id: id.to_string(),
            count: extra + 1,
        });
    }

    Ok(first)
}

fn all_rows<T>(
    conn: &Connection,
    sql: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> ProvisionResult<Vec<T>> {
    let mut stmt = db_err!(conn.prepare(sql))?;
    let rows = db_err!(stmt.query_map([], map))?;
    db_err!(rows.collect::<Result<Vec<_>, _>>())
}
