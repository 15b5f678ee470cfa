//! Undo for a boot that failed after acquiring resources.
//!
//! Order: destroy the started domain, then release the address. An address
//! stays reserved while its domain may still be running.

use super::types::{BootServices, StartedDomain};
use crate::catalog::NetworkAddress;
use crate::errors::{CompensationFailure, ProvisionError};
use crate::hypervisor::DestroyOutcome;

/// Undo `address` and `domain`, returning whatever could not be undone.
///
/// Safe to run more than once for the same reservations.
pub(crate) async fn compensate(
    services: &BootServices,
    instance_name: &str,
    address: Option<NetworkAddress>,
    domain: Option<StartedDomain>,
) -> Vec<CompensationFailure> {
    let mut failures = Vec::new();
    let mut domain_stopped = true;

    if let Some(domain) = domain {
        match services.hypervisor.destroy(&domain.name).await {
            Ok(DestroyOutcome::Destroyed) => {
                tracing::info!(
                    instance = %instance_name,
                    domain_id = ?domain.id,
                    "Destroyed domain of failed boot"
                );
            }
            Ok(DestroyOutcome::NotManaged) => {
                tracing::debug!(
                    instance = %instance_name,
                    domain_id = ?domain.id,
                    "Domain already gone from registry"
                );
            }
            Err(error) => {
                domain_stopped = false;
                failures.push(CompensationFailure::OrphanedDomain {
                    domain_name: domain.name,
                    domain_id: domain.id,
                    error,
                });
            }
        }
    }

    if let Some(address) = address {
        if !domain_stopped {
            failures.push(CompensationFailure::LeakedReservation {
                address_id: address.id,
                error: ProvisionError::Internal(format!(
                    "kept reserved while domain {} may still be running",
                    instance_name
                )),
                address: address.address,
            });
            return failures;
        }

        let id = address.id;
        match services
            .catalog_call(move |catalog| catalog.release_address(id))
            .await
        {
            Ok(true) => {
                tracing::info!(
                    instance = %instance_name,
                    address = %address.address,
                    "Released address of failed boot"
                );
            }
            Ok(false) => {
                tracing::warn!(
                    instance = %instance_name,
                    address = %address.address,
                    "Address was already free or is bound to an instance"
                );
            }
            Err(error) => failures.push(CompensationFailure::LeakedReservation {
                address_id: address.id,
                address: address.address,
                error,
            }),
        }
    }

    failures
}
