//! Domain events raised by collaborating services

use crate::{AccountId, NetworkId};
use serde::{Deserialize, Serialize};

/// Lifecycle event the IPAM engine reacts to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Every range dedicated to the account reverts to the system pool
    AccountDeleted { account: AccountId },
    /// Addresses still associated with the network are freed
    NetworkDeleted { network: NetworkId },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::AccountDeleted { .. } => "account_deleted",
            DomainEvent::NetworkDeleted { .. } => "network_deleted",
        }
    }
}
