use ipam_api::{AccountId, NetworkId, PoolId};
use std::net::Ipv4Addr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad category of a failure, used to pick a response status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Capacity,
    Coordination,
    Internal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid IP range: {0}")]
    InvalidRange(String),

    #[error("Unknown account {account}: {reason}")]
    UnknownAccount { account: AccountId, reason: String },

    #[error("IP range {pool} is already dedicated to account {owner}")]
    AlreadyDedicated { pool: PoolId, owner: AccountId },

    #[error("IP range {0} is not dedicated to any account")]
    NotDedicated(PoolId),

    #[error("IP range {pool} has address {address} in use by active rules")]
    RangeInUse { pool: PoolId, address: Ipv4Addr },

    #[error("IP range {pool} has address {address} allocated to account {holder}")]
    HeldByOtherAccount {
        pool: PoolId,
        address: Ipv4Addr,
        holder: AccountId,
    },

    #[error("IP range {start}-{end} overlaps existing range {existing} on vlan {vlan}")]
    OverlappingRange {
        start: Ipv4Addr,
        end: Ipv4Addr,
        existing: PoolId,
        vlan: String,
    },

    #[error("Account {account} public IP limit exceeded: {requested} requested, {used} used, {limit} allowed")]
    ResourceLimitExceeded {
        account: AccountId,
        requested: u64,
        used: u64,
        limit: u64,
    },

    #[error("No free public IP address available for network {0}")]
    PoolExhausted(NetworkId),

    #[error("Address {0} is not available for acquisition")]
    AddressUnavailable(Ipv4Addr),

    #[error("IP range not found: {0}")]
    PoolNotFound(PoolId),

    #[error("Address not found: {0}")]
    AddressNotFound(Ipv4Addr),

    #[error("Network not found: {0}")]
    NetworkNotFound(NetworkId),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidRange(_)
            | CoreError::UnknownAccount { .. }
            | CoreError::AddressUnavailable(_) => ErrorKind::Validation,
            CoreError::PoolNotFound(_)
            | CoreError::AddressNotFound(_)
            | CoreError::NetworkNotFound(_) => ErrorKind::NotFound,
            CoreError::AlreadyDedicated { .. }
            | CoreError::NotDedicated(_)
            | CoreError::RangeInUse { .. }
            | CoreError::HeldByOtherAccount { .. }
            | CoreError::OverlappingRange { .. } => ErrorKind::Conflict,
            CoreError::ResourceLimitExceeded { .. } | CoreError::PoolExhausted(_) => {
                ErrorKind::Capacity
            }
            CoreError::Storage(_) | CoreError::Serialization(_) | CoreError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}
