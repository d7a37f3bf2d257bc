//! Public IP ranges and their addresses

use crate::{AccountId, DomainId, NetworkId, PoolId, VpcId, ZoneId};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Account and domain that a range is dedicated to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub account: AccountId,
    pub domain: DomainId,
}

/// Owner of a range: either the system (global pool) or one account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolOwner {
    System,
    Account { account: AccountId, domain: DomainId },
}

impl PoolOwner {
    pub fn account(&self) -> Option<AccountId> {
        match self {
            PoolOwner::System => None,
            PoolOwner::Account { account, .. } => Some(*account),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, PoolOwner::System)
    }

    /// Label shown in listings ("system" for the global pool)
    pub fn label(&self) -> String {
        match self {
            PoolOwner::System => "system".to_string(),
            PoolOwner::Account { account, .. } => account.to_string(),
        }
    }
}

impl Default for PoolOwner {
    fn default() -> Self {
        PoolOwner::System
    }
}

impl From<Ownership> for PoolOwner {
    fn from(o: Ownership) -> Self {
        PoolOwner::Account {
            account: o.account,
            domain: o.domain,
        }
    }
}

/// Durable description of one contiguous range
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: PoolId,
    /// Creation order within the registry; lower sequences are searched first
    pub sequence: u64,
    pub zone: ZoneId,
    pub vlan: String,
    pub gateway: Ipv4Addr,
    /// Subnet derived from gateway and netmask
    pub cidr: Ipv4Network,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub for_virtual_network: bool,
    #[serde(default)]
    pub owner: PoolOwner,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn netmask(&self) -> Ipv4Addr {
        self.cidr.mask()
    }

    /// Number of addresses between start and end, inclusive
    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.start <= address && address <= self.end
    }

    pub fn subnet(&self) -> PublicSubnet {
        PublicSubnet {
            vlan: self.vlan.clone(),
            gateway: self.gateway,
            cidr: self.cidr,
        }
    }
}

/// Layer 3 attributes a router needs to bring up an interface for a range
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSubnet {
    pub vlan: String,
    pub gateway: Ipv4Addr,
    pub cidr: Ipv4Network,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    Free,
    Allocated,
    Reserved,
}

/// Flags an allocated address can carry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressPurpose {
    SourceNat,
    StaticNat,
    LoadBalancing,
}

/// One address of a range and its current association
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: Ipv4Addr,
    pub pool: PoolId,
    pub state: AddressState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcId>,
    #[serde(default)]
    pub source_nat: bool,
    #[serde(default)]
    pub static_nat: bool,
    #[serde(default)]
    pub for_load_balancing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
}

impl AddressRecord {
    pub fn free(address: Ipv4Addr, pool: PoolId) -> Self {
        Self {
            address,
            pool,
            state: AddressState::Free,
            account: None,
            network: None,
            vpc: None,
            source_nat: false,
            static_nat: false,
            for_load_balancing: false,
            allocated_at: None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.state == AddressState::Allocated
    }

    pub fn has_purpose(&self, purpose: AddressPurpose) -> bool {
        match purpose {
            AddressPurpose::SourceNat => self.source_nat,
            AddressPurpose::StaticNat => self.static_nat,
            AddressPurpose::LoadBalancing => self.for_load_balancing,
        }
    }

    pub fn set_purpose(&mut self, purpose: AddressPurpose, enabled: bool) {
        match purpose {
            AddressPurpose::SourceNat => self.source_nat = enabled,
            AddressPurpose::StaticNat => self.static_nat = enabled,
            AddressPurpose::LoadBalancing => self.for_load_balancing = enabled,
        }
    }

    /// Drop every association and return to the free state
    pub fn clear(&mut self) {
        *self = Self::free(self.address, self.pool);
    }
}

/// Operator request to create a range
///
/// Addresses arrive as text so that malformed input is rejected by the
/// registry with a validation error rather than at deserialization time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRangeRequest {
    pub zone: ZoneId,
    #[serde(default = "default_vlan")]
    pub vlan: String,
    pub gateway: String,
    pub netmask: String,
    pub start_ip: String,
    pub end_ip: String,
    #[serde(default = "default_for_virtual_network")]
    pub for_virtual_network: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Ownership>,
}

/// Listing filter; unset fields match everything
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolFilter {
    #[serde(default)]
    pub id: Option<PoolId>,
    #[serde(default)]
    pub zone: Option<ZoneId>,
    #[serde(default)]
    pub account: Option<AccountId>,
}

impl PoolFilter {
    pub fn matches(&self, record: &PoolRecord) -> bool {
        self.id.map_or(true, |id| id == record.id)
            && self.zone.map_or(true, |zone| zone == record.zone)
            && self
                .account
                .map_or(true, |account| record.owner.account() == Some(account))
    }
}

/// Range as reported to callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolView {
    pub id: PoolId,
    pub zone: ZoneId,
    pub vlan: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    pub for_virtual_network: bool,
    pub owner: PoolOwner,
    /// "system" or the owning account id
    pub account: String,
    pub size: u32,
    pub allocated: u32,
    pub reserved: u32,
}

fn default_vlan() -> String {
    "untagged".to_string()
}

fn default_for_virtual_network() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: [u8; 4], end: [u8; 4]) -> PoolRecord {
        PoolRecord {
            id: PoolId::new(),
            sequence: 1,
            zone: ZoneId::new(),
            vlan: "untagged".to_string(),
            gateway: Ipv4Addr::new(172, 16, 5, 1),
            cidr: "172.16.5.0/24".parse().unwrap(),
            start: start.into(),
            end: end.into(),
            for_virtual_network: true,
            owner: PoolOwner::System,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pool_record_size_and_contains() {
        let pool = record([172, 16, 5, 2], [172, 16, 5, 3]);
        assert_eq!(pool.size(), 2);
        assert!(pool.contains(Ipv4Addr::new(172, 16, 5, 2)));
        assert!(pool.contains(Ipv4Addr::new(172, 16, 5, 3)));
        assert!(!pool.contains(Ipv4Addr::new(172, 16, 5, 4)));
        assert_eq!(pool.netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn test_owner_label() {
        assert_eq!(PoolOwner::System.label(), "system");
        let account = AccountId::new();
        let owner = PoolOwner::Account {
            account,
            domain: DomainId::new(),
        };
        assert_eq!(owner.label(), account.to_string());
        assert_eq!(owner.account(), Some(account));
    }

    #[test]
    fn test_filter_by_account() {
        let account = AccountId::new();
        let mut pool = record([172, 16, 5, 2], [172, 16, 5, 3]);
        let filter = PoolFilter {
            account: Some(account),
            ..Default::default()
        };
        assert!(!filter.matches(&pool));

        pool.owner = PoolOwner::Account {
            account,
            domain: DomainId::new(),
        };
        assert!(filter.matches(&pool));
        assert!(PoolFilter::default().matches(&pool));
    }

    #[test]
    fn test_address_clear_resets_flags() {
        let mut addr = AddressRecord::free(Ipv4Addr::new(172, 16, 5, 2), PoolId::new());
        addr.state = AddressState::Allocated;
        addr.network = Some(NetworkId::new());
        addr.set_purpose(AddressPurpose::StaticNat, true);
        assert!(addr.has_purpose(AddressPurpose::StaticNat));

        addr.clear();
        assert_eq!(addr.state, AddressState::Free);
        assert!(addr.network.is_none());
        assert!(!addr.static_nat);
    }

    #[test]
    fn test_create_request_defaults() {
        let json = format!(
            r#"{{"zone":"{}","gateway":"172.16.5.1","netmask":"255.255.255.0","startIp":"172.16.5.2","endIp":"172.16.5.3"}}"#,
            ZoneId::new()
        );
        let req: CreateRangeRequest = serde_json::from_str(&json).expect("parse");
        assert_eq!(req.vlan, "untagged");
        assert!(req.for_virtual_network);
        assert!(req.owner.is_none());
    }
}
