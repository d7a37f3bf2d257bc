//! A single public IP range and the state of each of its addresses

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use ipam_api::{
    AccountId, AddressRecord, AddressState, CreateRangeRequest, NetworkId, PoolId, PoolOwner,
    PoolRecord, PoolView, VpcId, ZoneId,
};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Largest range accepted; every address gets its own slot
pub const MAX_RANGE_SIZE: u32 = 65_536;

/// Range parameters that passed validation
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRange {
    pub zone: ZoneId,
    pub vlan: String,
    pub gateway: Ipv4Addr,
    pub cidr: Ipv4Network,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub for_virtual_network: bool,
}

impl ValidatedRange {
    /// Parse and check a creation request without touching any state
    pub fn from_request(req: &CreateRangeRequest) -> Result<Self> {
        let gateway = parse_addr("gateway", &req.gateway)?;
        let netmask = parse_addr("netmask", &req.netmask)?;
        let start = parse_addr("start IP", &req.start_ip)?;
        let end = parse_addr("end IP", &req.end_ip)?;

        if req.vlan.trim().is_empty() {
            return Err(CoreError::InvalidRange("vlan must not be empty".to_string()));
        }

        let prefix = ipnetwork::ipv4_mask_to_prefix(netmask).map_err(|_| {
            CoreError::InvalidRange(format!("netmask {} is not a contiguous mask", netmask))
        })?;
        let cidr = Ipv4Network::new(gateway, prefix)
            .and_then(|net| Ipv4Network::new(net.network(), prefix))
            .map_err(|e| CoreError::InvalidRange(e.to_string()))?;

        if start > end {
            return Err(CoreError::InvalidRange(format!(
                "start IP {} is greater than end IP {}",
                start, end
            )));
        }
        if !cidr.contains(start) || !cidr.contains(end) {
            return Err(CoreError::InvalidRange(format!(
                "range {}-{} is not inside subnet {}",
                start, end, cidr
            )));
        }
        let size = u64::from(u32::from(end) - u32::from(start)) + 1;
        if size > u64::from(MAX_RANGE_SIZE) {
            return Err(CoreError::InvalidRange(format!(
                "range {}-{} has {} addresses, at most {} allowed",
                start, end, size, MAX_RANGE_SIZE
            )));
        }
        if start <= gateway && gateway <= end {
            return Err(CoreError::InvalidRange(format!(
                "gateway {} must not be part of the range {}-{}",
                gateway, start, end
            )));
        }
        if prefix < 31 && (start == cidr.network() || end == cidr.broadcast()) {
            return Err(CoreError::InvalidRange(format!(
                "range {}-{} includes the network or broadcast address of {}",
                start, end, cidr
            )));
        }

        Ok(Self {
            zone: req.zone,
            vlan: req.vlan.trim().to_string(),
            gateway,
            cidr,
            start,
            end,
            for_virtual_network: req.for_virtual_network,
        })
    }
}

fn parse_addr(field: &str, value: &str) -> Result<Ipv4Addr> {
    value.trim().parse().map_err(|_| {
        CoreError::InvalidRange(format!("{} '{}' is not a valid IPv4 address", field, value))
    })
}

/// Who an address is being handed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Association {
    pub account: AccountId,
    pub network: NetworkId,
    pub vpc: Option<VpcId>,
}

/// Persisted form of a pool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub record: PoolRecord,
    pub addresses: Vec<AddressRecord>,
}

/// In-memory range with one slot per address, indexed by offset from start
#[derive(Clone, Debug)]
pub struct IpPool {
    record: PoolRecord,
    slots: Vec<AddressRecord>,
    retired: bool,
}

impl IpPool {
    pub fn new(
        id: PoolId,
        sequence: u64,
        range: ValidatedRange,
        owner: PoolOwner,
        created_at: DateTime<Utc>,
    ) -> Self {
        let record = PoolRecord {
            id,
            sequence,
            zone: range.zone,
            vlan: range.vlan,
            gateway: range.gateway,
            cidr: range.cidr,
            start: range.start,
            end: range.end,
            for_virtual_network: range.for_virtual_network,
            owner,
            created_at,
        };
        let slots = (u32::from(record.start)..=u32::from(record.end))
            .map(|raw| AddressRecord::free(Ipv4Addr::from(raw), id))
            .collect();

        Self {
            record,
            slots,
            retired: false,
        }
    }

    pub fn from_snapshot(snapshot: PoolSnapshot) -> Result<Self> {
        let PoolSnapshot { record, addresses } = snapshot;
        if addresses.len() != record.size() as usize {
            return Err(CoreError::Internal(format!(
                "pool {} snapshot has {} addresses, expected {}",
                record.id,
                addresses.len(),
                record.size()
            )));
        }
        for (offset, slot) in addresses.iter().enumerate() {
            if u32::from(slot.address) != u32::from(record.start) + offset as u32 {
                return Err(CoreError::Internal(format!(
                    "pool {} snapshot is out of order at {}",
                    record.id, slot.address
                )));
            }
        }
        Ok(Self {
            record,
            slots: addresses,
            retired: false,
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            record: self.record.clone(),
            addresses: self.slots.clone(),
        }
    }

    pub fn record(&self) -> &PoolRecord {
        &self.record
    }

    pub fn id(&self) -> PoolId {
        self.record.id
    }

    pub fn owner(&self) -> PoolOwner {
        self.record.owner
    }

    pub fn set_owner(&mut self, owner: PoolOwner) {
        self.record.owner = owner;
    }

    /// A retired pool has been deleted from the registry; holders of a stale
    /// handle must not allocate from it
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn addresses(&self) -> &[AddressRecord] {
        &self.slots
    }

    pub fn slot(&self, address: Ipv4Addr) -> Option<&AddressRecord> {
        let i = self.offset(address)?;
        Some(&self.slots[i])
    }

    fn slot_mut(&mut self, address: Ipv4Addr) -> Option<&mut AddressRecord> {
        let i = self.offset(address)?;
        Some(&mut self.slots[i])
    }

    fn offset(&self, address: Ipv4Addr) -> Option<usize> {
        if self.record.contains(address) {
            Some((u32::from(address) - u32::from(self.record.start)) as usize)
        } else {
            None
        }
    }

    fn count(&self, state: AddressState) -> u32 {
        self.slots.iter().filter(|s| s.state == state).count() as u32
    }

    pub fn allocated_count(&self) -> u32 {
        self.count(AddressState::Allocated)
    }

    pub fn free_count(&self) -> u32 {
        self.count(AddressState::Free)
    }

    /// Addresses of this pool currently allocated to `account`
    pub fn allocated_to(&self, account: AccountId) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.is_allocated() && s.account == Some(account))
            .count() as u64
    }

    /// Allocate the lowest free address
    pub fn allocate_next(&mut self, assoc: Association) -> Option<AddressRecord> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == AddressState::Free)?;
        Self::assign(slot, assoc);
        Some(slot.clone())
    }

    /// Allocate exactly `address` if it is free
    pub fn allocate_exact(
        &mut self,
        address: Ipv4Addr,
        assoc: Association,
    ) -> Result<AddressRecord> {
        let slot = self
            .slot_mut(address)
            .ok_or(CoreError::AddressNotFound(address))?;
        if slot.state != AddressState::Free {
            return Err(CoreError::AddressUnavailable(address));
        }
        Self::assign(slot, assoc);
        Ok(slot.clone())
    }

    fn assign(slot: &mut AddressRecord, assoc: Association) {
        slot.state = AddressState::Allocated;
        slot.account = Some(assoc.account);
        slot.network = Some(assoc.network);
        slot.vpc = assoc.vpc;
        slot.allocated_at = Some(Utc::now());
    }

    /// Free an allocated address. Returns the record as it was before the
    /// release, or `None` when the address was not allocated.
    pub fn release(&mut self, address: Ipv4Addr) -> Result<Option<AddressRecord>> {
        let slot = self
            .slot_mut(address)
            .ok_or(CoreError::AddressNotFound(address))?;
        if !slot.is_allocated() {
            return Ok(None);
        }
        let previous = slot.clone();
        slot.clear();
        Ok(Some(previous))
    }

    /// Put back a record previously returned by `release`
    pub fn restore(&mut self, previous: AddressRecord) -> Result<()> {
        let slot = self
            .slot_mut(previous.address)
            .ok_or(CoreError::AddressNotFound(previous.address))?;
        *slot = previous;
        Ok(())
    }

    pub fn reserve(&mut self, address: Ipv4Addr) -> Result<()> {
        let slot = self
            .slot_mut(address)
            .ok_or(CoreError::AddressNotFound(address))?;
        match slot.state {
            AddressState::Free => {
                slot.state = AddressState::Reserved;
                Ok(())
            }
            AddressState::Reserved => Ok(()),
            AddressState::Allocated => Err(CoreError::AddressUnavailable(address)),
        }
    }

    pub fn unreserve(&mut self, address: Ipv4Addr) -> Result<()> {
        let slot = self
            .slot_mut(address)
            .ok_or(CoreError::AddressNotFound(address))?;
        if slot.state == AddressState::Reserved {
            slot.state = AddressState::Free;
        }
        Ok(())
    }

    /// Mutable access to an allocated address for flag updates
    pub fn allocated_mut(&mut self, address: Ipv4Addr) -> Result<&mut AddressRecord> {
        let slot = self
            .slot_mut(address)
            .ok_or(CoreError::AddressNotFound(address))?;
        if !slot.is_allocated() {
            return Err(CoreError::AddressUnavailable(address));
        }
        Ok(slot)
    }

    /// Free every address still associated with `network`
    pub fn release_network(&mut self, network: NetworkId) -> Vec<AddressRecord> {
        let mut released = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.is_allocated() && slot.network == Some(network) {
                released.push(slot.clone());
                slot.clear();
            }
        }
        released
    }

    pub fn view(&self) -> PoolView {
        let record = &self.record;
        PoolView {
            id: record.id,
            zone: record.zone,
            vlan: record.vlan.clone(),
            gateway: record.gateway,
            netmask: record.netmask(),
            start_ip: record.start,
            end_ip: record.end,
            for_virtual_network: record.for_virtual_network,
            owner: record.owner,
            account: record.owner.label(),
            size: record.size(),
            allocated: self.allocated_count(),
            reserved: self.count(AddressState::Reserved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: &str, end: &str) -> CreateRangeRequest {
        CreateRangeRequest {
            zone: ZoneId::new(),
            vlan: "untagged".to_string(),
            gateway: "172.16.5.1".to_string(),
            netmask: "255.255.255.0".to_string(),
            start_ip: start.to_string(),
            end_ip: end.to_string(),
            for_virtual_network: true,
            owner: None,
        }
    }

    fn pool(start: &str, end: &str) -> IpPool {
        let range = ValidatedRange::from_request(&request(start, end)).expect("valid range");
        IpPool::new(PoolId::new(), 1, range, PoolOwner::System, Utc::now())
    }

    fn assoc() -> Association {
        Association {
            account: AccountId::new(),
            network: NetworkId::new(),
            vpc: None,
        }
    }

    #[test]
    fn test_validate_normalizes_subnet() {
        let range = ValidatedRange::from_request(&request("172.16.5.2", "172.16.5.3")).unwrap();
        assert_eq!(range.cidr.to_string(), "172.16.5.0/24");
        assert_eq!(range.gateway, Ipv4Addr::new(172, 16, 5, 1));
    }

    #[test]
    fn test_validate_rejects_malformed_addresses() {
        for (start, end) in [
            ("172.16.5.256", "172.16.5.3"),
            ("172.16.5", "172.16.5.3"),
            ("172.16.5.2", "abc"),
            ("", "172.16.5.3"),
        ] {
            let err = ValidatedRange::from_request(&request(start, end)).unwrap_err();
            assert!(matches!(err, CoreError::InvalidRange(_)), "{} {}", start, end);
        }
    }

    #[test]
    fn test_validate_rejects_inverted_and_foreign_ranges() {
        assert!(ValidatedRange::from_request(&request("172.16.5.9", "172.16.5.3")).is_err());
        assert!(ValidatedRange::from_request(&request("172.16.6.2", "172.16.6.3")).is_err());
        assert!(ValidatedRange::from_request(&request("172.16.5.0", "172.16.5.3")).is_err());
    }

    #[test]
    fn test_validate_rejects_gateway_inside_range() {
        let err = ValidatedRange::from_request(&request("172.16.5.1", "172.16.5.3")).unwrap_err();
        assert!(err.to_string().contains("gateway"));
    }

    #[test]
    fn test_validate_rejects_oversized_range() {
        let mut req = request("1.0.0.2", "126.255.255.254");
        req.gateway = "1.0.0.1".to_string();
        req.netmask = "128.0.0.0".to_string();
        let err = ValidatedRange::from_request(&req).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRange(ref m) if m.contains("at most")));

        // A full /16 worth of addresses is still accepted
        let mut req = request("10.0.0.2", "10.1.0.1");
        req.gateway = "10.0.0.1".to_string();
        req.netmask = "255.254.0.0".to_string();
        let range = ValidatedRange::from_request(&req).unwrap();
        assert_eq!(u32::from(range.end) - u32::from(range.start) + 1, MAX_RANGE_SIZE);
    }

    #[test]
    fn test_validate_rejects_bad_netmask() {
        let mut req = request("172.16.5.2", "172.16.5.3");
        req.netmask = "255.0.255.0".to_string();
        assert!(ValidatedRange::from_request(&req).is_err());
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let pool = pool("172.16.5.2", "172.16.5.11");
        assert_eq!(pool.addresses().len(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_allocate_next_is_lowest_free() {
        let mut pool = pool("172.16.5.2", "172.16.5.3");
        let a = pool.allocate_next(assoc()).unwrap();
        let b = pool.allocate_next(assoc()).unwrap();
        assert_eq!(a.address, Ipv4Addr::new(172, 16, 5, 2));
        assert_eq!(b.address, Ipv4Addr::new(172, 16, 5, 3));
        assert!(pool.allocate_next(assoc()).is_none());
    }

    #[test]
    fn test_allocate_exact_requires_free() {
        let mut pool = pool("172.16.5.2", "172.16.5.3");
        let ip = Ipv4Addr::new(172, 16, 5, 3);
        pool.allocate_exact(ip, assoc()).unwrap();
        assert!(matches!(
            pool.allocate_exact(ip, assoc()),
            Err(CoreError::AddressUnavailable(_))
        ));
        assert!(matches!(
            pool.allocate_exact(Ipv4Addr::new(172, 16, 5, 9), assoc()),
            Err(CoreError::AddressNotFound(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = pool("172.16.5.2", "172.16.5.3");
        let a = pool.allocate_next(assoc()).unwrap();
        let previous = pool.release(a.address).unwrap().expect("was allocated");
        assert_eq!(previous.network, a.network);
        assert!(pool.release(a.address).unwrap().is_none());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_reserved_addresses_are_skipped() {
        let mut pool = pool("172.16.5.2", "172.16.5.3");
        pool.reserve(Ipv4Addr::new(172, 16, 5, 2)).unwrap();
        let a = pool.allocate_next(assoc()).unwrap();
        assert_eq!(a.address, Ipv4Addr::new(172, 16, 5, 3));
        assert!(pool.allocate_next(assoc()).is_none());

        pool.unreserve(Ipv4Addr::new(172, 16, 5, 2)).unwrap();
        assert!(pool.allocate_next(assoc()).is_some());
    }

    #[test]
    fn test_release_network_frees_only_that_network() {
        let mut pool = pool("172.16.5.2", "172.16.5.5");
        let first = assoc();
        let second = assoc();
        pool.allocate_next(first).unwrap();
        pool.allocate_next(second).unwrap();
        pool.allocate_next(first).unwrap();

        let released = pool.release_network(first.network);
        assert_eq!(released.len(), 2);
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut pool = pool("172.16.5.2", "172.16.5.4");
        pool.allocate_next(assoc()).unwrap();
        let restored = IpPool::from_snapshot(pool.snapshot()).unwrap();
        assert_eq!(restored.allocated_count(), 1);
        assert_eq!(restored.record(), pool.record());
    }

    #[test]
    fn test_snapshot_with_missing_slots_is_rejected() {
        let mut snapshot = pool("172.16.5.2", "172.16.5.4").snapshot();
        snapshot.addresses.pop();
        assert!(IpPool::from_snapshot(snapshot).is_err());
    }
}
