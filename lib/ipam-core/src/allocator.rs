//! Public IP acquisition for isolated networks and VPC tiers

use crate::directory::NetworkDirectory;
use crate::events::EventHandler;
use crate::pool::{Association, IpPool};
use crate::registry::IpRangeRegistry;
use crate::rules::RuleLedger;
use crate::{CoreError, Result};
use async_trait::async_trait;
use ipam_api::{
    AccountId, AddressPurpose, AddressRecord, DomainEvent, NetworkId, PoolOwner, PublicSubnet,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Where an acquired address came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    Explicit,
    Dedicated,
    Global,
}

impl AllocationSource {
    fn label(&self) -> &'static str {
        match self {
            AllocationSource::Explicit => "explicit",
            AllocationSource::Dedicated => "dedicated",
            AllocationSource::Global => "global",
        }
    }
}

/// Result of a successful acquisition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub address: AddressRecord,
    /// Subnet of the range the address belongs to, needed to plug it on a router
    pub subnet: PublicSubnet,
    pub source: AllocationSource,
}

/// AddressAllocator hands out public IPs, preferring ranges dedicated to the
/// acquiring account over the system pool
pub struct AddressAllocator {
    registry: Arc<IpRangeRegistry>,
    networks: Arc<dyn NetworkDirectory>,
    // Rules bound to an address are dropped when the address is freed
    rules: Arc<RuleLedger>,
}

impl AddressAllocator {
    pub fn new(
        registry: Arc<IpRangeRegistry>,
        networks: Arc<dyn NetworkDirectory>,
        rules: Arc<RuleLedger>,
    ) -> Self {
        Self {
            registry,
            networks,
            rules,
        }
    }

    /// Acquire a public IP for `network` on behalf of `account`
    ///
    /// With `explicit` set exactly that address is allocated. Otherwise ranges
    /// dedicated to the account are searched in creation order, then system ranges.
    pub async fn acquire(
        &self,
        network: NetworkId,
        account: AccountId,
        explicit: Option<Ipv4Addr>,
    ) -> Result<Allocation> {
        let info = self
            .networks
            .network(network)
            .await
            .ok_or(CoreError::NetworkNotFound(network))?;
        let assoc = Association {
            account,
            network,
            vpc: info.vpc,
        };

        let allocation = match explicit {
            Some(address) => self.acquire_exact(address, info.zone, assoc).await?,
            None => self.acquire_next(info.zone, assoc).await?,
        };

        self.registry
            .metrics()
            .address_acquisitions_total
            .with_label_values(&[allocation.source.label()])
            .inc();
        info!(
            "Acquired {} for network {} (account {}, {} range {})",
            allocation.address.address,
            network,
            account,
            allocation.source.label(),
            allocation.address.pool
        );
        Ok(allocation)
    }

    async fn acquire_exact(
        &self,
        address: Ipv4Addr,
        zone: ipam_api::ZoneId,
        assoc: Association,
    ) -> Result<Allocation> {
        let handle = self
            .registry
            .pool_for_address(address)
            .await
            .ok_or(CoreError::AddressUnavailable(address))?;
        let mut pool = handle.lock().await;

        let record = pool.record();
        let permitted = match record.owner {
            PoolOwner::System => true,
            PoolOwner::Account { account, .. } => account == assoc.account,
        };
        if pool.is_retired() || record.zone != zone || !record.for_virtual_network || !permitted {
            return Err(CoreError::AddressUnavailable(address));
        }

        let allocated = pool.allocate_exact(address, assoc)?;
        self.commit(&mut pool, allocated, AllocationSource::Explicit)
            .await
    }

    async fn acquire_next(&self, zone: ipam_api::ZoneId, assoc: Association) -> Result<Allocation> {
        let candidates = self.registry.zone_candidates(zone).await;

        for source in [AllocationSource::Dedicated, AllocationSource::Global] {
            for handle in &candidates {
                let mut pool = handle.lock().await;
                if pool.is_retired() {
                    continue;
                }
                // Ownership is rechecked under the pool lock; it may have changed
                // since the candidate list was taken
                let eligible = match source {
                    AllocationSource::Dedicated => {
                        pool.owner().account() == Some(assoc.account)
                    }
                    _ => pool.owner().is_system(),
                };
                if !eligible {
                    continue;
                }
                if let Some(allocated) = pool.allocate_next(assoc) {
                    return self.commit(&mut pool, allocated, source).await;
                }
            }
        }

        warn!("No free public IP for network {}", assoc.network);
        Err(CoreError::PoolExhausted(assoc.network))
    }

    /// Persist a fresh allocation, undoing it if the write fails
    async fn commit(
        &self,
        pool: &mut IpPool,
        address: AddressRecord,
        source: AllocationSource,
    ) -> Result<Allocation> {
        if let Err(e) = self.registry.persist(pool).await {
            pool.release(address.address)?;
            return Err(e);
        }
        Ok(Allocation {
            subnet: pool.record().subnet(),
            address,
            source,
        })
    }

    /// Return an address to its range
    ///
    /// Releasing an address that is already free is not an error; `None` is
    /// returned in that case.
    pub async fn release(&self, address: Ipv4Addr) -> Result<Option<AddressRecord>> {
        let mut pool = self.live_pool(address).await?;

        let Some(previous) = pool.release(address)? else {
            debug!("Address {} already free", address);
            return Ok(None);
        };
        if let Err(e) = self.registry.persist(&pool).await {
            pool.restore(previous)?;
            return Err(e);
        }

        drop(pool);
        self.clear_rules(address).await;

        self.registry.metrics().address_releases_total.inc();
        info!("Released {} from network {:?}", address, previous.network);
        Ok(Some(previous))
    }

    /// Current state of one address
    pub async fn lookup(&self, address: Ipv4Addr) -> Result<AddressRecord> {
        let pool = self.live_pool(address).await?;
        pool.slot(address)
            .cloned()
            .ok_or(CoreError::AddressNotFound(address))
    }

    /// Subnet of the range holding `address`
    pub async fn subnet_of(&self, address: Ipv4Addr) -> Result<PublicSubnet> {
        let pool = self.live_pool(address).await?;
        Ok(pool.record().subnet())
    }

    /// Allocated addresses associated with a network
    pub async fn addresses_of(&self, network: NetworkId) -> Vec<AddressRecord> {
        let mut addresses = Vec::new();
        for handle in self.registry.all_pools().await {
            let pool = handle.lock().await;
            addresses.extend(
                pool.addresses()
                    .iter()
                    .filter(|a| a.is_allocated() && a.network == Some(network))
                    .cloned(),
            );
        }
        addresses
    }

    /// Toggle the source NAT, static NAT or load balancing flag on an allocated address
    pub async fn set_purpose(
        &self,
        address: Ipv4Addr,
        purpose: AddressPurpose,
        enabled: bool,
    ) -> Result<AddressRecord> {
        let mut pool = self.live_pool(address).await?;

        let slot = pool.allocated_mut(address)?;
        let before = slot.has_purpose(purpose);
        slot.set_purpose(purpose, enabled);
        let updated = slot.clone();

        if let Err(e) = self.registry.persist(&pool).await {
            pool.allocated_mut(address)?.set_purpose(purpose, before);
            return Err(e);
        }
        debug!("Set {:?}={} on {}", purpose, enabled, address);
        Ok(updated)
    }

    /// Hold a free address back from acquisition
    pub async fn reserve(&self, address: Ipv4Addr) -> Result<()> {
        self.update_reservation(address, true).await
    }

    pub async fn unreserve(&self, address: Ipv4Addr) -> Result<()> {
        self.update_reservation(address, false).await
    }

    async fn update_reservation(&self, address: Ipv4Addr, reserve: bool) -> Result<()> {
        let mut pool = self.live_pool(address).await?;
        let before = pool.slot(address).map(|s| s.state);

        if reserve {
            pool.reserve(address)?;
        } else {
            pool.unreserve(address)?;
        }
        if pool.slot(address).map(|s| s.state) == before {
            return Ok(());
        }

        if let Err(e) = self.registry.persist(&pool).await {
            if reserve {
                pool.unreserve(address)?;
            } else {
                pool.reserve(address)?;
            }
            return Err(e);
        }
        info!(
            "{} {}",
            if reserve { "Reserved" } else { "Unreserved" },
            address
        );
        Ok(())
    }

    /// Free every address still associated with a deleted network
    pub async fn release_network(&self, network: NetworkId) -> Result<Vec<AddressRecord>> {
        let mut released = Vec::new();
        for handle in self.registry.all_pools().await {
            let mut pool = handle.lock().await;
            if pool.is_retired() {
                continue;
            }
            let freed = pool.release_network(network);
            if freed.is_empty() {
                continue;
            }
            self.registry.persist(&pool).await?;
            drop(pool);
            for record in &freed {
                self.clear_rules(record.address).await;
            }
            self.registry
                .metrics()
                .address_releases_total
                .inc_by(freed.len() as u64);
            released.extend(freed);
        }
        info!(
            "Network {} deleted; released {} addresses",
            network,
            released.len()
        );
        Ok(released)
    }

    /// Lock the range holding `address`. A range deleted after it was looked
    /// up is treated as absent so that it is never written back to the store.
    async fn live_pool(&self, address: Ipv4Addr) -> Result<OwnedMutexGuard<IpPool>> {
        let handle = self
            .registry
            .pool_for_address(address)
            .await
            .ok_or(CoreError::AddressNotFound(address))?;
        let pool = handle.lock_owned().await;
        if pool.is_retired() {
            return Err(CoreError::AddressNotFound(address));
        }
        Ok(pool)
    }

    async fn clear_rules(&self, address: Ipv4Addr) {
        let cleared = self.rules.clear(address).await;
        if cleared > 0 {
            debug!("Dropped {} rules bound to released {}", cleared, address);
        }
    }
}

#[async_trait]
impl EventHandler for AddressAllocator {
    fn name(&self) -> &'static str {
        "AddressAllocator"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        if let DomainEvent::NetworkDeleted { network } = event {
            self.release_network(*network).await?;
        }
        Ok(())
    }
}
