//! Registry owning every public IP range
//!
//! Lock order is always: dedication lock, then the pool map, then a single
//! pool. No code path waits on the map while holding a pool lock.

use crate::directory::{AccountDirectory, ResourceLimits};
use crate::events::EventHandler;
use crate::metrics::MetricsCollector;
use crate::pool::{IpPool, ValidatedRange};
use crate::rules::RuleInspector;
use crate::store::Store;
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use ipam_api::{
    AccountId, CreateRangeRequest, DomainEvent, DomainId, Ownership, PoolFilter, PoolId,
    PoolOwner, PoolView, ZoneId,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub type PoolHandle = Arc<Mutex<IpPool>>;

/// Immutable attributes of a pool, readable without taking its lock
#[derive(Clone, Debug)]
struct PoolKey {
    sequence: u64,
    zone: ZoneId,
    vlan: String,
    start: Ipv4Addr,
    end: Ipv4Addr,
    for_virtual_network: bool,
}

impl PoolKey {
    fn of(pool: &IpPool) -> Self {
        let record = pool.record();
        Self {
            sequence: record.sequence,
            zone: record.zone,
            vlan: record.vlan.clone(),
            start: record.start,
            end: record.end,
            for_virtual_network: record.for_virtual_network,
        }
    }
}

struct PoolEntry {
    key: PoolKey,
    pool: PoolHandle,
}

/// Collaborators the registry consults
pub struct RegistryDeps {
    pub accounts: Arc<dyn AccountDirectory>,
    pub limits: Arc<dyn ResourceLimits>,
    pub rules: Arc<dyn RuleInspector>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<MetricsCollector>,
}

/// IpRangeRegistry creates, dedicates, releases and deletes public IP ranges
pub struct IpRangeRegistry {
    pools: RwLock<BTreeMap<PoolId, PoolEntry>>,
    sequence: AtomicU64,
    // Serializes owner changes so the per-account limit check sees a stable view
    dedication: Mutex<()>,
    accounts: Arc<dyn AccountDirectory>,
    limits: Arc<dyn ResourceLimits>,
    rules: Arc<dyn RuleInspector>,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsCollector>,
}

impl IpRangeRegistry {
    pub fn new(deps: RegistryDeps) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            dedication: Mutex::new(()),
            accounts: deps.accounts,
            limits: deps.limits,
            rules: deps.rules,
            store: deps.store,
            metrics: deps.metrics,
        }
    }

    /// Reload every pool from the store. Returns the number of pools restored.
    pub async fn restore(&self) -> Result<usize> {
        let state = self.store.load().await?;
        let mut pools = self.pools.write().await;
        let mut max_sequence = self.sequence.load(Ordering::SeqCst);

        for snapshot in state.pools {
            let pool = IpPool::from_snapshot(snapshot)?;
            let key = PoolKey::of(&pool);
            max_sequence = max_sequence.max(key.sequence);
            self.metrics.set_free(&pool.id().to_string(), pool.free_count());
            pools.insert(
                pool.id(),
                PoolEntry {
                    key,
                    pool: Arc::new(Mutex::new(pool)),
                },
            );
        }

        self.sequence.store(max_sequence, Ordering::SeqCst);
        info!("Restored {} IP ranges", pools.len());
        Ok(pools.len())
    }

    /// Create a range, dedicating it in the same step when an owner is given
    pub async fn create_range(&self, req: CreateRangeRequest) -> Result<PoolView> {
        let result = self.create_range_inner(req).await;
        self.metrics.range_operation("create", result.is_ok());
        result
    }

    async fn create_range_inner(&self, req: CreateRangeRequest) -> Result<PoolView> {
        let range = ValidatedRange::from_request(&req)?;
        let _dedication = self.dedication.lock().await;

        let owner = match req.owner {
            Some(ownership) => {
                self.check_account(ownership).await?;
                self.check_limit(ownership.account, range_size(&range), None)
                    .await?;
                PoolOwner::from(ownership)
            }
            None => PoolOwner::System,
        };

        let mut pools = self.pools.write().await;

        // Public addresses must be unique across every range
        if let Some((existing, entry)) = pools
            .iter()
            .find(|(_, e)| e.key.start <= range.end && range.start <= e.key.end)
        {
            return Err(CoreError::OverlappingRange {
                start: range.start,
                end: range.end,
                existing: *existing,
                vlan: entry.key.vlan.clone(),
            });
        }

        let id = PoolId::new();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = IpPool::new(id, sequence, range, owner, Utc::now());
        self.store.save_pool(&pool.snapshot()).await?;

        let view = pool.view();
        self.metrics.set_free(&id.to_string(), pool.free_count());
        pools.insert(
            id,
            PoolEntry {
                key: PoolKey::of(&pool),
                pool: Arc::new(Mutex::new(pool)),
            },
        );

        info!(
            "Created IP range {} ({}-{}, vlan {}) owned by {}",
            id, view.start_ip, view.end_ip, view.vlan, view.account
        );
        Ok(view)
    }

    /// Dedicate a system range to one account
    pub async fn dedicate(
        &self,
        id: PoolId,
        account: AccountId,
        domain: DomainId,
    ) -> Result<PoolView> {
        let result = self.dedicate_inner(id, Ownership { account, domain }).await;
        self.metrics.range_operation("dedicate", result.is_ok());
        result
    }

    async fn dedicate_inner(&self, id: PoolId, ownership: Ownership) -> Result<PoolView> {
        let _dedication = self.dedication.lock().await;
        let handle = self.pool_handle(id).await?;

        // Owners only change under the dedication lock, so this read stays valid
        let size = {
            let pool = handle.lock().await;
            if let Some(owner) = pool.owner().account() {
                return Err(CoreError::AlreadyDedicated { pool: id, owner });
            }
            check_holders(&pool, ownership.account)?;
            u64::from(pool.record().size())
        };
        self.check_account(ownership).await?;
        self.check_limit(ownership.account, size, Some(id)).await?;

        let mut pool = handle.lock().await;
        if pool.is_retired() {
            return Err(CoreError::PoolNotFound(id));
        }
        // Acquisitions from the system pool may have landed since the first check
        check_holders(&pool, ownership.account)?;
        pool.set_owner(PoolOwner::from(ownership));
        if let Err(e) = self.store.save_pool(&pool.snapshot()).await {
            pool.set_owner(PoolOwner::System);
            return Err(e);
        }

        info!("Dedicated IP range {} to account {}", id, ownership.account);
        Ok(pool.view())
    }

    /// Return a dedicated range to the system pool
    ///
    /// Allocated addresses keep their associations; only the nominal owner changes.
    pub async fn release(&self, id: PoolId) -> Result<PoolView> {
        let result = self.release_inner(id).await;
        self.metrics.range_operation("release", result.is_ok());
        result
    }

    async fn release_inner(&self, id: PoolId) -> Result<PoolView> {
        let _dedication = self.dedication.lock().await;
        let handle = self.pool_handle(id).await?;
        let mut pool = handle.lock().await;
        if pool.is_retired() {
            return Err(CoreError::PoolNotFound(id));
        }

        let previous = pool.owner();
        let Some(account) = previous.account() else {
            return Err(CoreError::NotDedicated(id));
        };

        pool.set_owner(PoolOwner::System);
        if let Err(e) = self.store.save_pool(&pool.snapshot()).await {
            pool.set_owner(previous);
            return Err(e);
        }

        if pool.allocated_count() > 0 {
            debug!(
                "Released IP range {} with {} addresses still allocated",
                id,
                pool.allocated_count()
            );
        }
        info!("Released IP range {} from account {}", id, account);
        Ok(pool.view())
    }

    /// Delete a range unless one of its allocated addresses carries active rules
    pub async fn delete(&self, id: PoolId) -> Result<()> {
        let result = self.delete_inner(id).await;
        self.metrics.range_operation("delete", result.is_ok());
        result
    }

    async fn delete_inner(&self, id: PoolId) -> Result<()> {
        let mut pools = self.pools.write().await;
        let entry = pools.get(&id).ok_or(CoreError::PoolNotFound(id))?;
        let handle = entry.pool.clone();
        let mut pool = handle.lock().await;

        let allocated: Vec<Ipv4Addr> = pool
            .addresses()
            .iter()
            .filter(|a| a.is_allocated())
            .map(|a| a.address)
            .collect();
        for address in &allocated {
            if !self.rules.active_rules(*address).await.is_empty() {
                return Err(CoreError::RangeInUse { pool: id, address: *address });
            }
        }

        self.store.remove_pool(id).await?;
        pool.retire();
        pools.remove(&id);
        self.metrics.forget_pool(&id.to_string());

        if !allocated.is_empty() {
            warn!(
                "Deleted IP range {} with {} allocated addresses and no active rules",
                id,
                allocated.len()
            );
        }
        info!("Deleted IP range {}", id);
        Ok(())
    }

    /// List ranges matching the filter, in creation order
    pub async fn list(&self, filter: &PoolFilter) -> Vec<PoolView> {
        let mut views = Vec::new();
        for handle in self.ordered_handles(|_| true).await {
            let pool = handle.lock().await;
            if filter.matches(pool.record()) {
                views.push(pool.view());
            }
        }
        views
    }

    pub async fn get(&self, id: PoolId) -> Result<PoolView> {
        let handle = self.pool_handle(id).await?;
        let view = handle.lock().await.view();
        Ok(view)
    }

    /// Release every range dedicated to an account that no longer exists
    pub async fn release_account(&self, account: AccountId) -> Result<Vec<PoolId>> {
        let mut released = Vec::new();
        for handle in self.ordered_handles(|_| true).await {
            let id = {
                let pool = handle.lock().await;
                if pool.owner().account() != Some(account) {
                    continue;
                }
                pool.id()
            };
            match self.release(id).await {
                Ok(_) => released.push(id),
                // Raced with an explicit release or delete
                Err(CoreError::NotDedicated(_)) | Err(CoreError::PoolNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(
            "Account {} deleted; released {} IP ranges",
            account,
            released.len()
        );
        Ok(released)
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    async fn pool_handle(&self, id: PoolId) -> Result<PoolHandle> {
        self.pools
            .read()
            .await
            .get(&id)
            .map(|e| e.pool.clone())
            .ok_or(CoreError::PoolNotFound(id))
    }

    /// Handles of pools selected by `keep`, ordered by creation sequence
    async fn ordered_handles(&self, keep: impl Fn(&PoolKey) -> bool) -> Vec<PoolHandle> {
        let pools = self.pools.read().await;
        let mut entries: Vec<&PoolEntry> = pools.values().filter(|e| keep(&e.key)).collect();
        entries.sort_by_key(|e| e.key.sequence);
        entries.into_iter().map(|e| e.pool.clone()).collect()
    }

    /// Public ranges of a zone in creation order
    pub(crate) async fn zone_candidates(&self, zone: ZoneId) -> Vec<PoolHandle> {
        self.ordered_handles(|k| k.zone == zone && k.for_virtual_network)
            .await
    }

    pub(crate) async fn all_pools(&self) -> Vec<PoolHandle> {
        self.ordered_handles(|_| true).await
    }

    /// Range whose address span contains `address`
    pub(crate) async fn pool_for_address(&self, address: Ipv4Addr) -> Option<PoolHandle> {
        self.pools
            .read()
            .await
            .values()
            .find(|e| e.key.start <= address && address <= e.key.end)
            .map(|e| e.pool.clone())
    }

    pub(crate) async fn persist(&self, pool: &IpPool) -> Result<()> {
        self.store.save_pool(&pool.snapshot()).await?;
        self.metrics.set_free(&pool.id().to_string(), pool.free_count());
        Ok(())
    }

    pub(crate) fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    async fn check_account(&self, ownership: Ownership) -> Result<()> {
        let info = self
            .accounts
            .account(ownership.account)
            .await
            .ok_or_else(|| CoreError::UnknownAccount {
                account: ownership.account,
                reason: "account does not exist".to_string(),
            })?;
        if info.domain != ownership.domain {
            return Err(CoreError::UnknownAccount {
                account: ownership.account,
                reason: format!("account is not in domain {}", ownership.domain),
            });
        }
        Ok(())
    }

    /// Public IPs an account holds or can allocate: the full size of every
    /// range dedicated to it plus addresses it holds from other ranges.
    /// `exclude` is skipped (and must not be locked by the caller's peers).
    async fn account_usage(&self, account: AccountId, exclude: Option<PoolId>) -> u64 {
        let mut used = 0;
        for handle in self.ordered_handles(|_| true).await {
            let pool = handle.lock().await;
            if Some(pool.id()) == exclude {
                continue;
            }
            if pool.owner().account() == Some(account) {
                used += u64::from(pool.record().size());
            } else {
                used += pool.allocated_to(account);
            }
        }
        used
    }

    async fn check_limit(
        &self,
        account: AccountId,
        requested: u64,
        exclude: Option<PoolId>,
    ) -> Result<()> {
        let Some(limit) = self.limits.max_public_ips(account).await else {
            return Ok(());
        };
        let used = self.account_usage(account, exclude).await;
        if used + requested > limit {
            return Err(CoreError::ResourceLimitExceeded {
                account,
                requested,
                used,
                limit,
            });
        }
        Ok(())
    }
}

/// A range can only be dedicated to the account holding all of its
/// allocated addresses
fn check_holders(pool: &IpPool, account: AccountId) -> Result<()> {
    let foreign = pool.addresses().iter().find_map(|a| match a.account {
        Some(holder) if a.is_allocated() && holder != account => Some((a.address, holder)),
        _ => None,
    });
    match foreign {
        Some((address, holder)) => Err(CoreError::HeldByOtherAccount {
            pool: pool.id(),
            address,
            holder,
        }),
        None => Ok(()),
    }
}

fn range_size(range: &ValidatedRange) -> u64 {
    u64::from(u32::from(range.end) - u32::from(range.start)) + 1
}

#[async_trait]
impl EventHandler for IpRangeRegistry {
    fn name(&self) -> &'static str {
        "IpRangeRegistry"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::AccountDeleted { account } => {
                self.release_account(*account).await?;
            }
            DomainEvent::NetworkDeleted { network } => {
                debug!("Network {} deleted; range ownership unchanged", network);
            }
        }
        Ok(())
    }
}
