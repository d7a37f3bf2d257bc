//! Virtual router NIC lifecycle
//!
//! Every change follows the same path: compute the next interface table,
//! publish it with new interfaces `Attaching` and removed ones `Detaching`,
//! push the difference to the router under the call policy, then either
//! publish the committed table (everything `Attached`) or restore the
//! previous one.
//!
//! Changes to one router are serialized; different routers proceed in
//! parallel. Readers never wait for a pending router call.

use crate::agent::RouterAgent;
use crate::numbering::Numbering;
use crate::plan::{plan_changes, plan_rebuild};
use crate::policy::RouterCallPolicy;
use crate::{Result, RouterError};
use ipam_api::{
    AttachState, InterfaceRecord, LinkState, NetworkId, PublicSubnet, RouterId, TrafficRole,
};
use ipam_core::{CoreError, MetricsCollector, RouterSnapshot, Store};
use ipnetwork::Ipv4Network;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Guest-facing network of a router: an isolated network or a VPC tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTier {
    pub network: NetworkId,
    pub subnet: Ipv4Network,
    /// Address the router answers on as the tier's gateway
    pub gateway: Ipv4Addr,
}

/// Effect of an address change on a router's interface table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "interface", rename_all = "snake_case")]
pub enum InterfaceChange {
    /// A new interface was attached for the address's subnet
    Created(InterfaceRecord),
    /// An existing interface gained or lost the address
    Updated(InterfaceRecord),
    /// The interface lost its last address and was detached
    Removed(InterfaceRecord),
    /// Nothing to do; the address was already bound
    Unchanged(InterfaceRecord),
}

impl InterfaceChange {
    pub fn interface(&self) -> &InterfaceRecord {
        match self {
            InterfaceChange::Created(i)
            | InterfaceChange::Updated(i)
            | InterfaceChange::Removed(i)
            | InterfaceChange::Unchanged(i) => i,
        }
    }
}

#[derive(Default)]
struct RouterEntry {
    // Held for the whole of a change, including the router call
    changes: Mutex<()>,
    view: RwLock<Vec<InterfaceRecord>>,
}

/// Collaborators of the controller
pub struct ControllerDeps {
    pub agent: Arc<dyn RouterAgent>,
    pub policy: RouterCallPolicy,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<MetricsCollector>,
}

pub struct NetworkInterfaceController {
    routers: RwLock<HashMap<RouterId, Arc<RouterEntry>>>,
    agent: Arc<dyn RouterAgent>,
    policy: RouterCallPolicy,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsCollector>,
}

impl NetworkInterfaceController {
    pub fn new(deps: ControllerDeps) -> Self {
        Self {
            routers: RwLock::new(HashMap::new()),
            agent: deps.agent,
            policy: deps.policy,
            store: deps.store,
            metrics: deps.metrics,
        }
    }

    pub fn agent(&self) -> &Arc<dyn RouterAgent> {
        &self.agent
    }

    pub fn policy(&self) -> &RouterCallPolicy {
        &self.policy
    }

    /// Reload interface tables from the store. Returns the number of routers.
    pub async fn restore(&self) -> Result<usize> {
        let state = self.store.load().await?;
        let mut routers = self.routers.write().await;
        for snapshot in state.routers {
            let mut interfaces = finalize(snapshot.interfaces);
            interfaces.sort_by_key(|i| i.index);
            let entry = RouterEntry {
                changes: Mutex::new(()),
                view: RwLock::new(interfaces),
            };
            routers.insert(snapshot.router, Arc::new(entry));
        }
        info!("Restored interface tables of {} routers", routers.len());
        Ok(routers.len())
    }

    /// Create the control interface and the permanent guest interfaces of a
    /// new router
    pub async fn provision(
        &self,
        router: RouterId,
        control: Ipv4Network,
        tiers: &[GuestTier],
    ) -> Result<Vec<InterfaceRecord>> {
        let entry = self
            .routers
            .write()
            .await
            .entry(router)
            .or_default()
            .clone();
        let _guard = entry.changes.lock().await;
        let before = entry.view.read().await.clone();
        if !before.is_empty() {
            return Err(RouterError::AlreadyProvisioned(router));
        }

        let mut macs = BTreeSet::new();
        let mut added = vec![new_interface(
            router,
            TrafficRole::Control,
            control,
            None,
            control.ip(),
            &mut macs,
        )];
        for tier in tiers {
            added.push(new_interface(
                router,
                TrafficRole::GuestTier {
                    network: tier.network,
                },
                tier.subnet,
                None,
                tier.gateway,
                &mut macs,
            ));
        }

        let next = Numbering::Incremental.assign(Vec::new(), added);
        let committed = self
            .commit(router, &entry, "provision", before, next, false)
            .await?;
        info!(
            "Provisioned router {} with {} interfaces",
            router,
            committed.len()
        );
        Ok(committed)
    }

    /// Attach a permanent interface for a VPC tier added after provisioning
    pub async fn add_guest_tier(&self, router: RouterId, tier: GuestTier) -> Result<InterfaceRecord> {
        let role = TrafficRole::GuestTier {
            network: tier.network,
        };
        self.add_permanent(router, role, tier.subnet, tier.gateway, "add_guest_tier")
            .await
    }

    /// Attach the VPC's private gateway interface
    pub async fn add_private_gateway(
        &self,
        router: RouterId,
        subnet: Ipv4Network,
        address: Ipv4Addr,
    ) -> Result<InterfaceRecord> {
        self.add_permanent(
            router,
            TrafficRole::PrivateGateway,
            subnet,
            address,
            "add_private_gateway",
        )
        .await
    }

    async fn add_permanent(
        &self,
        router: RouterId,
        role: TrafficRole,
        subnet: Ipv4Network,
        address: Ipv4Addr,
        change: &'static str,
    ) -> Result<InterfaceRecord> {
        let entry = self.entry(router).await?;
        let _guard = entry.changes.lock().await;
        let before = entry.view.read().await.clone();
        if before.is_empty() {
            return Err(RouterError::UnknownRouter(router));
        }
        if let Some(existing) = before.iter().find(|i| i.role == role) {
            if role != TrafficRole::PrivateGateway || existing.subnet == normalize(subnet) {
                return Ok(existing.clone());
            }
        }

        let mut macs = before.iter().map(|i| i.mac.clone()).collect();
        let iface = new_interface(router, role, subnet, None, address, &mut macs);
        let mac = iface.mac.clone();
        let next = Numbering::Incremental.assign(before.clone(), vec![iface]);
        let committed = self
            .commit(router, &entry, change, before, next, false)
            .await?;
        let added = find_by_mac(&committed, &mac)?;
        info!("Router {}: {} attached as {}", router, change, added.device());
        Ok(added)
    }

    /// Bind a newly associated public address
    ///
    /// The first address of a subnet creates an interface for it; further
    /// addresses of the same subnet are added to that interface.
    pub async fn on_address_associated(
        &self,
        router: RouterId,
        address: Ipv4Addr,
        subnet: &PublicSubnet,
        source_nat: bool,
    ) -> Result<InterfaceChange> {
        let cidr = normalize(subnet.cidr);
        if !cidr.contains(address) {
            return Err(CoreError::InvalidRange(format!(
                "address {} is outside subnet {}",
                address, cidr
            ))
            .into());
        }

        let entry = self.entry(router).await?;
        let _guard = entry.changes.lock().await;
        let before = entry.view.read().await.clone();
        if before.is_empty() {
            return Err(RouterError::UnknownRouter(router));
        }

        let existing = before
            .iter()
            .find(|i| i.role.is_public() && i.subnet == cidr)
            .cloned();

        if let Some(iface) = existing {
            if iface.addresses.contains(&address) {
                return Ok(InterfaceChange::Unchanged(iface));
            }
            let mut next = before.clone();
            for i in next.iter_mut().filter(|i| i.index == iface.index) {
                i.addresses.insert(address);
            }
            let committed = self
                .commit(router, &entry, "associate", before, next, false)
                .await?;
            let updated = find_by_index(&committed, iface.index)?;
            debug!(
                "Router {}: bound {} to existing {}",
                router,
                address,
                updated.device()
            );
            return Ok(InterfaceChange::Updated(updated));
        }

        let has_source_nat = before.iter().any(|i| i.role == TrafficRole::SourceNat);
        let role = if source_nat && !has_source_nat {
            TrafficRole::SourceNat
        } else {
            TrafficRole::PublicSubnet
        };
        let mut macs = before.iter().map(|i| i.mac.clone()).collect();
        let iface = new_interface(router, role, cidr, Some(subnet.gateway), address, &mut macs);
        let mac = iface.mac.clone();
        let next = Numbering::Incremental.assign(before.clone(), vec![iface]);
        let committed = self
            .commit(router, &entry, "associate", before, next, false)
            .await?;
        let created = find_by_mac(&committed, &mac)?;
        info!(
            "Router {}: attached {} for subnet {} (vlan {})",
            router,
            created.device(),
            cidr,
            subnet.vlan
        );
        Ok(InterfaceChange::Created(created))
    }

    /// Unbind a public address. A non-permanent interface that loses its last
    /// address is detached; indices of other interfaces are left alone.
    pub async fn on_address_disassociated(
        &self,
        router: RouterId,
        address: Ipv4Addr,
    ) -> Result<InterfaceChange> {
        let entry = self.entry(router).await?;
        let _guard = entry.changes.lock().await;
        let before = entry.view.read().await.clone();

        let iface = before
            .iter()
            .find(|i| i.role.is_public() && i.addresses.contains(&address))
            .cloned()
            .ok_or(RouterError::AddressNotBound { router, address })?;

        let mut remaining = iface.clone();
        remaining.addresses.remove(&address);
        let detach = remaining.addresses.is_empty() && !remaining.role.is_permanent();

        let next: Vec<InterfaceRecord> = if detach {
            before
                .iter()
                .filter(|i| i.index != iface.index)
                .cloned()
                .collect()
        } else {
            before
                .iter()
                .map(|i| {
                    if i.index == iface.index {
                        remaining.clone()
                    } else {
                        i.clone()
                    }
                })
                .collect()
        };

        let committed = self
            .commit(router, &entry, "disassociate", before, next, false)
            .await?;

        if detach {
            let mut removed = remaining;
            removed.attach = AttachState::Unattached;
            info!(
                "Router {}: detached {} after releasing {}",
                router,
                removed.device(),
                address
            );
            Ok(InterfaceChange::Removed(removed))
        } else {
            Ok(InterfaceChange::Updated(find_by_index(&committed, iface.index)?))
        }
    }

    /// Reconfigure a router from scratch, renumbering interfaces into the
    /// canonical role order
    pub async fn rebuild(&self, router: RouterId) -> Result<Vec<InterfaceRecord>> {
        let entry = self.entry(router).await?;
        let _guard = entry.changes.lock().await;
        let before = entry.view.read().await.clone();
        if before.is_empty() {
            return Err(RouterError::UnknownRouter(router));
        }

        let kept: Vec<InterfaceRecord> = before
            .iter()
            .filter(|i| i.role.is_permanent() || !i.addresses.is_empty())
            .cloned()
            .collect();
        let next = Numbering::Canonical.assign(kept, Vec::new());
        let committed = self
            .commit(router, &entry, "rebuild", before, next, true)
            .await?;
        info!(
            "Rebuilt router {} with {} interfaces",
            router,
            committed.len()
        );
        Ok(committed)
    }

    /// Current interface table, including changes still in flight
    pub async fn interfaces(&self, router: RouterId) -> Result<Vec<InterfaceRecord>> {
        let entry = self.entry(router).await?;
        let view = entry.view.read().await.clone();
        if view.is_empty() {
            return Err(RouterError::UnknownRouter(router));
        }
        Ok(view)
    }

    pub async fn routers(&self) -> Vec<RouterId> {
        let mut routers: Vec<RouterId> = self.routers.read().await.keys().copied().collect();
        routers.sort();
        routers
    }

    /// Drop a destroyed router's table
    pub async fn forget(&self, router: RouterId) -> Result<()> {
        if self.routers.write().await.remove(&router).is_none() {
            return Err(RouterError::UnknownRouter(router));
        }
        self.store.remove_router(router).await?;
        info!("Forgot router {}", router);
        Ok(())
    }

    async fn entry(&self, router: RouterId) -> Result<Arc<RouterEntry>> {
        self.routers
            .read()
            .await
            .get(&router)
            .cloned()
            .ok_or(RouterError::UnknownRouter(router))
    }

    /// Push `next` to the router, then publish it or restore `before`
    async fn commit(
        &self,
        router: RouterId,
        entry: &RouterEntry,
        change: &'static str,
        before: Vec<InterfaceRecord>,
        next: Vec<InterfaceRecord>,
        rebuild: bool,
    ) -> Result<Vec<InterfaceRecord>> {
        let batch = if rebuild {
            plan_rebuild(router, &next)
        } else {
            plan_changes(router, &before, &next)
        };
        if batch.is_empty() {
            let committed = finalize(next);
            *entry.view.write().await = committed.clone();
            return Ok(committed);
        }

        *entry.view.write().await = stage(&before, &next, rebuild);
        debug!(
            "Router {} {}: sending {} commands",
            router,
            change,
            batch.commands.len()
        );

        let agent = &self.agent;
        let batch = &batch;
        if let Err(e) = self
            .policy
            .call(router, change, || agent.apply(batch))
            .await
        {
            *entry.view.write().await = before;
            self.metrics.router_change(change, false);
            warn!(
                "Router {} {} failed; interface table rolled back: {}",
                router, change, e
            );
            return Err(e);
        }

        let committed = finalize(next);
        *entry.view.write().await = committed.clone();
        self.metrics.router_change(change, true);
        // The router already runs the new table; the next successful save
        // writes the whole table again
        if let Err(e) = self
            .store
            .save_router(&RouterSnapshot {
                router,
                interfaces: committed.clone(),
            })
            .await
        {
            error!(
                "Router {} {} applied but interface table not persisted: {}",
                router, change, e
            );
        }
        Ok(committed)
    }
}

/// Table as seen while a change is in flight
fn stage(
    before: &[InterfaceRecord],
    next: &[InterfaceRecord],
    rebuild: bool,
) -> Vec<InterfaceRecord> {
    let mut staged: Vec<InterfaceRecord> = next
        .iter()
        .map(|i| {
            let known = before
                .iter()
                .any(|b| b.index == i.index && b.subnet == i.subnet && b.mac == i.mac);
            let mut i = i.clone();
            if rebuild || !known {
                i.attach = AttachState::Attaching;
            }
            i
        })
        .collect();
    if !rebuild {
        for b in before {
            if !next.iter().any(|n| n.index == b.index) {
                let mut leaving = b.clone();
                leaving.attach = AttachState::Detaching;
                staged.push(leaving);
            }
        }
    }
    staged.sort_by_key(|i| i.index);
    staged
}

fn finalize(mut interfaces: Vec<InterfaceRecord>) -> Vec<InterfaceRecord> {
    for iface in interfaces.iter_mut() {
        iface.attach = AttachState::Attached;
    }
    interfaces
}

fn find_by_index(table: &[InterfaceRecord], index: u32) -> Result<InterfaceRecord> {
    table
        .iter()
        .find(|i| i.index == index)
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("interface eth{} lost on commit", index)).into())
}

fn find_by_mac(table: &[InterfaceRecord], mac: &str) -> Result<InterfaceRecord> {
    table
        .iter()
        .find(|i| i.mac == mac)
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("interface {} lost on commit", mac)).into())
}

fn normalize(subnet: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(subnet)
}

fn new_interface(
    router: RouterId,
    role: TrafficRole,
    subnet: Ipv4Network,
    gateway: Option<Ipv4Addr>,
    address: Ipv4Addr,
    macs: &mut BTreeSet<String>,
) -> InterfaceRecord {
    let mac = loop {
        let mac = random_mac();
        if macs.insert(mac.clone()) {
            break mac;
        }
    };
    InterfaceRecord {
        router,
        // Placeholder until numbering assigns the real index
        index: u32::MAX,
        role,
        subnet: normalize(subnet),
        gateway,
        addresses: [address].into_iter().collect(),
        mac,
        attach: AttachState::Unattached,
        link: LinkState::Up,
    }
}

/// Locally administered unicast MAC
fn random_mac() -> String {
    let bytes: [u8; 5] = rand::thread_rng().gen();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedRouter;
    use ipam_core::pool::PoolSnapshot;
    use ipam_core::{MemoryStore, StoredState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Fixture {
        controller: Arc<NetworkInterfaceController>,
        sim: Arc<SimulatedRouter>,
        store: Arc<MemoryStore>,
        metrics: Arc<MetricsCollector>,
        router: RouterId,
        tier: GuestTier,
    }

    fn policy() -> RouterCallPolicy {
        RouterCallPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn public(third: u8) -> PublicSubnet {
        PublicSubnet {
            vlan: "untagged".to_string(),
            gateway: Ipv4Addr::new(172, 16, third, 1),
            cidr: format!("172.16.{}.0/24", third).parse().unwrap(),
        }
    }

    fn ip(third: u8, last: u8) -> Ipv4Addr {
        Ipv4Addr::new(172, 16, third, last)
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedRouter::new());
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsCollector::default());
        let controller = Arc::new(NetworkInterfaceController::new(ControllerDeps {
            agent: sim.clone(),
            policy: policy(),
            store: store.clone(),
            metrics: metrics.clone(),
        }));
        let router = RouterId::new();
        let tier = GuestTier {
            network: NetworkId::new(),
            subnet: "10.1.1.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 1, 1, 1),
        };
        controller
            .provision(router, "169.254.0.10/16".parse().unwrap(), &[tier])
            .await
            .unwrap();
        Fixture {
            controller,
            sim,
            store,
            metrics,
            router,
            tier,
        }
    }

    fn devices(table: &[InterfaceRecord]) -> Vec<(String, String)> {
        table
            .iter()
            .map(|i| (i.device(), i.subnet.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_provision_creates_control_and_guest() {
        let f = fixture().await;
        let table = f.controller.interfaces(f.router).await.unwrap();
        assert_eq!(
            devices(&table),
            vec![
                ("eth0".to_string(), "169.254.0.0/16".to_string()),
                ("eth1".to_string(), "10.1.1.0/24".to_string()),
            ]
        );
        assert!(table.iter().all(|i| i.attach == AttachState::Attached));
        assert_eq!(f.sim.devices(f.router).await.len(), 2);

        assert!(matches!(
            f.controller
                .provision(f.router, "169.254.0.10/16".parse().unwrap(), &[])
                .await,
            Err(RouterError::AlreadyProvisioned(_))
        ));
    }

    #[tokio::test]
    async fn test_interface_lifecycle() {
        let f = fixture().await;
        let count = |t: &[InterfaceRecord]| t.len();

        // First address of a new subnet creates exactly one interface
        let change = f
            .controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Created(ref i) if i.device() == "eth2"));
        assert_eq!(count(&f.controller.interfaces(f.router).await.unwrap()), 3);

        // Second address of the same subnet creates none
        let change = f
            .controller
            .on_address_associated(f.router, ip(5, 3), &public(5), false)
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Updated(ref i) if i.addresses.len() == 2));
        assert_eq!(count(&f.controller.interfaces(f.router).await.unwrap()), 3);

        // Associating again is a no-op
        let change = f
            .controller
            .on_address_associated(f.router, ip(5, 3), &public(5), false)
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Unchanged(_)));

        // Releasing one of two keeps the interface
        let change = f
            .controller
            .on_address_disassociated(f.router, ip(5, 2))
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Updated(_)));
        assert_eq!(count(&f.controller.interfaces(f.router).await.unwrap()), 3);

        // Releasing the last removes it
        let change = f
            .controller
            .on_address_disassociated(f.router, ip(5, 3))
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Removed(ref i) if i.device() == "eth2"));
        assert_eq!(count(&f.controller.interfaces(f.router).await.unwrap()), 2);
        assert!(!f.sim.devices(f.router).await.contains_key("eth2"));

        assert!(matches!(
            f.controller.on_address_disassociated(f.router, ip(5, 3)).await,
            Err(RouterError::AddressNotBound { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_nat_interface_is_permanent() {
        let f = fixture().await;
        f.controller
            .on_address_associated(f.router, ip(4, 20), &public(4), true)
            .await
            .unwrap();
        let change = f
            .controller
            .on_address_disassociated(f.router, ip(4, 20))
            .await
            .unwrap();
        match change {
            InterfaceChange::Updated(i) => {
                assert_eq!(i.role, TrafficRole::SourceNat);
                assert!(i.addresses.is_empty());
            }
            other => panic!("unexpected change: {:?}", other),
        }
        assert_eq!(f.controller.interfaces(f.router).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_routes_and_firewall_follow_interfaces() {
        let f = fixture().await;
        f.controller
            .on_address_associated(f.router, ip(4, 20), &public(4), true)
            .await
            .unwrap();
        f.controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();

        assert_eq!(
            f.sim.route_table(f.router, "eth3").await,
            vec![
                "default via 172.16.5.1 dev eth3 proto static".to_string(),
                "throw 10.1.1.0/24 proto static".to_string(),
                "throw 172.16.4.0/24 proto static".to_string(),
            ]
        );
        assert!(f
            .sim
            .route_table(f.router, "eth2")
            .await
            .contains(&"throw 172.16.5.0/24 proto static".to_string()));
        assert!(f.sim.firewall(f.router).await.contains(
            &"-A FORWARD -i eth3 -o eth1 -m state --state RELATED,ESTABLISHED -j ACCEPT"
                .to_string()
        ));

        f.controller
            .on_address_disassociated(f.router, ip(5, 2))
            .await
            .unwrap();
        assert!(f.sim.route_table(f.router, "eth3").await.is_empty());
        assert!(!f
            .sim
            .route_table(f.router, "eth2")
            .await
            .contains(&"throw 172.16.5.0/24 proto static".to_string()));
        assert_eq!(f.sim.firewall(f.router).await.len(), 1);
    }

    #[tokio::test]
    async fn test_freed_index_is_reused_without_renumbering() {
        let f = fixture().await;
        for third in [5, 6, 7] {
            f.controller
                .on_address_associated(f.router, ip(third, 2), &public(third), false)
                .await
                .unwrap();
        }
        f.controller
            .on_address_disassociated(f.router, ip(6, 2))
            .await
            .unwrap();
        let table = f.controller.interfaces(f.router).await.unwrap();
        assert_eq!(
            devices(&table)[2..],
            [
                ("eth2".to_string(), "172.16.5.0/24".to_string()),
                ("eth4".to_string(), "172.16.7.0/24".to_string()),
            ]
        );

        f.controller
            .on_address_associated(f.router, ip(8, 2), &public(8), false)
            .await
            .unwrap();
        let table = f.controller.interfaces(f.router).await.unwrap();
        assert!(devices(&table).contains(&("eth3".to_string(), "172.16.8.0/24".to_string())));
    }

    #[tokio::test]
    async fn test_rebuild_renumbers_canonically() {
        let f = fixture().await;
        let tier2 = GuestTier {
            network: NetworkId::new(),
            subnet: "10.1.2.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 1, 2, 1),
        };
        f.controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        f.controller.add_guest_tier(f.router, tier2).await.unwrap();
        f.controller
            .on_address_associated(f.router, ip(4, 20), &public(4), true)
            .await
            .unwrap();

        // eth0 control, eth1 tier, eth2 public, eth3 tier2, eth4 source NAT
        let table = f.controller.rebuild(f.router).await.unwrap();
        let roles: Vec<u8> = table.iter().map(|i| i.role.rank()).collect();
        assert_eq!(roles, vec![0, 1, 2, 4, 4]);
        assert_eq!(
            devices(&table),
            vec![
                ("eth0".to_string(), "169.254.0.0/16".to_string()),
                ("eth1".to_string(), "172.16.4.0/24".to_string()),
                ("eth2".to_string(), "172.16.5.0/24".to_string()),
                ("eth3".to_string(), "10.1.1.0/24".to_string()),
                ("eth4".to_string(), "10.1.2.0/24".to_string()),
            ]
        );
        let sim_devices = f.sim.devices(f.router).await;
        assert_eq!(sim_devices["eth3"].subnet.to_string(), "10.1.1.0/24");
        assert_eq!(
            f.sim.route_table(f.router, "eth1").await[0],
            "default via 172.16.4.1 dev eth1 proto static"
        );
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_attach() {
        let f = fixture().await;
        let before = f.controller.interfaces(f.router).await.unwrap();
        f.sim
            .set_delay(f.router, Some(Duration::from_millis(500)))
            .await;

        let err = f
            .controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::RouterSyncTimeout { .. }));
        assert_eq!(f.controller.interfaces(f.router).await.unwrap(), before);
        assert_eq!(
            f.metrics
                .router_changes_total
                .with_label_values(&["associate", "failure"])
                .get(),
            1
        );

        // The router recovers and the same change goes through
        f.sim.set_delay(f.router, None).await;
        let change = f
            .controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Created(_)));
    }

    /// Store whose router writes fail while `broken` is set
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Store for FlakyStore {
        async fn save_pool(&self, snapshot: &PoolSnapshot) -> ipam_core::Result<()> {
            self.inner.save_pool(snapshot).await
        }

        async fn remove_pool(&self, id: ipam_api::PoolId) -> ipam_core::Result<()> {
            self.inner.remove_pool(id).await
        }

        async fn save_router(&self, snapshot: &RouterSnapshot) -> ipam_core::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(CoreError::Storage(std::io::Error::other("disk full")));
            }
            self.inner.save_router(snapshot).await
        }

        async fn remove_router(&self, id: RouterId) -> ipam_core::Result<()> {
            self.inner.remove_router(id).await
        }

        async fn load(&self) -> ipam_core::Result<StoredState> {
            self.inner.load().await
        }
    }

    #[tokio::test]
    async fn test_applied_change_survives_failed_save() {
        let sim = Arc::new(SimulatedRouter::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: AtomicBool::new(false),
        });
        let controller = NetworkInterfaceController::new(ControllerDeps {
            agent: sim.clone(),
            policy: policy(),
            store: store.clone(),
            metrics: Arc::new(MetricsCollector::default()),
        });
        let router = RouterId::new();
        controller
            .provision(router, "169.254.0.10/16".parse().unwrap(), &[])
            .await
            .unwrap();

        store.broken.store(true, Ordering::SeqCst);
        let change = controller
            .on_address_associated(router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        assert!(matches!(change, InterfaceChange::Created(_)));
        let table = controller.interfaces(router).await.unwrap();
        assert!(table.iter().any(|i| i.addresses.contains(&ip(5, 2))));
        assert!(table.iter().all(|i| i.attach == AttachState::Attached));
        assert_eq!(sim.devices(router).await.len(), 2);

        // The next change persists the full table
        store.broken.store(false, Ordering::SeqCst);
        controller
            .on_address_associated(router, ip(5, 3), &public(5), false)
            .await
            .unwrap();
        let saved = store.load().await.unwrap();
        assert_eq!(saved.routers[0].interfaces, controller.interfaces(router).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_detach_keeps_interface() {
        let f = fixture().await;
        f.controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        f.sim.fail_next(f.router, 1).await;
        assert!(matches!(
            f.controller.on_address_disassociated(f.router, ip(5, 2)).await,
            Err(RouterError::RouterRejected { .. })
        ));
        let table = f.controller.interfaces(f.router).await.unwrap();
        assert!(table.iter().any(|i| i.addresses.contains(&ip(5, 2))));
    }

    #[tokio::test]
    async fn test_attaching_state_is_visible_while_router_call_pending() {
        let f = fixture().await;
        f.sim
            .set_delay(f.router, Some(Duration::from_millis(60)))
            .await;

        let controller = f.controller.clone();
        let router = f.router;
        let pending = tokio::spawn(async move {
            controller
                .on_address_associated(router, ip(5, 2), &public(5), false)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let table = f.controller.interfaces(f.router).await.unwrap();
        let attaching = table.iter().find(|i| i.device() == "eth2").unwrap();
        assert_eq!(attaching.attach, AttachState::Attaching);

        pending.await.unwrap().unwrap();
        let table = f.controller.interfaces(f.router).await.unwrap();
        assert!(table.iter().all(|i| i.attach == AttachState::Attached));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let f = fixture().await;
        f.controller
            .on_address_associated(f.router, ip(5, 2), &public(5), false)
            .await
            .unwrap();
        let expected = f.controller.interfaces(f.router).await.unwrap();

        let restored = NetworkInterfaceController::new(ControllerDeps {
            agent: f.sim.clone(),
            policy: policy(),
            store: f.store.clone(),
            metrics: f.metrics.clone(),
        });
        assert_eq!(restored.restore().await.unwrap(), 1);
        assert_eq!(restored.interfaces(f.router).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_restore_from_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ipam_core::JsonFileStore::open(dir.path()).await.unwrap());
        let sim = Arc::new(SimulatedRouter::new());
        let deps = || ControllerDeps {
            agent: sim.clone(),
            policy: policy(),
            store: store.clone(),
            metrics: Arc::new(MetricsCollector::default()),
        };

        let controller = NetworkInterfaceController::new(deps());
        let router = RouterId::new();
        controller
            .provision(router, "169.254.0.10/16".parse().unwrap(), &[])
            .await
            .unwrap();
        controller
            .on_address_associated(router, ip(4, 20), &public(4), true)
            .await
            .unwrap();

        let restored = NetworkInterfaceController::new(deps());
        assert_eq!(restored.restore().await.unwrap(), 1);
        assert_eq!(
            restored.interfaces(router).await.unwrap(),
            controller.interfaces(router).await.unwrap()
        );

        restored.forget(router).await.unwrap();
        let again = NetworkInterfaceController::new(deps());
        assert_eq!(again.restore().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_router() {
        let f = fixture().await;
        let other = RouterId::new();
        assert!(matches!(
            f.controller
                .on_address_associated(other, ip(5, 2), &public(5), false)
                .await,
            Err(RouterError::UnknownRouter(_))
        ));
        assert!(matches!(
            f.controller.rebuild(other).await,
            Err(RouterError::UnknownRouter(_))
        ));
        // Provisioned tier is idempotent
        let again = f.controller.add_guest_tier(f.router, f.tier).await.unwrap();
        assert_eq!(again.device(), "eth1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_associations_on_one_router() {
        let f = fixture().await;
        let mut tasks = Vec::new();
        for third in 10..20u8 {
            let controller = f.controller.clone();
            let router = f.router;
            tasks.push(tokio::spawn(async move {
                controller
                    .on_address_associated(router, ip(third, 2), &public(third), false)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let table = f.controller.interfaces(f.router).await.unwrap();
        let indices: BTreeSet<u32> = table.iter().map(|i| i.index).collect();
        assert_eq!(table.len(), 12);
        assert_eq!(indices, (0..12).collect());
        assert_eq!(f.sim.devices(f.router).await.len(), 12);
    }
}
