//! In-memory router control plane
//!
//! Models devices, policy routes, forward rules and keepalived role for any
//! number of routers. Delays and failures can be injected per router.

use crate::agent::RouterAgent;
use crate::{Result, RouterError};
use async_trait::async_trait;
use ipam_api::{
    ConfigBatch, FirewallRule, LinkState, RedundancyState, RouteRule, RouterCommand, RouterId,
};
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedDevice {
    pub mac: String,
    pub subnet: Ipv4Network,
    pub addresses: BTreeSet<Ipv4Addr>,
}

#[derive(Clone, Debug)]
struct RouterState {
    devices: BTreeMap<String, SimulatedDevice>,
    routes: BTreeSet<RouteRule>,
    firewall: BTreeSet<FirewallRule>,
    role: RedundancyState,
    forced_links: BTreeMap<String, LinkState>,
    delay: Option<Duration>,
    failures: u32,
    applied: usize,
}

impl Default for RouterState {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            routes: BTreeSet::new(),
            firewall: BTreeSet::new(),
            role: RedundancyState::Master,
            forced_links: BTreeMap::new(),
            delay: None,
            failures: 0,
            applied: 0,
        }
    }
}

impl RouterState {
    fn execute(&mut self, command: &RouterCommand) -> std::result::Result<(), String> {
        match command {
            RouterCommand::Reset => {
                self.devices.retain(|name, _| name == "eth0");
                self.routes.clear();
                self.firewall.clear();
            }
            RouterCommand::PlugNic {
                device,
                mac,
                subnet,
                addresses,
            } => {
                self.devices.insert(
                    device.clone(),
                    SimulatedDevice {
                        mac: mac.clone(),
                        subnet: *subnet,
                        addresses: addresses.iter().copied().collect(),
                    },
                );
            }
            RouterCommand::UnplugNic { device } => {
                if self.devices.remove(device).is_none() {
                    return Err(format!("no such device {}", device));
                }
                // The kernel drops routes through a device that goes away
                self.routes.retain(|r| r.device() != device.as_str());
            }
            RouterCommand::AddAddress {
                device, address, ..
            } => {
                self.device_mut(device)?.addresses.insert(*address);
            }
            RouterCommand::RemoveAddress {
                device, address, ..
            } => {
                self.device_mut(device)?.addresses.remove(address);
            }
            RouterCommand::AddRoute(rule) => {
                if !self.devices.contains_key(rule.device()) {
                    return Err(format!("route {} references missing device", rule));
                }
                self.routes.insert(rule.clone());
            }
            RouterCommand::DeleteRoute(rule) => {
                self.routes.remove(rule);
            }
            RouterCommand::AddFirewall(rule) => {
                self.firewall.insert(rule.clone());
            }
            RouterCommand::DeleteFirewall(rule) => {
                self.firewall.remove(rule);
            }
        }
        Ok(())
    }

    fn device_mut(&mut self, device: &str) -> std::result::Result<&mut SimulatedDevice, String> {
        self.devices
            .get_mut(device)
            .ok_or_else(|| format!("no such device {}", device))
    }

    /// keepalived keeps public devices (those egressing through a default
    /// route) down on the backup
    fn links(&self) -> BTreeMap<String, LinkState> {
        self.devices
            .keys()
            .map(|name| {
                let public = self
                    .routes
                    .iter()
                    .any(|r| matches!(r, RouteRule::Default { device, .. } if device == name));
                let state = match self.forced_links.get(name) {
                    Some(forced) => *forced,
                    None if public && self.role != RedundancyState::Master => LinkState::Down,
                    None => LinkState::Up,
                };
                (name.clone(), state)
            })
            .collect()
    }
}

#[derive(Default)]
pub struct SimulatedRouter {
    routers: RwLock<HashMap<RouterId, RouterState>>,
}

impl SimulatedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_role(&self, router: RouterId, role: RedundancyState) {
        self.routers.write().await.entry(router).or_default().role = role;
    }

    /// Delay every subsequent apply on `router`
    pub async fn set_delay(&self, router: RouterId, delay: Option<Duration>) {
        self.routers.write().await.entry(router).or_default().delay = delay;
    }

    /// Reject the next `count` applies on `router`
    pub async fn fail_next(&self, router: RouterId, count: u32) {
        self.routers.write().await.entry(router).or_default().failures = count;
    }

    /// Pin a device's link state regardless of role
    pub async fn force_link(&self, router: RouterId, device: &str, state: LinkState) {
        self.routers
            .write()
            .await
            .entry(router)
            .or_default()
            .forced_links
            .insert(device.to_string(), state);
    }

    pub async fn devices(&self, router: RouterId) -> BTreeMap<String, SimulatedDevice> {
        self.routers
            .read()
            .await
            .get(&router)
            .map(|s| s.devices.clone())
            .unwrap_or_default()
    }

    /// Routes of one device's table, rendered as `ip route show` lists them
    pub async fn route_table(&self, router: RouterId, device: &str) -> Vec<String> {
        self.routers
            .read()
            .await
            .get(&router)
            .map(|s| {
                s.routes
                    .iter()
                    .filter(|r| r.device() == device)
                    .map(|r| r.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forward rules rendered as `iptables-save` lists them
    pub async fn firewall(&self, router: RouterId) -> Vec<String> {
        self.routers
            .read()
            .await
            .get(&router)
            .map(|s| s.firewall.iter().map(|r| r.to_string()).collect())
            .unwrap_or_default()
    }

    /// Number of batches successfully applied to `router`
    pub async fn applied(&self, router: RouterId) -> usize {
        self.routers
            .read()
            .await
            .get(&router)
            .map(|s| s.applied)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RouterAgent for SimulatedRouter {
    async fn apply(&self, batch: &ConfigBatch) -> Result<()> {
        let router = batch.router;
        let delay = {
            let mut routers = self.routers.write().await;
            let state = routers.entry(router).or_default();
            if state.failures > 0 {
                state.failures -= 1;
                return Err(RouterError::RouterRejected {
                    router,
                    reason: "injected failure".to_string(),
                });
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut routers = self.routers.write().await;
        let state = routers.entry(router).or_default();
        let mut next = state.clone();
        for command in &batch.commands {
            next.execute(command)
                .map_err(|reason| RouterError::RouterRejected { router, reason })?;
        }
        next.applied += 1;
        *state = next;
        debug!(
            "Simulated router {} applied {} commands",
            router,
            batch.commands.len()
        );
        Ok(())
    }

    async fn redundancy_state(&self, router: RouterId) -> Result<RedundancyState> {
        Ok(self
            .routers
            .read()
            .await
            .get(&router)
            .map(|s| s.role)
            .unwrap_or(RedundancyState::Master))
    }

    async fn link_states(&self, router: RouterId) -> Result<BTreeMap<String, LinkState>> {
        Ok(self
            .routers
            .read()
            .await
            .get(&router)
            .map(|s| s.links())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug(device: &str, subnet: &str) -> RouterCommand {
        RouterCommand::PlugNic {
            device: device.to_string(),
            mac: "02:00:00:00:00:01".to_string(),
            subnet: subnet.parse().unwrap(),
            addresses: vec![],
        }
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let sim = SimulatedRouter::new();
        let router = RouterId::new();
        let mut batch = ConfigBatch::new(router);
        batch.push(plug("eth2", "172.16.5.0/24"));
        batch.push(RouterCommand::UnplugNic {
            device: "eth9".to_string(),
        });

        assert!(sim.apply(&batch).await.is_err());
        assert!(sim.devices(router).await.is_empty());
        assert_eq!(sim.applied(router).await, 0);
    }

    #[tokio::test]
    async fn test_backup_keeps_public_devices_down() {
        let sim = SimulatedRouter::new();
        let router = RouterId::new();
        let mut batch = ConfigBatch::new(router);
        batch.push(plug("eth1", "10.1.1.0/24"));
        batch.push(plug("eth2", "172.16.5.0/24"));
        batch.push(RouterCommand::AddRoute(RouteRule::Default {
            device: "eth2".to_string(),
            gateway: Ipv4Addr::new(172, 16, 5, 1),
        }));
        sim.apply(&batch).await.unwrap();

        sim.set_role(router, RedundancyState::Backup).await;
        let links = sim.link_states(router).await.unwrap();
        assert_eq!(links["eth1"], LinkState::Up);
        assert_eq!(links["eth2"], LinkState::Down);
        assert_eq!(
            sim.route_table(router, "eth2").await,
            vec!["default via 172.16.5.1 dev eth2 proto static".to_string()]
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let sim = SimulatedRouter::new();
        let router = RouterId::new();
        sim.fail_next(router, 1).await;
        let mut batch = ConfigBatch::new(router);
        batch.push(plug("eth2", "172.16.5.0/24"));

        assert!(sim.apply(&batch).await.is_err());
        assert!(sim.apply(&batch).await.is_ok());
        assert_eq!(sim.applied(router).await, 1);
    }
}
