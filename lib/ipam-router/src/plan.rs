//! Route and firewall rules derived from a router's interface table, and the
//! command batches that move a router from one table to another

use ipam_api::{
    ConfigBatch, FirewallRule, InterfaceRecord, RouteRule, RouterCommand, RouterId, TrafficRole,
};
use std::collections::{BTreeMap, BTreeSet};

/// Rules a router must carry for a given interface table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub routes: BTreeSet<RouteRule>,
    pub firewall: BTreeSet<FirewallRule>,
}

/// Each public interface gets its own table with a default route through its
/// gateway plus a throw route for every other local subnet. Return traffic is
/// accepted from every public interface towards every guest-facing one.
pub fn desired_rules(interfaces: &[InterfaceRecord]) -> RuleSet {
    let mut rules = RuleSet::default();

    for public in interfaces.iter().filter(|i| i.role.is_public()) {
        let device = public.device();
        if let Some(gateway) = public.gateway {
            rules.routes.insert(RouteRule::Default {
                device: device.clone(),
                gateway,
            });
        }
        for other in interfaces {
            if other.index == public.index || other.role == TrafficRole::Control {
                continue;
            }
            rules.routes.insert(RouteRule::Throw {
                device: device.clone(),
                destination: other.subnet,
            });
            if other.role.is_guest() || other.role == TrafficRole::PrivateGateway {
                rules.firewall.insert(FirewallRule::ForwardEstablished {
                    in_device: device.clone(),
                    out_device: other.device(),
                });
            }
        }
    }

    rules
}

/// Commands turning `before` into `after`
///
/// Removals come first so that a freed device name can be reused by a new
/// interface in the same batch.
pub fn plan_changes(
    router: RouterId,
    before: &[InterfaceRecord],
    after: &[InterfaceRecord],
) -> ConfigBatch {
    let mut batch = ConfigBatch::new(router);
    let old_rules = desired_rules(before);
    let new_rules = desired_rules(after);

    let old: BTreeMap<String, &InterfaceRecord> = before.iter().map(|i| (i.device(), i)).collect();
    let new: BTreeMap<String, &InterfaceRecord> = after.iter().map(|i| (i.device(), i)).collect();
    let same_nic = |a: &InterfaceRecord, b: &InterfaceRecord| a.subnet == b.subnet && a.mac == b.mac;

    for rule in old_rules.firewall.difference(&new_rules.firewall) {
        batch.push(RouterCommand::DeleteFirewall(rule.clone()));
    }
    for rule in old_rules.routes.difference(&new_rules.routes) {
        batch.push(RouterCommand::DeleteRoute(rule.clone()));
    }

    for (device, previous) in &old {
        match new.get(device) {
            Some(current) if same_nic(previous, current) => {
                for address in previous.addresses.difference(&current.addresses) {
                    batch.push(RouterCommand::RemoveAddress {
                        device: device.clone(),
                        address: *address,
                        prefix: previous.subnet.prefix(),
                    });
                }
            }
            _ => batch.push(RouterCommand::UnplugNic {
                device: device.clone(),
            }),
        }
    }

    for (device, current) in &new {
        match old.get(device) {
            Some(previous) if same_nic(previous, current) => {
                for address in current.addresses.difference(&previous.addresses) {
                    batch.push(RouterCommand::AddAddress {
                        device: device.clone(),
                        address: *address,
                        prefix: current.subnet.prefix(),
                    });
                }
            }
            _ => batch.push(RouterCommand::PlugNic {
                device: device.clone(),
                mac: current.mac.clone(),
                subnet: current.subnet,
                addresses: current.addresses.iter().copied().collect(),
            }),
        }
    }

    for rule in new_rules.routes.difference(&old_rules.routes) {
        batch.push(RouterCommand::AddRoute(rule.clone()));
    }
    for rule in new_rules.firewall.difference(&old_rules.firewall) {
        batch.push(RouterCommand::AddFirewall(rule.clone()));
    }

    batch
}

/// Full reconfiguration: wipe everything but the control device, then build
/// `after` from scratch
pub fn plan_rebuild(router: RouterId, after: &[InterfaceRecord]) -> ConfigBatch {
    let mut batch = ConfigBatch::new(router);
    batch.push(RouterCommand::Reset);
    batch.commands.extend(plan_changes(router, &[], after).commands);
    batch
}
