//! Configuration pushed to a virtual router

use crate::RouterId;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Policy route installed in a public interface's own table
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteRule {
    /// Egress through the subnet's upstream gateway
    Default { device: String, gateway: Ipv4Addr },
    /// Send traffic for another local subnet back to the main table
    Throw { device: String, destination: Ipv4Network },
}

impl RouteRule {
    pub fn device(&self) -> &str {
        match self {
            RouteRule::Default { device, .. } | RouteRule::Throw { device, .. } => device,
        }
    }

    /// Routing table holding this rule, e.g. "Table_eth3"
    pub fn table(&self) -> String {
        format!("Table_{}", self.device())
    }

    /// iproute2 invocation that installs or removes the rule
    pub fn to_command(&self, install: bool) -> String {
        let verb = if install { "add" } else { "del" };
        match self {
            RouteRule::Default { device, gateway } => format!(
                "ip route {} default via {} dev {} table {} proto static",
                verb,
                gateway,
                device,
                self.table()
            ),
            RouteRule::Throw { destination, .. } => format!(
                "ip route {} throw {} table {} proto static",
                verb,
                destination,
                self.table()
            ),
        }
    }
}

/// Renders the rule the way `ip route show table ...` lists it
impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRule::Default { device, gateway } => {
                write!(f, "default via {} dev {} proto static", gateway, device)
            }
            RouteRule::Throw { destination, .. } => {
                write!(f, "throw {} proto static", destination)
            }
        }
    }
}

/// Forwarding rule between two router interfaces
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirewallRule {
    /// Accept return traffic arriving on a public interface for a guest interface
    ForwardEstablished { in_device: String, out_device: String },
}

impl FirewallRule {
    pub fn to_command(&self, install: bool) -> String {
        let flag = if install { "-A" } else { "-D" };
        match self {
            FirewallRule::ForwardEstablished { in_device, out_device } => format!(
                "iptables {} FORWARD -i {} -o {} -m state --state RELATED,ESTABLISHED -j ACCEPT",
                flag, in_device, out_device
            ),
        }
    }
}

/// Renders the rule the way `iptables-save` lists it
impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallRule::ForwardEstablished { in_device, out_device } => write!(
                f,
                "-A FORWARD -i {} -o {} -m state --state RELATED,ESTABLISHED -j ACCEPT",
                in_device, out_device
            ),
        }
    }
}

/// Single configuration step understood by the router agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouterCommand {
    /// Drop every non-control device, route table and forward rule
    Reset,
    PlugNic {
        device: String,
        mac: String,
        subnet: Ipv4Network,
        addresses: Vec<Ipv4Addr>,
    },
    UnplugNic { device: String },
    AddAddress { device: String, address: Ipv4Addr, prefix: u8 },
    RemoveAddress { device: String, address: Ipv4Addr, prefix: u8 },
    AddRoute(RouteRule),
    DeleteRoute(RouteRule),
    AddFirewall(FirewallRule),
    DeleteFirewall(FirewallRule),
}

/// Ordered set of commands applied atomically by the router agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigBatch {
    pub router: RouterId,
    pub commands: Vec<RouterCommand>,
}

impl ConfigBatch {
    pub fn new(router: RouterId) -> Self {
        Self {
            router,
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: RouterCommand) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
