//! Virtual router network interfaces

use crate::{NetworkId, RouterId};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Logical purpose of a router interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficRole {
    /// Link-local management interface, always eth0
    Control,
    /// Public subnet carrying the network's source NAT address
    SourceNat,
    /// Additional public subnet with associated addresses
    PublicSubnet,
    /// VPC private gateway
    PrivateGateway,
    /// Guest-facing interface of an isolated network or VPC tier
    GuestTier { network: NetworkId },
}

impl TrafficRole {
    /// Permanent roles survive losing all of their addresses
    pub fn is_permanent(&self) -> bool {
        !matches!(self, TrafficRole::PublicSubnet)
    }

    pub fn is_public(&self) -> bool {
        matches!(self, TrafficRole::SourceNat | TrafficRole::PublicSubnet)
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, TrafficRole::GuestTier { .. })
    }

    /// Position in the canonical interface order used on rebuild:
    /// control, source NAT, public subnets, private gateway, guest tiers
    pub fn rank(&self) -> u8 {
        match self {
            TrafficRole::Control => 0,
            TrafficRole::SourceNat => 1,
            TrafficRole::PublicSubnet => 2,
            TrafficRole::PrivateGateway => 3,
            TrafficRole::GuestTier { .. } => 4,
        }
    }
}

/// Attachment lifecycle of a (router, subnet) pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachState {
    Unattached,
    Attaching,
    Attached,
    Detaching,
}

/// Administrative link state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    Up,
    Down,
}

/// One ethN device on a router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub router: RouterId,
    pub index: u32,
    pub role: TrafficRole,
    pub subnet: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub addresses: BTreeSet<Ipv4Addr>,
    pub mac: String,
    pub attach: AttachState,
    pub link: LinkState,
}

impl InterfaceRecord {
    /// Kernel device name, e.g. "eth2"
    pub fn device(&self) -> String {
        format!("eth{}", self.index)
    }
}

/// Redundancy role reported by a router's keepalived health check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RedundancyState {
    Master,
    Backup,
    Fault,
}

impl fmt::Display for RedundancyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RedundancyState::Master => "MASTER",
            RedundancyState::Backup => "BACKUP",
            RedundancyState::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("unrecognized redundancy state: {0}")]
pub struct ParseRedundancyStateError(pub String);

impl FromStr for RedundancyState {
    type Err = ParseRedundancyStateError;

    /// Accepts the bare state or health-check output such as "Status: MASTER"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if upper.contains("MASTER") {
            Ok(RedundancyState::Master)
        } else if upper.contains("BACKUP") {
            Ok(RedundancyState::Backup)
        } else if upper.contains("FAULT") {
            Ok(RedundancyState::Fault)
        } else {
            Err(ParseRedundancyStateError(s.trim().to_string()))
        }
    }
}
