//! Public IP range and virtual router API types
//!
//! This library defines the shared vocabulary of the IPAM engine:
//! - Typed identifiers for zones, pools, accounts, networks and routers
//! - IP range (pool) and address records, plus the views served to callers
//! - Virtual router interface records and redundancy roles
//! - Router configuration commands (NICs, routes, firewall rules)
//! - Domain events raised by collaborating services

pub mod command;
pub mod event;
pub mod ids;
pub mod interface;
pub mod range;

pub use command::{ConfigBatch, FirewallRule, RouteRule, RouterCommand};
pub use event::DomainEvent;
pub use ids::{AccountId, DomainId, NetworkId, PoolId, RouterId, VpcId, ZoneId};
pub use interface::{
    AttachState, InterfaceRecord, LinkState, ParseRedundancyStateError, RedundancyState,
    TrafficRole,
};
pub use range::{
    AddressPurpose, AddressRecord, AddressState, CreateRangeRequest, Ownership, PoolFilter,
    PoolOwner, PoolRecord, PoolView, PublicSubnet,
};
