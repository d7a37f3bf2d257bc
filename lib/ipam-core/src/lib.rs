//! Public IP range allocation and dedication engine
//!
//! This library provides:
//! - IP pools with per-address state and the registry that owns them
//! - Dedication of ranges to accounts, gated by the public IP limit
//! - Address acquisition (dedicated ranges first, then system ranges)
//! - Domain event dispatch and durable storage of pool state

pub mod allocator;
pub mod directory;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod rules;
pub mod store;

pub use allocator::{AddressAllocator, Allocation, AllocationSource};
pub use directory::{
    AccountDirectory, AccountInfo, NetworkDirectory, NetworkInfo, ResourceLimits, StaticDirectory,
};
pub use error::{CoreError, ErrorKind, Result};
pub use events::{EventBus, EventHandler};
pub use metrics::MetricsCollector;
pub use pool::{IpPool, ValidatedRange};
pub use registry::{IpRangeRegistry, RegistryDeps};
pub use rules::{RuleInspector, RuleKind, RuleLedger, RuleRef};
pub use store::{JsonFileStore, MemoryStore, RouterSnapshot, Store, StoredState};
