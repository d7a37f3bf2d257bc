//! Virtual router interface management
//!
//! This library provides:
//! - Per-router interface tables with incremental and canonical numbering
//! - Route and firewall derivation for public subnets
//! - Router agents (HTTP and in-memory) behind a timeout/retry policy
//! - Change propagation and convergence checks for redundant pairs

pub mod agent;
pub mod controller;
pub mod error;
pub mod numbering;
pub mod plan;
pub mod policy;
pub mod simulated;
pub mod sync;

pub use agent::{HttpRouterAgent, RouterAgent};
pub use controller::{ControllerDeps, GuestTier, InterfaceChange, NetworkInterfaceController};
pub use error::{Result, RouterError};
pub use numbering::Numbering;
pub use plan::{desired_rules, plan_changes, plan_rebuild, RuleSet};
pub use policy::RouterCallPolicy;
pub use simulated::SimulatedRouter;
pub use sync::{
    ConvergenceReport, NicChange, RedundantPair, RouterConvergence, RouterOutcome,
    RouterSyncCoordinator,
};
