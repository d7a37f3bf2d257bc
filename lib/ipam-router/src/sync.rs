//! Redundant router pairs: change propagation and MASTER/BACKUP convergence

use crate::controller::{InterfaceChange, NetworkInterfaceController};
use crate::{Result, RouterError};
use futures::future::join_all;
use ipam_api::{InterfaceRecord, LinkState, PublicSubnet, RedundancyState, RouterId};
use ipam_core::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Two routers serving one network or VPC in MASTER/BACKUP roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundantPair {
    pub primary: RouterId,
    pub secondary: RouterId,
}

impl RedundantPair {
    pub fn routers(&self) -> [RouterId; 2] {
        [self.primary, self.secondary]
    }

    pub fn contains(&self, router: RouterId) -> bool {
        self.primary == router || self.secondary == router
    }
}

/// Interface change applied to every router serving a network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum NicChange {
    Associate {
        address: Ipv4Addr,
        subnet: PublicSubnet,
        #[serde(default)]
        source_nat: bool,
    },
    Disassociate {
        address: Ipv4Addr,
    },
    Rebuild,
}

impl NicChange {
    pub fn name(&self) -> &'static str {
        match self {
            NicChange::Associate { .. } => "associate",
            NicChange::Disassociate { .. } => "disassociate",
            NicChange::Rebuild => "rebuild",
        }
    }
}

/// Result of a change on one router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RouterOutcome {
    Changed { change: InterfaceChange },
    Rebuilt { interfaces: Vec<InterfaceRecord> },
}

/// Convergence of a single router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterConvergence {
    pub router: RouterId,
    pub state: RedundancyState,
    /// False when the router is in FAULT and was not checked
    pub checked: bool,
    /// Public devices whose link state disagrees with the role
    pub mismatched: Vec<String>,
}

impl RouterConvergence {
    fn expected_link(&self) -> LinkState {
        match self.state {
            RedundancyState::Master => LinkState::Up,
            _ => LinkState::Down,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub routers: Vec<RouterConvergence>,
}

impl ConvergenceReport {
    pub fn is_converged(&self) -> bool {
        self.routers.iter().all(|r| r.mismatched.is_empty())
    }

    /// One `RedundancyState` error per router that has not converged
    pub fn mismatches(&self) -> Vec<RouterError> {
        self.routers
            .iter()
            .filter(|r| !r.mismatched.is_empty())
            .map(|r| RouterError::RedundancyState {
                router: r.router,
                state: r.state,
                expected: r.expected_link(),
                devices: r.mismatched.clone(),
            })
            .collect()
    }
}

pub struct RouterSyncCoordinator {
    controller: Arc<NetworkInterfaceController>,
    metrics: Arc<MetricsCollector>,
    pairs: RwLock<HashMap<RouterId, RedundantPair>>,
}

impl RouterSyncCoordinator {
    pub fn new(controller: Arc<NetworkInterfaceController>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            controller,
            metrics,
            pairs: RwLock::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &Arc<NetworkInterfaceController> {
        &self.controller
    }

    pub async fn register_pair(&self, pair: RedundantPair) {
        let mut pairs = self.pairs.write().await;
        pairs.insert(pair.primary, pair);
        pairs.insert(pair.secondary, pair);
        info!(
            "Registered redundant pair {} / {}",
            pair.primary, pair.secondary
        );
    }

    pub async fn pair_of(&self, router: RouterId) -> Option<RedundantPair> {
        self.pairs.read().await.get(&router).copied()
    }

    /// Apply `change` to `router`, or to both routers when it is part of a pair
    pub async fn apply(
        &self,
        router: RouterId,
        change: &NicChange,
    ) -> Result<Vec<(RouterId, RouterOutcome)>> {
        match self.pair_of(router).await {
            Some(pair) => self.propagate(&pair, change).await,
            None => Ok(vec![(router, self.apply_one(router, change).await?)]),
        }
    }

    /// Apply `change` to both routers of a pair
    ///
    /// Both routers are always attempted; a failure on one does not undo the
    /// other. The first error is returned after both have finished.
    pub async fn propagate(
        &self,
        pair: &RedundantPair,
        change: &NicChange,
    ) -> Result<Vec<(RouterId, RouterOutcome)>> {
        let results = join_all(
            pair.routers()
                .into_iter()
                .map(|router| async move { (router, self.apply_one(router, change).await) }),
        )
        .await;

        let mut outcomes = Vec::new();
        let mut first_error = None;
        for (router, result) in results {
            match result {
                Ok(outcome) => outcomes.push((router, outcome)),
                Err(e) => {
                    warn!("Router {} {} failed: {}", router, change.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(
                    "Propagated {} to {} / {}",
                    change.name(),
                    pair.primary,
                    pair.secondary
                );
                Ok(outcomes)
            }
        }
    }

    async fn apply_one(&self, router: RouterId, change: &NicChange) -> Result<RouterOutcome> {
        match change {
            NicChange::Associate {
                address,
                subnet,
                source_nat,
            } => {
                let change = self
                    .controller
                    .on_address_associated(router, *address, subnet, *source_nat)
                    .await?;
                Ok(RouterOutcome::Changed { change })
            }
            NicChange::Disassociate { address } => {
                let change = self
                    .controller
                    .on_address_disassociated(router, *address)
                    .await?;
                Ok(RouterOutcome::Changed { change })
            }
            NicChange::Rebuild => {
                let interfaces = self.controller.rebuild(router).await?;
                Ok(RouterOutcome::Rebuilt { interfaces })
            }
        }
    }

    /// Compare each router's public link states against its redundancy role
    ///
    /// A router in FAULT is skipped. Mismatches are logged and counted but
    /// never undo interface or address state.
    pub async fn verify_convergence(&self, pair: &RedundantPair) -> Result<ConvergenceReport> {
        let mut routers = Vec::new();
        for router in pair.routers() {
            routers.push(self.check_router(router).await?);
        }
        let report = ConvergenceReport { routers };

        for mismatch in report.mismatches() {
            self.metrics.redundancy_mismatches_total.inc();
            warn!("{}", mismatch);
        }
        Ok(report)
    }

    /// Like `verify_convergence`, but a mismatch is returned as an error
    pub async fn ensure_converged(&self, pair: &RedundantPair) -> Result<ConvergenceReport> {
        let report = self.verify_convergence(pair).await?;
        match report.mismatches().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn check_router(&self, router: RouterId) -> Result<RouterConvergence> {
        let agent = self.controller.agent();
        let policy = self.controller.policy();
        let state = policy
            .call(router, "redundancy_state", || agent.redundancy_state(router))
            .await?;

        if state == RedundancyState::Fault {
            debug!("Router {} in FAULT; convergence check skipped", router);
            return Ok(RouterConvergence {
                router,
                state,
                checked: false,
                mismatched: Vec::new(),
            });
        }

        let links = policy
            .call(router, "link_states", || agent.link_states(router))
            .await?;
        let expected = match state {
            RedundancyState::Master => LinkState::Up,
            _ => LinkState::Down,
        };
        let mismatched = self
            .controller
            .interfaces(router)
            .await?
            .iter()
            .filter(|i| i.role.is_public())
            .map(|i| i.device())
            .filter(|device| links.get(device).copied().unwrap_or(LinkState::Down) != expected)
            .collect();

        Ok(RouterConvergence {
            router,
            state,
            checked: true,
            mismatched,
        })
    }
}
