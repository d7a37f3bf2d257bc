//! Active network rules bound to public addresses

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    LoadBalancer,
    StaticNat,
    PortForwarding,
    Firewall,
}

/// Reference to a rule owned by one of the rule services
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleRef {
    pub kind: RuleKind,
    pub id: Uuid,
}

impl RuleRef {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }
}

/// Answers whether an address still carries rules
#[async_trait]
pub trait RuleInspector: Send + Sync {
    async fn active_rules(&self, address: Ipv4Addr) -> Vec<RuleRef>;
}

/// Ledger the NAT, load balancer and firewall services register their rules in
#[derive(Default)]
pub struct RuleLedger {
    rules: RwLock<HashMap<Ipv4Addr, BTreeSet<RuleRef>>>,
}

impl RuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, address: Ipv4Addr, rule: RuleRef) {
        debug!("Registered {:?} rule {} on {}", rule.kind, rule.id, address);
        self.rules
            .write()
            .await
            .entry(address)
            .or_default()
            .insert(rule);
    }

    /// Returns false if the rule was not registered
    pub async fn unregister(&self, address: Ipv4Addr, rule: RuleRef) -> bool {
        let mut rules = self.rules.write().await;
        let Some(set) = rules.get_mut(&address) else {
            return false;
        };
        let removed = set.remove(&rule);
        if set.is_empty() {
            rules.remove(&address);
        }
        removed
    }

    /// Drop every rule on an address, returning how many were removed
    pub async fn clear(&self, address: Ipv4Addr) -> usize {
        self.rules
            .write()
            .await
            .remove(&address)
            .map_or(0, |set| set.len())
    }
}

#[async_trait]
impl RuleInspector for RuleLedger {
    async fn active_rules(&self, address: Ipv4Addr) -> Vec<RuleRef> {
        self.rules
            .read()
            .await
            .get(&address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
