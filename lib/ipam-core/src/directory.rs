//! Read-only views of the account, limit and network services

use crate::events::EventHandler;
use crate::Result;
use async_trait::async_trait;
use ipam_api::{AccountId, DomainEvent, DomainId, NetworkId, VpcId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: AccountId,
    pub domain: DomainId,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub zone: ZoneId,
    /// Set when the network is a VPC tier
    #[serde(default)]
    pub vpc: Option<VpcId>,
    pub account: AccountId,
}

/// Account/domain service
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, id: AccountId) -> Option<AccountInfo>;
}

/// Resource-limit service
#[async_trait]
pub trait ResourceLimits: Send + Sync {
    /// Maximum public IPs the account may hold; `None` means unlimited
    async fn max_public_ips(&self, account: AccountId) -> Option<u64>;
}

/// Network/VPC service
#[async_trait]
pub trait NetworkDirectory: Send + Sync {
    async fn network(&self, id: NetworkId) -> Option<NetworkInfo>;
}

/// In-process directory serving all three lookups from seeded tables
#[derive(Default)]
pub struct StaticDirectory {
    accounts: RwLock<HashMap<AccountId, AccountInfo>>,
    limits: RwLock<HashMap<AccountId, u64>>,
    networks: RwLock<HashMap<NetworkId, NetworkInfo>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, info: AccountInfo) {
        debug!("Registered account {} ({})", info.name, info.id);
        self.accounts.write().await.insert(info.id, info);
    }

    pub async fn remove_account(&self, id: AccountId) -> Option<AccountInfo> {
        self.limits.write().await.remove(&id);
        self.accounts.write().await.remove(&id)
    }

    pub async fn set_limit(&self, account: AccountId, max_public_ips: u64) {
        self.limits.write().await.insert(account, max_public_ips);
    }

    pub async fn add_network(&self, info: NetworkInfo) {
        self.networks.write().await.insert(info.id, info);
    }

    pub async fn remove_network(&self, id: NetworkId) -> Option<NetworkInfo> {
        self.networks.write().await.remove(&id)
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn account(&self, id: AccountId) -> Option<AccountInfo> {
        self.accounts.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl ResourceLimits for StaticDirectory {
    async fn max_public_ips(&self, account: AccountId) -> Option<u64> {
        self.limits.read().await.get(&account).copied()
    }
}

#[async_trait]
impl NetworkDirectory for StaticDirectory {
    async fn network(&self, id: NetworkId) -> Option<NetworkInfo> {
        self.networks.read().await.get(&id).copied()
    }
}

/// Deleted accounts and networks stop resolving once every other
/// subscriber has handled the event
#[async_trait]
impl EventHandler for StaticDirectory {
    fn name(&self) -> &'static str {
        "StaticDirectory"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::AccountDeleted { account } => {
                if let Some(info) = self.remove_account(*account).await {
                    debug!("Forgot account {} ({})", info.name, info.id);
                }
            }
            DomainEvent::NetworkDeleted { network } => {
                if self.remove_network(*network).await.is_some() {
                    debug!("Forgot network {}", network);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_static_directory_lookups() {
        let dir = StaticDirectory::new();
        let account = AccountInfo {
            id: AccountId::new(),
            domain: DomainId::new(),
            name: "acct1".to_string(),
        };
        dir.add_account(account.clone()).await;
        dir.set_limit(account.id, 4).await;

        assert_eq!(dir.account(account.id).await, Some(account.clone()));
        assert_eq!(dir.max_public_ips(account.id).await, Some(4));

        dir.remove_account(account.id).await;
        assert!(dir.account(account.id).await.is_none());
        assert!(dir.max_public_ips(account.id).await.is_none());
    }

    #[tokio::test]
    async fn test_deleted_entries_stop_resolving() {
        let dir = Arc::new(StaticDirectory::new());
        let account = AccountId::new();
        let network = NetworkInfo {
            id: NetworkId::new(),
            zone: ZoneId::new(),
            vpc: None,
            account,
        };
        dir.add_account(AccountInfo {
            id: account,
            domain: DomainId::new(),
            name: "acct1".to_string(),
        })
        .await;
        dir.add_network(network).await;

        let bus = EventBus::new();
        bus.subscribe(dir.clone()).await;
        bus.publish(&DomainEvent::NetworkDeleted { network: network.id })
            .await
            .unwrap();
        assert!(dir.network(network.id).await.is_none());
        assert!(dir.account(account).await.is_some());

        bus.publish(&DomainEvent::AccountDeleted { account })
            .await
            .unwrap();
        assert!(dir.account(account).await.is_none());
        // Repeated deletes are harmless
        bus.publish(&DomainEvent::AccountDeleted { account })
            .await
            .unwrap();
    }
}
