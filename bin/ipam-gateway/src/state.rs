//! Service wiring shared by every request

use crate::config::{AgentConfig, GatewayConfig};
use anyhow::Result;
use ipam_core::{
    AccountInfo, AddressAllocator, EventBus, IpRangeRegistry, JsonFileStore, MemoryStore,
    MetricsCollector, RegistryDeps, RuleLedger, StaticDirectory, Store,
};
use ipam_router::{
    ControllerDeps, HttpRouterAgent, NetworkInterfaceController, RouterAgent,
    RouterSyncCoordinator, SimulatedRouter,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct AppState {
    pub registry: Arc<IpRangeRegistry>,
    pub allocator: Arc<AddressAllocator>,
    pub coordinator: Arc<RouterSyncCoordinator>,
    pub rules: Arc<RuleLedger>,
    pub events: EventBus,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Build every component, seed the directory and restore persisted state
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.state_dir {
            Some(dir) => {
                info!("Persisting state under {}", dir.display());
                Arc::new(JsonFileStore::open(dir).await?)
            }
            None => {
                info!("No state_dir configured; state is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let directory = Arc::new(StaticDirectory::new());
        for seed in &config.accounts {
            directory
                .add_account(AccountInfo {
                    id: seed.id,
                    domain: seed.domain,
                    name: seed.name.clone(),
                })
                .await;
            if let Some(limit) = seed.max_public_ips {
                directory.set_limit(seed.id, limit).await;
            }
        }
        for network in &config.networks {
            directory.add_network(*network).await;
        }
        info!(
            "Seeded {} accounts and {} networks",
            config.accounts.len(),
            config.networks.len()
        );

        let metrics = Arc::new(MetricsCollector::new()?);
        let rules = Arc::new(RuleLedger::new());

        let registry = Arc::new(IpRangeRegistry::new(RegistryDeps {
            accounts: directory.clone(),
            limits: directory.clone(),
            rules: rules.clone(),
            store: store.clone(),
            metrics: metrics.clone(),
        }));
        registry.restore().await?;

        let allocator = Arc::new(AddressAllocator::new(
            registry.clone(),
            directory.clone(),
            rules.clone(),
        ));

        let policy = config.router.call_policy();
        let agent: Arc<dyn RouterAgent> = match &config.router.agent {
            AgentConfig::Simulated => {
                info!("Using simulated routers");
                Arc::new(SimulatedRouter::new())
            }
            AgentConfig::Http { endpoints } => {
                let agent = HttpRouterAgent::new(Duration::from_secs(config.router.timeout_secs));
                for (router, url) in endpoints {
                    agent.register(*router, url.clone()).await;
                }
                info!("Using HTTP router agent for {} routers", endpoints.len());
                Arc::new(agent)
            }
        };

        let controller = Arc::new(NetworkInterfaceController::new(ControllerDeps {
            agent,
            policy,
            store,
            metrics: metrics.clone(),
        }));
        controller.restore().await?;

        let coordinator = Arc::new(RouterSyncCoordinator::new(controller, metrics.clone()));
        for pair in &config.router.pairs {
            coordinator.register_pair(*pair).await;
        }

        let events = EventBus::new();
        events.subscribe(registry.clone()).await;
        events.subscribe(allocator.clone()).await;
        // Last, so the other handlers can still resolve what is being deleted
        events.subscribe(directory).await;
        info!("Event bus ready with {} handlers", events.handler_count().await);

        Ok(Self {
            registry,
            allocator,
            coordinator,
            rules,
            events,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountSeed;
    use ipam_api::{AccountId, CreateRangeRequest, DomainId, NetworkId, PoolFilter, ZoneId};
    use ipam_core::NetworkInfo;
    use ipam_router::GuestTier;

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let zone = ZoneId::new();
        let account = AccountSeed {
            id: AccountId::new(),
            domain: DomainId::new(),
            name: "acct1".to_string(),
            max_public_ips: None,
        };
        let network = NetworkInfo {
            id: NetworkId::new(),
            zone,
            vpc: None,
            account: account.id,
        };
        let config = GatewayConfig {
            state_dir: Some(dir.path().to_path_buf()),
            accounts: vec![account.clone()],
            networks: vec![network],
            ..GatewayConfig::default()
        };

        let router = ipam_api::RouterId::new();
        let acquired = {
            let state = AppState::from_config(&config).await.unwrap();
            state
                .registry
                .create_range(CreateRangeRequest {
                    zone,
                    vlan: "untagged".to_string(),
                    gateway: "172.16.5.1".to_string(),
                    netmask: "255.255.255.0".to_string(),
                    start_ip: "172.16.5.2".to_string(),
                    end_ip: "172.16.5.3".to_string(),
                    for_virtual_network: true,
                    owner: None,
                })
                .await
                .unwrap();
            state
                .coordinator
                .controller()
                .provision(
                    router,
                    "169.254.0.10/16".parse().unwrap(),
                    &[GuestTier {
                        network: network.id,
                        subnet: "10.1.1.0/24".parse().unwrap(),
                        gateway: "10.1.1.1".parse().unwrap(),
                    }],
                )
                .await
                .unwrap();
            state
                .allocator
                .acquire(network.id, account.id, None)
                .await
                .unwrap()
        };

        let state = AppState::from_config(&config).await.unwrap();
        assert_eq!(state.registry.list(&PoolFilter::default()).await.len(), 1);
        let record = state
            .allocator
            .lookup(acquired.address.address)
            .await
            .unwrap();
        assert_eq!(record.account, Some(account.id));
        let interfaces = state.coordinator.controller().interfaces(router).await.unwrap();
        assert_eq!(interfaces.len(), 2);
    }
}
