use ipam_api::{LinkState, RedundancyState, RouterId};
use ipam_core::{CoreError, ErrorKind};
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Router {router} did not acknowledge {change} within {timeout:?}")]
    RouterSyncTimeout {
        router: RouterId,
        change: String,
        timeout: Duration,
    },

    #[error("Router {router} rejected configuration: {reason}")]
    RouterRejected { router: RouterId, reason: String },

    #[error("Router {router} reports {state} but public interfaces {devices:?} are not {expected:?}")]
    RedundancyState {
        router: RouterId,
        state: RedundancyState,
        expected: LinkState,
        devices: Vec<String>,
    },

    #[error("Unknown router: {0}")]
    UnknownRouter(RouterId),

    #[error("Router {0} is already provisioned")]
    AlreadyProvisioned(RouterId),

    #[error("Address {address} is not bound to any interface on router {router}")]
    AddressNotBound { router: RouterId, address: Ipv4Addr },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::RouterSyncTimeout { .. }
            | RouterError::RouterRejected { .. }
            | RouterError::RedundancyState { .. } => ErrorKind::Coordination,
            RouterError::UnknownRouter(_) | RouterError::AddressNotBound { .. } => {
                ErrorKind::NotFound
            }
            RouterError::AlreadyProvisioned(_) => ErrorKind::Conflict,
            RouterError::Core(e) => e.kind(),
        }
    }
}

impl From<std::io::Error> for RouterError {
    fn from(e: std::io::Error) -> Self {
        RouterError::Core(CoreError::Storage(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let router = RouterId::new();
        let timeout = RouterError::RouterSyncTimeout {
            router,
            change: "associate".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::Coordination);
        assert_eq!(RouterError::UnknownRouter(router).kind(), ErrorKind::NotFound);
        assert_eq!(
            RouterError::from(CoreError::InvalidRange("bad".into())).kind(),
            ErrorKind::Validation
        );
    }
}
