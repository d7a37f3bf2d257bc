//! JSON management API over IP ranges, addresses and routers

use crate::state::AppState;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use ipam_api::{
    AccountId, AddressPurpose, CreateRangeRequest, DomainEvent, NetworkId, Ownership, PoolFilter,
    PoolId, RouterId, ZoneId,
};
use ipam_core::{Allocation, CoreError, ErrorKind, RuleKind, RuleRef};
use ipam_router::{GuestTier, NicChange, RouterError, RouterOutcome};
use ipnetwork::Ipv4Network;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let kind = match self {
            ApiError::Core(e) => e.kind(),
            ApiError::Router(RouterError::RouterSyncTimeout { .. }) => {
                return StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Router(e) => e.kind(),
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::NotFound(_) => ErrorKind::NotFound,
        };
        match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Capacity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Coordination => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireRequest {
    network: NetworkId,
    account: AccountId,
    #[serde(default)]
    address: Option<Ipv4Addr>,
    /// Router to bind the address on once acquired
    #[serde(default)]
    router: Option<RouterId>,
    #[serde(default)]
    source_nat: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcquireResponse {
    allocation: Allocation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    interfaces: Vec<(RouterId, RouterOutcome)>,
    /// Router failure after a successful acquisition; the address stays allocated
    #[serde(skip_serializing_if = "Option::is_none")]
    router_error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurposeRequest {
    purpose: AddressPurpose,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RuleRequest {
    kind: RuleKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequest {
    control: Ipv4Network,
    #[serde(default)]
    tiers: Vec<GuestTier>,
}

#[derive(Debug, Deserialize)]
struct PrivateGatewayRequest {
    subnet: Ipv4Network,
    address: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociateRequest {
    address: Ipv4Addr,
    #[serde(default)]
    source_nat: bool,
}

#[derive(Debug, Deserialize)]
struct DisassociateRequest {
    address: Ipv4Addr,
}

/// hyper entry point
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = req.into_body().collect().await?.to_bytes();

    debug!("{} {}", method, path);
    Ok(route(&state, &method, &path, query.as_deref(), body).await)
}

/// Dispatch one request; every failure becomes a JSON error response
pub async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match dispatch(state, method, path, query, body).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                warn!("{} {} failed: {}", method, path, e);
            } else {
                debug!("{} {} rejected: {}", method, path, e);
            }
            json(
                status,
                &ErrorBody {
                    error: e.to_string(),
                },
            )
        }
    }
}

async fn dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
) -> ApiResult {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["healthz"]) => Ok(text(StatusCode::OK, "OK\n")),
        (&Method::GET, ["metrics"]) => {
            let metrics = state
                .metrics
                .gather()
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let mut response = text(StatusCode::OK, &metrics);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }

        (&Method::GET, ["v1", "ranges"]) => {
            let filter = pool_filter(query)?;
            Ok(json(StatusCode::OK, &state.registry.list(&filter).await))
        }
        (&Method::POST, ["v1", "ranges"]) => {
            let req: CreateRangeRequest = parse_body(&body)?;
            let view = state.registry.create_range(req).await?;
            Ok(json(StatusCode::CREATED, &view))
        }
        (&Method::GET, ["v1", "ranges", id]) => {
            let view = state.registry.get(parse_id(id)?).await?;
            Ok(json(StatusCode::OK, &view))
        }
        (&Method::POST, ["v1", "ranges", id, "dedicate"]) => {
            let owner: Ownership = parse_body(&body)?;
            let view = state
                .registry
                .dedicate(parse_id(id)?, owner.account, owner.domain)
                .await?;
            Ok(json(StatusCode::OK, &view))
        }
        (&Method::POST, ["v1", "ranges", id, "release"]) => {
            let view = state.registry.release(parse_id(id)?).await?;
            Ok(json(StatusCode::OK, &view))
        }
        (&Method::DELETE, ["v1", "ranges", id]) => {
            state.registry.delete(parse_id(id)?).await?;
            Ok(empty(StatusCode::NO_CONTENT))
        }

        (&Method::POST, ["v1", "addresses"]) => acquire(state, parse_body(&body)?).await,
        (&Method::GET, ["v1", "addresses", ip]) => {
            let record = state.allocator.lookup(parse_id(ip)?).await?;
            Ok(json(StatusCode::OK, &record))
        }
        (&Method::DELETE, ["v1", "addresses", ip]) => {
            let router = query_param(query, "router")
                .map(|r| parse_id::<RouterId>(&r))
                .transpose()?;
            release(state, parse_id(ip)?, router).await
        }
        (&Method::POST, ["v1", "addresses", ip, "purpose"]) => {
            let req: PurposeRequest = parse_body(&body)?;
            let record = state
                .allocator
                .set_purpose(parse_id(ip)?, req.purpose, req.enabled)
                .await?;
            Ok(json(StatusCode::OK, &record))
        }
        (&Method::POST, ["v1", "addresses", ip, "reserve"]) => {
            state.allocator.reserve(parse_id(ip)?).await?;
            Ok(empty(StatusCode::NO_CONTENT))
        }
        (&Method::POST, ["v1", "addresses", ip, "unreserve"]) => {
            state.allocator.unreserve(parse_id(ip)?).await?;
            Ok(empty(StatusCode::NO_CONTENT))
        }
        (&Method::POST, ["v1", "addresses", ip, "rules"]) => {
            let req: RuleRequest = parse_body(&body)?;
            let rule = RuleRef::new(req.kind);
            state.rules.register(parse_id(ip)?, rule).await;
            Ok(json(StatusCode::CREATED, &rule))
        }
        (&Method::DELETE, ["v1", "addresses", ip, "rules"]) => {
            let rule: RuleRef = parse_body(&body)?;
            if !state.rules.unregister(parse_id(ip)?, rule).await {
                return Err(ApiError::NotFound(format!("rule {} not registered", rule.id)));
            }
            Ok(empty(StatusCode::NO_CONTENT))
        }

        (&Method::POST, ["v1", "events"]) => {
            let event: DomainEvent = parse_body(&body)?;
            state.events.publish(&event).await?;
            Ok(empty(StatusCode::ACCEPTED))
        }

        (&Method::POST, ["v1", "routers", id, "provision"]) => {
            let req: ProvisionRequest = parse_body(&body)?;
            let interfaces = state
                .coordinator
                .controller()
                .provision(parse_id(id)?, req.control, &req.tiers)
                .await?;
            Ok(json(StatusCode::CREATED, &interfaces))
        }
        (&Method::POST, ["v1", "routers", id, "tiers"]) => {
            let tier: GuestTier = parse_body(&body)?;
            let iface = state
                .coordinator
                .controller()
                .add_guest_tier(parse_id(id)?, tier)
                .await?;
            Ok(json(StatusCode::OK, &iface))
        }
        (&Method::POST, ["v1", "routers", id, "private-gateway"]) => {
            let req: PrivateGatewayRequest = parse_body(&body)?;
            let iface = state
                .coordinator
                .controller()
                .add_private_gateway(parse_id(id)?, req.subnet, req.address)
                .await?;
            Ok(json(StatusCode::OK, &iface))
        }
        (&Method::POST, ["v1", "routers", id, "associate"]) => {
            let req: AssociateRequest = parse_body(&body)?;
            let subnet = state.allocator.subnet_of(req.address).await?;
            let change = NicChange::Associate {
                address: req.address,
                subnet,
                source_nat: req.source_nat,
            };
            let outcomes = state.coordinator.apply(parse_id(id)?, &change).await?;
            Ok(json(StatusCode::OK, &outcomes))
        }
        (&Method::POST, ["v1", "routers", id, "disassociate"]) => {
            let req: DisassociateRequest = parse_body(&body)?;
            let change = NicChange::Disassociate {
                address: req.address,
            };
            let outcomes = state.coordinator.apply(parse_id(id)?, &change).await?;
            Ok(json(StatusCode::OK, &outcomes))
        }
        (&Method::POST, ["v1", "routers", id, "rebuild"]) => {
            let outcomes = state
                .coordinator
                .apply(parse_id(id)?, &NicChange::Rebuild)
                .await?;
            Ok(json(StatusCode::OK, &outcomes))
        }
        (&Method::GET, ["v1", "routers", id, "interfaces"]) => {
            let interfaces = state
                .coordinator
                .controller()
                .interfaces(parse_id(id)?)
                .await?;
            Ok(json(StatusCode::OK, &interfaces))
        }
        (&Method::GET, ["v1", "routers", id, "convergence"]) => {
            let router: RouterId = parse_id(id)?;
            let pair = state.coordinator.pair_of(router).await.ok_or_else(|| {
                ApiError::NotFound(format!("router {} is not part of a redundant pair", router))
            })?;
            let report = state.coordinator.verify_convergence(&pair).await?;
            Ok(json(StatusCode::OK, &report))
        }

        _ => Err(ApiError::NotFound(format!("no route for {} {}", method, path))),
    }
}

async fn acquire(state: &AppState, req: AcquireRequest) -> ApiResult {
    let allocation = state
        .allocator
        .acquire(req.network, req.account, req.address)
        .await?;

    let mut response = AcquireResponse {
        allocation,
        interfaces: Vec::new(),
        router_error: None,
    };
    if let Some(router) = req.router {
        let address = response.allocation.address.address;
        let change = NicChange::Associate {
            address,
            subnet: response.allocation.subnet.clone(),
            source_nat: req.source_nat,
        };
        // Router failures leave the allocation in place
        match state.coordinator.apply(router, &change).await {
            Ok(outcomes) => response.interfaces = outcomes,
            Err(e) => {
                warn!(
                    "Acquired {} but router {} was not updated: {}",
                    address, router, e
                );
                response.router_error = Some(e.to_string());
            }
        }
    }
    Ok(json(StatusCode::CREATED, &response))
}

async fn release(state: &AppState, address: Ipv4Addr, router: Option<RouterId>) -> ApiResult {
    if let Some(router) = router {
        match state
            .coordinator
            .apply(router, &NicChange::Disassociate { address })
            .await
        {
            Ok(_) | Err(RouterError::AddressNotBound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    match state.allocator.release(address).await? {
        Some(previous) => Ok(json(StatusCode::OK, &previous)),
        None => Ok(empty(StatusCode::NO_CONTENT)),
    }
}

fn pool_filter(query: Option<&str>) -> Result<PoolFilter, ApiError> {
    Ok(PoolFilter {
        id: query_param(query, "id")
            .map(|v| parse_id::<PoolId>(&v))
            .transpose()?,
        zone: query_param(query, "zone")
            .map(|v| parse_id::<ZoneId>(&v))
            .transpose()?,
        account: query_param(query, "account")
            .map(|v| parse_id::<AccountId>(&v))
            .transpose()?,
    })
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn parse_id<T>(value: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid value {:?}: {}", value, e)))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {}", e)))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("serialization failed: {}\n", e),
        ),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    text(status, "")
}
