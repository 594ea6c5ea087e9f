// SPDX-License-Identifier: GPL-2.0-only
//! Guest metadata endpoint.
//!
//! A guest trades the one-time token from its boot config for its
//! application environment. Only hashes of tokens are stored, a token
//! is honoured only from the guest address of the VM it was minted for,
//! and it is spent on first successful use.

use crate::store::traits::StateStore;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use data_encoding::BASE32_NOPAD;
use ipnetwork::Ipv4Network;
use keel_protocol::{MetadataResponse, METADATA_PATH};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

/// 32 random bytes, lowercase base32.
pub fn mint_token() -> String {
    let bytes: [u8; 32] = rand::random();
    BASE32_NOPAD.encode(&bytes).to_lowercase()
}

/// SHA-256 hex digest, the form tokens are stored in.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub struct MetadataState {
    pub store: Arc<dyn StateStore + Send + Sync>,
    /// Only peers inside the node's VM range may ask.
    pub node_range: Ipv4Network,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    MissingToken,
    Forbidden,
    Internal(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::MissingToken => write!(f, "token query parameter is required"),
            MetadataError::Forbidden => write!(f, "forbidden"),
            MetadataError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl IntoResponse for MetadataError {
    fn into_response(self) -> Response {
        let status = match self {
            MetadataError::MissingToken => StatusCode::BAD_REQUEST,
            MetadataError::Forbidden => StatusCode::FORBIDDEN,
            MetadataError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn peer_v4(peer: IpAddr) -> Option<Ipv4Addr> {
    match peer {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

async fn metadata(
    State(state): State<Arc<MetadataState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<MetadataResponse>, MetadataError> {
    let Some(peer_ip) = peer_v4(peer.ip()).filter(|ip| state.node_range.contains(*ip)) else {
        warn!(peer = %peer, "metadata request from outside the vm range");
        return Err(MetadataError::Forbidden);
    };
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or(MetadataError::MissingToken)?;

    let vm_id = state
        .store
        .redeem_metadata_token(&hash_token(&token), &peer_ip.to_string())
        .map_err(|e| MetadataError::Internal(e.to_string()))?
        .ok_or_else(|| {
            warn!(peer = %peer, "unknown, spent or foreign metadata token");
            MetadataError::Forbidden
        })?;

    let env = state
        .store
        .vm_env(vm_id)
        .map_err(|e| MetadataError::Internal(e.to_string()))?
        .ok_or(MetadataError::Forbidden)?;

    info!(vm_id = %vm_id, peer = %peer, vars = env.len(), "metadata served");
    Ok(Json(MetadataResponse { env }))
}

/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: Arc<MetadataState>) -> Router {
    Router::new()
        .route(METADATA_PATH, get(metadata))
        .with_state(state)
}
