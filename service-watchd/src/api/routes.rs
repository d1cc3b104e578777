use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::fullname;
use shared::types::{ErrorMessage, ServiceRecord};
use crate::api::hash::compute_hash;
use crate::browser::Browser;
use crate::connection::ConnectionStatus;
use crate::discovery::Discovery;
use crate::error::DiscoveryError;

#[derive(Clone)]
pub struct AppState {
    pub discovery: Discovery,
    pub browsers: Arc<Vec<Browser>>,
}

impl AppState {
    /// Every visible record across browsers, sorted by full name
    fn all_services(&self) -> Vec<ServiceRecord> {
        let mut services: Vec<ServiceRecord> =
            self.browsers.iter().flat_map(|b| b.services()).collect();
        services.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        services
    }

    fn owner_of(&self, full_name: &str) -> Option<&Browser> {
        self.browsers
            .iter()
            .find(|b| b.services().iter().any(|s| s.full_name == full_name))
    }
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

#[derive(Serialize)]
pub struct BrowserSummary {
    pub service_type: String,
    pub domain: String,
    pub browsing: bool,
    pub failed: bool,
    pub services: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    /// `None` until the first browser founds the connection
    pub connection: Option<ConnectionStatus>,
    pub browsers: Vec<BrowserSummary>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:full_name", get(get_service))
        .route("/v1/services/:full_name/reconfirm", post(reconfirm_service))
        .route("/v1/refresh", post(refresh))
        .route("/v1/errors", get(get_errors))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

fn status_for(err: &DiscoveryError) -> StatusCode {
    match err {
        DiscoveryError::UnknownService(_) => StatusCode::NOT_FOUND,
        DiscoveryError::ConnectionStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Json<Vec<ServiceRecord>> {
    let mut services = state.all_services();
    if let Some(service_type) = params.service_type {
        let service_type = fullname::normalize_type(&service_type);
        services.retain(|s| s.service_type == service_type);
    }
    Json(services)
}

async fn get_hash(State(state): State<AppState>) -> String {
    compute_hash(&state.all_services())
}

async fn get_service(
    State(state): State<AppState>,
    Path(full_name): Path<String>,
) -> Result<Json<ServiceRecord>, StatusCode> {
    state
        .all_services()
        .into_iter()
        .find(|s| s.full_name == full_name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn reconfirm_service(
    State(state): State<AppState>,
    Path(full_name): Path<String>,
) -> StatusCode {
    let Some(browser) = state.owner_of(&full_name) else {
        return StatusCode::NOT_FOUND;
    };
    match browser.reconfirm_service(&full_name) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::warn!("Failed to reconfirm {}: {}", full_name, e);
            status_for(&e)
        }
    }
}

async fn refresh(State(state): State<AppState>) -> StatusCode {
    let mut result = StatusCode::ACCEPTED;
    for browser in state.browsers.iter() {
        if let Err(e) = browser.trigger_refresh() {
            tracing::warn!(service_type = browser.service_type(), "Failed to trigger refresh: {}", e);
            result = status_for(&e);
        }
    }
    result
}

async fn get_errors(State(state): State<AppState>) -> Json<Vec<ErrorMessage>> {
    Json(state.discovery.error_history())
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let browsers = state
        .browsers
        .iter()
        .map(|b| BrowserSummary {
            service_type: b.service_type().to_string(),
            domain: b.domain().to_string(),
            browsing: b.is_browsing(),
            failed: b.has_failed(),
            services: b.services().len(),
        })
        .collect();

    Json(StatusResponse {
        connection: state.discovery.status(),
        browsers,
    })
}
