use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::db::models::Channel;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: &'static str,
    pub version: String,
    pub timestamp: String,
    /// Channel name -> whether its adapter has provider credentials.
    pub channels: BTreeMap<&'static str, bool>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.dispatcher.registry();
    let channels = Channel::ALL
        .into_iter()
        .map(|c| {
            let enabled = registry.get(c).map(|a| a.is_enabled()).unwrap_or(false);
            (c.as_str(), enabled)
        })
        .collect();

    let response = HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        channels,
    };

    (StatusCode::OK, Json(response))
}
