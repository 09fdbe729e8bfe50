//! Health check endpoint for service monitoring.

use crate::services::rotation_service::SharedRotationService;
use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service status
    pub status: String,

    /// Armed rotation timers
    pub scheduled_jobs: usize,

    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health check handler.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "scheduled_jobs": 12,
///   "timestamp": "2025-12-21T19:00:00Z"
/// }
/// ```
pub async fn health_check(State(service): State<SharedRotationService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        scheduled_jobs: service.scheduled_jobs(),
        timestamp: Utc::now(),
    })
}
