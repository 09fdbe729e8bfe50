//! API key HTTP handlers.
//!
//! This module implements the key management endpoints:
//! - POST /apikey/buat - Issue a new key
//! - GET /apikey/saya - List the caller's keys
//! - PUT /apikey/{keyId}/update - Rotate a key now
//! - PUT /apikey/{keyId}/jadwal - Change a key's rotation period
//! - PUT /apikey/{keyId}/nonaktif - Deactivate a key
//! - POST /apikey/verifikasi - Check a presented key

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::auth::OwnerContext,
    models::api_key::{
        ApiKeySummary, IssueKeyRequest, IssuedKeyResponse, MessageResponse, RescheduleRequest,
        RotatedKeyResponse, ScheduleInfo, VerifyOutcome, VerifyRequest,
    },
    services::rotation_service::{SharedRotationService, validate_period},
};

/// Issue a new key for the caller.
///
/// # Request Body
///
/// ```json
/// {
///   "nama": "mobile app",
///   "hariUpdate": 7
/// }
/// ```
///
/// # Response
///
/// - **Success (201 Created)**: the key, shown this one time
/// - **Error (400)**: `hariUpdate` outside 1..=365
/// - **Error (401)**: no principal
///
/// ```json
/// {
///   "id": "550e8400-e29b-41d4-a716-446655440000",
///   "apiKey": "sk_9f86d081884c7d65...",
///   "kadaluarsa": "2025-12-27T10:00:00Z",
///   "hariUpdate": 7
/// }
/// ```
pub async fn issue_key(
    State(service): State<SharedRotationService>,
    Extension(owner): Extension<OwnerContext>,
    Json(request): Json<IssueKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_period(request.hari_update)?;

    let issued = service
        .issue(&owner.owner_id, request.nama, request.hari_update)
        .await?;

    Ok((StatusCode::CREATED, Json(IssuedKeyResponse::from(issued))))
}

/// List the caller's keys, newest first. Secrets are never included.
pub async fn list_keys(
    State(service): State<SharedRotationService>,
    Extension(owner): Extension<OwnerContext>,
) -> Json<Vec<ApiKeySummary>> {
    Json(service.list_for_owner(&owner.owner_id).await)
}

/// Rotate one of the caller's keys immediately.
///
/// # Response (200)
///
/// ```json
/// { "keyBaru": "sk_..." }
/// ```
///
/// Returns 404 if the key does not exist, is inactive, or belongs to someone else.
pub async fn rotate_key(
    State(service): State<SharedRotationService>,
    Extension(owner): Extension<OwnerContext>,
    Path(key_id): Path<Uuid>,
) -> Result<Json<RotatedKeyResponse>, AppError> {
    let key_baru = service.rotate_manual(key_id, &owner.owner_id).await?;

    Ok(Json(RotatedKeyResponse { key_baru }))
}

/// Change the rotation period of one of the caller's keys.
///
/// # Request Body
///
/// ```json
/// { "hariBaru": 30 }
/// ```
///
/// The next rotation is counted from now, not from the old schedule.
pub async fn reschedule_key(
    State(service): State<SharedRotationService>,
    Extension(owner): Extension<OwnerContext>,
    Path(key_id): Path<Uuid>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<ScheduleInfo>, AppError> {
    validate_period(request.hari_baru)?;

    let info = service
        .reschedule(key_id, &owner.owner_id, request.hari_baru)
        .await?;

    Ok(Json(info))
}

/// Deactivate one of the caller's keys. The record is kept.
pub async fn deactivate_key(
    State(service): State<SharedRotationService>,
    Extension(owner): Extension<OwnerContext>,
    Path(key_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    service.deactivate(key_id, &owner.owner_id).await?;

    Ok(Json(MessageResponse {
        pesan: "API key dinonaktifkan".to_string(),
    }))
}

/// Check whether a presented key is currently valid.
///
/// Always 200; an unknown, superseded or inactive key yields `{"valid": false}`.
pub async fn verify_key(
    State(service): State<SharedRotationService>,
    Json(request): Json<VerifyRequest>,
) -> Json<VerifyOutcome> {
    Json(service.verify(request.api_key.trim()).await)
}
