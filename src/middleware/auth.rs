//! Principal resolution middleware.
//!
//! This middleware intercepts every owner-scoped request to:
//! 1. Verify an `Authorization: Bearer <api key>` header through the rotation service, or
//! 2. Fall back to the `X-User-Id` header set by the upstream gateway
//! 3. Inject the resolved owner into the request
//! 4. Reject requests with no principal with HTTP 401

use crate::{error::AppError, services::rotation_service::SharedRotationService};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Header carrying the principal id authenticated upstream.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Principal attached to authenticated requests.
///
/// Handlers extract it with `Extension<OwnerContext>` and pass `owner_id`
/// to every owner-scoped service call.
#[derive(Debug, Clone)]
pub struct OwnerContext {
    pub owner_id: String,
}

/// Resolve the calling principal.
///
/// # Flow
///
/// 1. If `Authorization: Bearer <key>` is present, verify the key; a valid key
///    with an owner yields that owner, anything else is rejected
/// 2. Otherwise read a non-empty `X-User-Id` header
/// 3. Inject `OwnerContext` and call the next handler
///
/// # Returns
///
/// - `Ok(Response)` if a principal was resolved
/// - `Err(AppError::Unauthorized)` otherwise (returns 401)
pub async fn auth_middleware(
    State(service): State<SharedRotationService>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let bearer = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.strip_prefix("Bearer ").map(str::to_owned));

    let owner_id = match bearer {
        Some(Some(api_key)) => {
            let outcome = service.verify(api_key.trim()).await;
            outcome
                .owner_id
                .filter(|_| outcome.valid)
                .ok_or(AppError::Unauthorized)?
        }
        Some(None) => return Err(AppError::Unauthorized),
        None => request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or(AppError::Unauthorized)?,
    };

    request.extensions_mut().insert(OwnerContext { owner_id });

    Ok(next.run(request).await)
}
