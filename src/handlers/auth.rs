use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{bearer_token, AuthPrincipal};
use crate::error::ApiError;
use crate::session::{is_valid_email, normalize_email};
use crate::state::Gateway;

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserView {
    user_id: String,
    email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionView {
    user: UserView,
    session_token: String,
    expires_at: i64,
}

pub(crate) async fn signup(
    State(gw): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Json<SessionView>, ApiError> {
    let Ok(req) = serde_json::from_slice::<CredentialsRequest>(&body) else {
        return Err(ApiError::bad_request("invalid JSON"));
    };
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("invalid email"));
    }
    if req.password.trim().len() < 8 {
        return Err(ApiError::bad_request("password must be at least 8 characters"));
    }

    let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST).map_err(|_| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to hash password")
    })?;

    let user = match gw.create_user(&email, &password_hash).await {
        Ok(user) => user,
        Err(err) if err.to_string().contains("already_exists") => {
            return Err(ApiError::new(StatusCode::CONFLICT, "email already exists"));
        }
        Err(err) => {
            tracing::warn!(%err, "signup failed");
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
        }
    };

    let (token, session) = gw
        .create_session(&user)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(SessionView {
        user: UserView { user_id: user.user_id, email: user.email },
        session_token: token,
        expires_at: session.expires_at_ms,
    }))
}

pub(crate) async fn login(
    State(gw): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Json<SessionView>, ApiError> {
    let Ok(req) = serde_json::from_slice::<CredentialsRequest>(&body) else {
        return Err(ApiError::bad_request("invalid JSON"));
    };
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("invalid email"));
    }

    let user = match gw.get_user_by_email(&email).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(ApiError::unauthorized("invalid credentials")),
        Err(err) => {
            tracing::warn!(%err, "login lookup failed");
            return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "auth_store_unavailable"));
        }
    };
    if !bcrypt::verify(&req.password, &user.password_hash).unwrap_or(false) {
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    let (token, session) = gw
        .create_session(&user)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(SessionView {
        user: UserView { user_id: user.user_id, email: user.email },
        session_token: token,
        expires_at: session.expires_at_ms,
    }))
}

pub(crate) async fn me(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Response, ApiError> {
    if principal.0.is_empty() {
        return Err(ApiError::unauthorized("unauthorized"));
    }
    let user = match gw.get_user_by_id(&principal.0).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(ApiError::unauthorized("user_not_found")),
        Err(err) => {
            tracing::warn!(%err, "profile lookup failed");
            return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "profile_unavailable"));
        }
    };
    Ok(Json(json!({
        "user": UserView { user_id: user.user_id, email: user.email },
    }))
    .into_response())
}

pub(crate) async fn logout(
    State(gw): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(ApiError::unauthorized("Authorization Bearer token required"));
    };
    gw.delete_session(&token).await;
    Ok(Json(json!({ "status": "logged_out" })).into_response())
}
