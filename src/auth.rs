use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
struct SupabaseClaims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Resolve the authenticated user id for a request.
///
/// Order of precedence:
/// 1. `x-user-id` dev override (non-production only, behind a config flag)
/// 2. Local HS256 verification of the bearer JWT against SUPABASE_JWT_SECRET
/// 3. HTTP verification against the Supabase auth endpoint (slower fallback
///    when no JWT secret is configured)
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(user_id);
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;

    if let Some(secret) = state.config.supabase_jwt_secret.as_deref() {
        return verify_jwt_locally(&token, secret);
    }

    verify_token_via_http(state, &token).await
}

fn verify_jwt_locally(token: &str, secret: &str) -> AppResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["authenticated"]);

    let decoded = decode::<SupabaseClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::Unauthorized("Unauthorized: invalid token.".to_string()))?;

    let user_id = decoded.claims.sub.trim().to_string();
    if user_id.is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }
    Ok(user_id)
}

async fn verify_token_via_http(state: &AppState, token: &str) -> AppResult<String> {
    let (Some(base_url), Some(service_key)) = (
        state.config.supabase_url.as_deref(),
        state.config.supabase_service_role_key.as_deref(),
    ) else {
        return Err(AppError::Dependency(
            "Auth is not configured. Set SUPABASE_JWT_SECRET or SUPABASE_URL + SUPABASE_SERVICE_ROLE_KEY.".to_string(),
        ));
    };

    let url = format!("{}/auth/v1/user", base_url.trim_end_matches('/'));
    let response = state
        .http_client
        .get(url)
        .header("apikey", service_key)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|error| {
            tracing::error!(%error, "Supabase auth request failed");
            AppError::Dependency("Auth provider request failed.".to_string())
        })?;

    if !response.status().is_success() {
        return Err(AppError::Unauthorized(
            "Unauthorized: invalid token.".to_string(),
        ));
    }

    let body: Value = response.json().await.map_err(|_| {
        AppError::Dependency("Auth provider returned an unreadable response.".to_string())
    })?;

    body.get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: invalid token.".to_string()))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::header::AUTHORIZATION;
    use axum::http::HeaderMap;

    use super::{bearer_token, header_value};

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn rejects_missing_or_blank_tokens() {
        let headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn reads_trimmed_header_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", " user-1 ".parse().unwrap());
        assert_eq!(header_value(&headers, "x-user-id").as_deref(), Some("user-1"));
        assert!(header_value(&headers, "x-missing").is_none());
    }
}
