use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ErrorBody;
use crate::state::{now_ms, Gateway};

type HmacSha256 = Hmac<Sha256>;

const MAX_AUTH_BODY_BYTES: usize = 1 << 20;
const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub(crate) struct AuthPrincipal(pub(crate) String);

#[derive(Debug, Clone)]
pub(crate) struct TraceId(pub(crate) String);

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub(crate) fn canonical_request(method: &str, path: &str, ts: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(method.len() + path.len() + ts.len() + body.len() + 3);
    out.extend_from_slice(method.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(path.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(ts.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

pub(crate) fn sign(secret: &str, canonical: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &str, canonical: &[u8], signature: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical);
    mac.verify_slice(&sig_bytes).is_ok()
}

pub(crate) fn client_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn reject(status: StatusCode, code: &str) -> Response {
    (status, Json(ErrorBody { error: code.to_string() })).into_response()
}

impl Gateway {
    pub(crate) fn allow_rate(&self, bucket: &str, now_ms: i64) -> bool {
        let cutoff = now_ms - RATE_WINDOW_MS;
        let limit = self.cfg.rate_limit_per_minute;
        let mut st = self.state();
        let series = st.rate_window.entry(bucket.to_string()).or_default();
        series.retain(|ts| *ts >= cutoff);
        if series.len() >= limit {
            return false;
        }
        series.push(now_ms);
        true
    }

    pub(crate) fn allow_public_rate(&self, bucket: &str, now_ms: i64) -> bool {
        let limit = self.cfg.public_rate_limit_per_minute;
        if limit == 0 {
            return true;
        }
        let cutoff = now_ms - RATE_WINDOW_MS;
        let mut st = self.state();
        let series = st.public_rate_window.entry(bucket.to_string()).or_default();
        series.retain(|ts| *ts >= cutoff);
        if series.len() >= limit {
            st.public_rate_limited += 1;
            return false;
        }
        series.push(now_ms);
        true
    }

    pub(crate) fn is_replay(&self, api_key: &str, signature: &str, ts_ms: i64, now_ms: i64) -> bool {
        let key = format!("{api_key}|{signature}|{ts_ms}");
        let expire_at = now_ms + self.cfg.replay_ttl.as_millis() as i64;
        let mut st = self.state();
        st.replay_cache.retain(|_, exp| *exp >= now_ms);
        if st.replay_cache.contains_key(&key) {
            st.replay_detected += 1;
            return true;
        }
        st.replay_cache.insert(key, expire_at);
        false
    }
}

pub(crate) async fn auth_middleware(
    State(gw): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(req.headers()) {
        let Some(session) = gw.get_session(&token).await else {
            gw.auth_fail("invalid_session");
            return reject(StatusCode::UNAUTHORIZED, "invalid session");
        };
        let mut req = req;
        req.extensions_mut().insert(AuthPrincipal(session.user_id));
        return next.run(req).await;
    }

    if gw.cfg.api_secrets.is_empty() {
        if gw.cfg.allow_insecure_no_auth {
            let mut req = req;
            req.extensions_mut().insert(AuthPrincipal(String::new()));
            return next.run(req).await;
        }
        gw.auth_fail("auth_not_configured");
        return reject(StatusCode::SERVICE_UNAVAILABLE, "auth_not_configured");
    }

    let ip = client_ip(&req);
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let api_key = header_string(req.headers(), "X-API-KEY");
    let ts_header = header_string(req.headers(), "X-TS");
    let signature = header_string(req.headers(), "X-SIGNATURE");

    let (parts, body) = req.into_parts();
    let Ok(body_bytes) = axum::body::to_bytes(body, MAX_AUTH_BODY_BYTES).await else {
        gw.auth_fail("body_read");
        return reject(StatusCode::BAD_REQUEST, "invalid body");
    };

    if api_key.is_empty() || ts_header.is_empty() || signature.is_empty() {
        gw.auth_fail("missing_header");
        return reject(StatusCode::UNAUTHORIZED, "missing auth headers");
    }

    let Some(secret) = gw.cfg.api_secrets.get(&api_key).cloned() else {
        let bucket = format!("unknown_key:{ip}");
        if !gw.allow_rate(&bucket, now_ms()) {
            gw.auth_fail("unknown_key_rate_limit");
            return reject(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS");
        }
        gw.auth_fail("unknown_key");
        return reject(StatusCode::UNAUTHORIZED, "invalid api key");
    };

    let Ok(ts_ms) = ts_header.parse::<i64>() else {
        gw.auth_fail("invalid_ts");
        return reject(StatusCode::UNAUTHORIZED, "invalid timestamp");
    };
    let now = now_ms();
    if (now - ts_ms).abs() > gw.cfg.timestamp_skew.as_millis() as i64 {
        gw.auth_fail("ts_skew");
        return reject(StatusCode::UNAUTHORIZED, "timestamp skew");
    }

    if !gw.allow_rate(&api_key, now) {
        gw.auth_fail("rate_limit");
        return reject(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS");
    }

    let canonical = canonical_request(&method, &path, &ts_header, &body_bytes);
    if !verify_signature(&secret, &canonical, &signature) {
        gw.auth_fail("bad_signature");
        return reject(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    if gw.is_replay(&api_key, &signature, ts_ms, now) {
        gw.auth_fail("replay");
        return reject(StatusCode::UNAUTHORIZED, "replay detected");
    }

    let mut req = Request::from_parts(parts, Body::from(body_bytes));
    req.extensions_mut().insert(AuthPrincipal(api_key));
    next.run(req).await
}

pub(crate) async fn session_middleware(
    State(gw): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return reject(StatusCode::UNAUTHORIZED, "Authorization Bearer token required");
    };
    let Some(session) = gw.get_session(&token).await else {
        gw.auth_fail("invalid_session");
        return reject(StatusCode::UNAUTHORIZED, "invalid session");
    };
    let mut req = req;
    req.extensions_mut().insert(AuthPrincipal(session.user_id));
    next.run(req).await
}

pub(crate) async fn public_rate_middleware(
    State(gw): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    if !gw.allow_public_rate(&ip, now_ms()) {
        return reject(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS");
    }
    next.run(req).await
}

pub(crate) async fn trace_middleware(req: Request, next: Next) -> Response {
    let trace_id = header_string(req.headers(), "X-Trace-Id");
    let trace_id = if trace_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        trace_id
    };
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let is_ws = path == "/ws";

    let mut req = req;
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let span = tracing::info_span!("http", %method, path = %path, trace_id = %trace_id);
    let mut response = async {
        let response = next.run(req).await;
        if response.status().is_server_error() {
            tracing::error!(status = %response.status(), "request failed");
        } else {
            tracing::debug!(status = %response.status(), "request handled");
        }
        response
    }
    .instrument(span)
    .await;

    if !is_ws {
        if let Ok(value) = trace_id.parse() {
            response.headers_mut().insert("X-Trace-Id", value);
        }
    }
    response
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn gateway() -> Gateway {
        Gateway::new(test_config(), None, None, None)
    }

    #[test]
    fn signature_round_trip() {
        let secret = "super-secret-at-least-16-chars";
        let canonical = canonical_request("POST", "/v1/orders", "1700000000000", b"{\"qty\":\"1\"}");
        assert_eq!(canonical, b"POST\n/v1/orders\n1700000000000\n{\"qty\":\"1\"}".to_vec());
        let sig = sign(secret, &canonical);
        assert!(verify_signature(secret, &canonical, &sig));
        assert!(!verify_signature(secret, &canonical, &sig.replace('a', "b")));
        assert!(!verify_signature("another-secret-16-chars!", &canonical, &sig));
        assert!(!verify_signature(secret, &canonical, "zz-not-hex"));
    }

    #[test]
    fn rate_window_slides() {
        let mut cfg = test_config();
        cfg.rate_limit_per_minute = 2;
        let gw = Gateway::new(cfg, None, None, None);
        let t0 = 1_700_000_000_000;
        assert!(gw.allow_rate("key", t0));
        assert!(gw.allow_rate("key", t0 + 1));
        assert!(!gw.allow_rate("key", t0 + 2));
        assert!(gw.allow_rate("key", t0 + RATE_WINDOW_MS + 10));
    }

    #[test]
    fn public_rate_counts_rejections() {
        let mut cfg = test_config();
        cfg.public_rate_limit_per_minute = 1;
        let gw = Gateway::new(cfg, None, None, None);
        let t0 = 1_700_000_000_000;
        assert!(gw.allow_public_rate("1.2.3.4", t0));
        assert!(!gw.allow_public_rate("1.2.3.4", t0 + 1));
        assert!(gw.allow_public_rate("5.6.7.8", t0 + 2));
        assert_eq!(gw.state().public_rate_limited, 1);
    }

    #[test]
    fn replay_detected_within_ttl() {
        let gw = gateway();
        let t0 = 1_700_000_000_000;
        assert!(!gw.is_replay("key", "sig", t0, t0));
        assert!(gw.is_replay("key", "sig", t0, t0 + 10));
        assert_eq!(gw.state().replay_detected, 1);
        assert!(!gw.is_replay("key", "sig2", t0, t0 + 20));
        let past_ttl = t0 + gw.cfg.replay_ttl.as_millis() as i64 + 10_000;
        assert!(!gw.is_replay("key", "sig", t0, past_ttl));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(axum::http::header::AUTHORIZATION, "bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
