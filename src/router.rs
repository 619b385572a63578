use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::auth::{auth_middleware, public_rate_middleware, session_middleware, trace_middleware};
use crate::handlers::{account, auth as auth_handlers, markets, orders, system};
use crate::state::Gateway;
use crate::ws;

fn cors_layer(gw: &Gateway) -> CorsLayer {
    if gw.cfg.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = gw
        .cfg
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub(crate) fn build_router(gw: Arc<Gateway>) -> Router {
    let market_routes = Router::new()
        .route("/v1/markets/:symbol/trades", get(markets::get_trades))
        .route("/v1/markets/:symbol/orderbook", get(markets::get_orderbook))
        .route("/v1/markets/:symbol/candles", get(markets::get_candles))
        .route("/v1/markets/:symbol/ticker", get(markets::get_ticker))
        .layer(middleware::from_fn_with_state(gw.clone(), public_rate_middleware));

    let session_routes = Router::new()
        .route("/v1/auth/me", get(auth_handlers::me))
        .route("/v1/auth/logout", post(auth_handlers::logout))
        .route("/v1/account/balances", get(account::balances))
        .route("/v1/account/portfolio", get(account::portfolio))
        .layer(middleware::from_fn_with_state(gw.clone(), session_middleware));

    let trading_routes = Router::new()
        .route("/v1/orders", post(orders::create_order))
        .route(
            "/v1/orders/:order_id",
            delete(orders::cancel_order).get(orders::get_order),
        )
        .route("/v1/smoke/trades", post(orders::smoke_trade))
        .layer(middleware::from_fn_with_state(gw.clone(), auth_middleware));

    Router::new()
        .route("/healthz", get(system::health))
        .route("/readyz", get(system::ready))
        .route("/metrics", get(system::metrics))
        .route("/v1/auth/signup", post(auth_handlers::signup))
        .route("/v1/auth/login", post(auth_handlers::login))
        .route("/ws", get(ws::handle_ws))
        .merge(market_routes)
        .merge(session_routes)
        .merge(trading_routes)
        .layer(middleware::from_fn(trace_middleware))
        .layer(cors_layer(&gw))
        .with_state(gw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{canonical_request, sign};
    use crate::config::{test_config, Config};
    use crate::matcher::stub::StubMatcher;
    use crate::state::now_ms;
    use crate::wallet::Balance;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TEST_KEY: &str = "test-key";
    const TEST_SECRET: &str = "super-secret-at-least-16-chars";

    fn harness(mutate: impl FnOnce(&mut Config)) -> (Arc<Gateway>, Router) {
        let mut cfg = test_config();
        mutate(&mut cfg);
        let gw = Arc::new(Gateway::new(
            cfg,
            None,
            None,
            Some(Arc::new(StubMatcher::accepting())),
        ));
        let router = build_router(gw.clone());
        (gw, router)
    }

    fn signed_request(method: &str, path: &str, body: &[u8], ts_ms: i64, idem: &str) -> Request<Body> {
        let ts = ts_ms.to_string();
        let sig = sign(TEST_SECRET, &canonical_request(method, path, &ts, body));
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("X-API-KEY", TEST_KEY)
            .header("X-TS", ts)
            .header("X-SIGNATURE", sig)
            .header("content-type", "application/json");
        if !idem.is_empty() {
            builder = builder.header("Idempotency-Key", idem);
        }
        builder.body(Body::from(body.to_vec())).expect("request")
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(req).await.expect("response");
        let status = response.status();
        let body = response.into_body().collect().await.expect("body").to_bytes();
        (status, body.to_vec())
    }

    fn order_body() -> Vec<u8> {
        json!({
            "symbol": "BTC-KRW",
            "side": "BUY",
            "type": "LIMIT",
            "price": "100",
            "qty": "1",
            "timeInForce": "GTC",
        })
        .to_string()
        .into_bytes()
    }

    fn decode(body: &[u8]) -> Value {
        serde_json::from_slice(body).expect("json body")
    }

    #[tokio::test]
    async fn create_order_is_idempotent_and_conflicts_on_payload_change() {
        let (_gw, router) = harness(|_| {});
        let body = order_body();

        let (status1, body1) = send(
            &router,
            signed_request("POST", "/v1/orders", &body, now_ms(), "idem-1"),
        )
        .await;
        assert_eq!(status1, StatusCode::OK);
        let first = decode(&body1);
        assert_eq!(first["status"], "ACCEPTED");
        assert!(first["orderId"].as_str().unwrap().starts_with("ord_"));

        let (status2, body2) = send(
            &router,
            signed_request("POST", "/v1/orders", &body, now_ms() + 1, "idem-1"),
        )
        .await;
        assert_eq!(status2, StatusCode::OK);
        assert_eq!(body1, body2, "idempotent retry must be byte-identical");

        let changed = json!({
            "symbol": "BTC-KRW",
            "side": "BUY",
            "type": "LIMIT",
            "price": "100",
            "qty": "2",
            "timeInForce": "GTC",
        })
        .to_string()
        .into_bytes();
        let (status3, body3) = send(
            &router,
            signed_request("POST", "/v1/orders", &changed, now_ms() + 2, "idem-1"),
        )
        .await;
        assert_eq!(status3, StatusCode::CONFLICT);
        assert_eq!(decode(&body3)["error"], "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn create_order_requires_valid_idempotency_key() {
        let (_gw, router) = harness(|_| {});
        let body = order_body();

        let (status, _) = send(
            &router,
            signed_request("POST", "/v1/orders", &body, now_ms(), ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, resp) = send(
            &router,
            signed_request("POST", "/v1/orders", &body, now_ms(), "bad/key"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(decode(&resp)["error"], "invalid Idempotency-Key");
    }

    #[tokio::test]
    async fn replayed_signature_is_rejected_once() {
        let (_gw, router) = harness(|_| {});
        let body = order_body();
        let ts = now_ms();

        let first = signed_request("POST", "/v1/orders", &body, ts, "idem-a");
        let (status1, _) = send(&router, first).await;
        assert_eq!(status1, StatusCode::OK);

        let second = signed_request("POST", "/v1/orders", &body, ts, "idem-b");
        let (status2, resp) = send(&router, second).await;
        assert_eq!(status2, StatusCode::UNAUTHORIZED);
        assert_eq!(decode(&resp)["error"], "replay detected");

        let (_, metrics) = send(
            &router,
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        let text = String::from_utf8(metrics).unwrap();
        assert!(text.contains("edge_replay_detect_total 1"), "{text}");
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let (_gw, router) = harness(|_| {});
        let body = order_body();
        let ts = now_ms().to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/v1/orders")
            .header("X-API-KEY", TEST_KEY)
            .header("X-TS", &ts)
            .header("X-SIGNATURE", "deadbeef")
            .header("Idempotency-Key", "idem-x")
            .body(Body::from(body))
            .unwrap();
        let (status, resp) = send(&router, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(decode(&resp)["error"], "invalid signature");
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let (_gw, router) = harness(|_| {});
        let body = order_body();
        let stale = now_ms() - 10 * 60 * 1000;
        let (status, resp) = send(
            &router,
            signed_request("POST", "/v1/orders", &body, stale, "idem-x"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(decode(&resp)["error"], "timestamp skew");
    }

    #[tokio::test]
    async fn unsigned_trading_fails_closed_without_secrets() {
        let (_gw, router) = harness(|cfg| {
            cfg.api_secrets.clear();
        });
        let req = Request::builder()
            .method("POST")
            .uri("/v1/orders")
            .header("Idempotency-Key", "idem-x")
            .body(Body::from(order_body()))
            .unwrap();
        let (status, resp) = send(&router, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(decode(&resp)["error"], "auth_not_configured");
    }

    #[tokio::test]
    async fn session_flow_signup_me_order_logout() {
        let (_gw, router) = harness(|_| {});

        let signup = Request::builder()
            .method("POST")
            .uri("/v1/auth/signup")
            .body(Body::from(
                json!({ "email": "alice@example.com", "password": "password1234" }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(&router, signup).await;
        assert_eq!(status, StatusCode::OK);
        let session = decode(&body);
        let token = session["sessionToken"].as_str().unwrap().to_string();
        assert!(session["user"]["userId"].as_str().unwrap().starts_with("usr_"));
        assert!(session["expiresAt"].as_i64().unwrap() > now_ms());

        let me = Request::builder()
            .uri("/v1/auth/me")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, me).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&body)["user"]["email"], "alice@example.com");

        let order = Request::builder()
            .method("POST")
            .uri("/v1/orders")
            .header("Authorization", format!("Bearer {token}"))
            .header("Idempotency-Key", "sess-1")
            .body(Body::from(order_body()))
            .unwrap();
        let (status, body) = send(&router, order).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&body)["status"], "ACCEPTED");

        let logout = Request::builder()
            .method("POST")
            .uri("/v1/auth/logout")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, logout).await;
        assert_eq!(status, StatusCode::OK);

        let me_again = Request::builder()
            .uri("/v1/auth/me")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, me_again).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_rejects_bad_password() {
        let (_gw, router) = harness(|_| {});
        let signup = Request::builder()
            .method("POST")
            .uri("/v1/auth/signup")
            .body(Body::from(
                json!({ "email": "bob@example.com", "password": "password1234" }).to_string(),
            ))
            .unwrap();
        let (status, _) = send(&router, signup).await;
        assert_eq!(status, StatusCode::OK);

        let login = Request::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .body(Body::from(
                json!({ "email": "bob@example.com", "password": "wrong-password" }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(&router, login).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(decode(&body)["error"], "invalid credentials");
    }

    #[tokio::test]
    async fn order_rejects_insufficient_balance() {
        let (gw, router) = harness(|_| {});
        {
            let mut st = gw.state();
            st.wallets
                .entry(TEST_KEY.to_string())
                .or_default()
                .insert("KRW".to_string(), Balance { available: 10.0, hold: 0.0 });
        }
        let (status, body) = send(
            &router,
            signed_request("POST", "/v1/orders", &order_body(), now_ms(), "idem-poor"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(decode(&body)["error"], "insufficient_balance");
    }

    #[tokio::test]
    async fn order_lifecycle_create_get_cancel() {
        let (gw, router) = harness(|_| {});
        let (status, body) = send(
            &router,
            signed_request("POST", "/v1/orders", &order_body(), now_ms(), "life-1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let order_id = decode(&body)["orderId"].as_str().unwrap().to_string();

        let (status, body) = send(
            &router,
            signed_request("GET", &format!("/v1/orders/{order_id}"), &[], now_ms(), ""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&body)["status"], "ACCEPTED");

        let (status, body) = send(
            &router,
            signed_request(
                "DELETE",
                &format!("/v1/orders/{order_id}"),
                &[],
                now_ms(),
                "life-2",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&body)["status"], "CANCELED");

        // Hold is fully released after the cancel.
        let st = gw.state();
        let bal = st.wallets[TEST_KEY]["KRW"];
        assert!(bal.hold.abs() < 1e-9, "hold leaked: {bal:?}");
    }

    #[tokio::test]
    async fn cancel_of_unknown_order_is_404() {
        let (_gw, router) = harness(|_| {});
        let (status, body) = send(
            &router,
            signed_request("DELETE", "/v1/orders/ord_missing", &[], now_ms(), "gone-1"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(decode(&body)["error"], "UNKNOWN_ORDER");
    }

    #[tokio::test]
    async fn owner_mismatch_is_403() {
        let (gw, router) = harness(|_| {});
        {
            let mut st = gw.state();
            st.orders.insert(
                "ord_other".to_string(),
                crate::orders::OrderRecord {
                    order_id: "ord_other".to_string(),
                    status: "ACCEPTED".to_string(),
                    symbol: "BTC-KRW".to_string(),
                    owner_user_id: "someone-else".to_string(),
                    ..crate::orders::OrderRecord::default()
                },
            );
        }
        let (status, _) = send(
            &router,
            signed_request("GET", "/v1/orders/ord_other", &[], now_ms(), ""),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn smoke_route_is_disabled_by_default() {
        let (_gw, router) = harness(|_| {});
        let body = json!({ "tradeId": "t1", "symbol": "BTC-KRW", "price": "100", "qty": "1" })
            .to_string()
            .into_bytes();
        let (status, resp) = send(
            &router,
            signed_request("POST", "/v1/smoke/trades", &body, now_ms(), "smoke-1"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(decode(&resp)["error"], "smoke_disabled");
    }

    #[tokio::test]
    async fn smoke_trade_settles_and_feeds_market_endpoints() {
        let (_gw, router) = harness(|cfg| {
            cfg.enable_smoke_routes = true;
        });
        let body = json!({ "tradeId": "t1", "symbol": "BTC-KRW", "price": "100", "qty": "2" })
            .to_string()
            .into_bytes();
        let (status, resp) = send(
            &router,
            signed_request("POST", "/v1/smoke/trades", &body, now_ms(), "smoke-1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&resp)["status"], "settled");

        let (status, resp) = send(
            &router,
            Request::builder()
                .uri("/v1/markets/BTC-KRW/ticker")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ticker = decode(&resp);
        assert_eq!(ticker["ticker"]["data"]["lastPrice"], "100");

        let (status, resp) = send(
            &router,
            Request::builder()
                .uri("/v1/markets/BTC-KRW/trades?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode(&resp)["trades"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn healthz_sets_trace_header() {
        let (_gw, router) = harness(|_| {});
        let response = router
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-Trace-Id"));
    }

    #[tokio::test]
    async fn readyz_reports_core_unready_when_matcher_missing() {
        let mut cfg = test_config();
        cfg.disable_core = false;
        let gw = Arc::new(Gateway::new(cfg, None, None, None));
        let router = build_router(gw);
        let (status, body) = send(
            &router,
            Request::builder().uri("/readyz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(decode(&body)["status"], "core_unready");
    }

    #[tokio::test]
    async fn metrics_exposes_ws_backpressure_series() {
        let (_gw, router) = harness(|_| {});
        let (status, body) = send(
            &router,
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        for series in [
            "edge_orders_total",
            "edge_trades_total",
            "edge_ws_connections",
            "ws_active_conns",
            "ws_send_queue_p99",
            "ws_dropped_msgs",
            "ws_resume_gaps",
            "ws_slow_closes",
            "ws_policy_closes",
            "ws_command_rate_limit_closes",
            "ws_connection_rejects",
            "public_rate_limited",
            "settlement_anomalies",
            "session_evictions",
            "edge_trade_consumer_running",
        ] {
            assert!(text.contains(series), "missing {series} in {text}");
        }
    }

    #[tokio::test]
    async fn public_endpoints_are_rate_limited_per_ip() {
        let (_gw, router) = harness(|cfg| {
            cfg.public_rate_limit_per_minute = 2;
        });
        for _ in 0..2 {
            let (status, _) = send(
                &router,
                Request::builder()
                    .uri("/v1/markets/BTC-KRW/ticker")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(
            &router,
            Request::builder()
                .uri("/v1/markets/BTC-KRW/ticker")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(decode(&body)["error"], "TOO_MANY_REQUESTS");
    }

    #[tokio::test]
    async fn unknown_api_key_burns_its_own_budget() {
        let (gw, router) = harness(|cfg| {
            cfg.rate_limit_per_minute = 2;
        });
        let body = order_body();
        for expected in [StatusCode::UNAUTHORIZED, StatusCode::UNAUTHORIZED, StatusCode::TOO_MANY_REQUESTS] {
            let ts = now_ms().to_string();
            let sig = sign(TEST_SECRET, &canonical_request("POST", "/v1/orders", &ts, &body));
            let req = Request::builder()
                .method("POST")
                .uri("/v1/orders")
                .header("X-API-KEY", "nope")
                .header("X-TS", &ts)
                .header("X-SIGNATURE", sig)
                .header("Idempotency-Key", "idem-x")
                .body(Body::from(body.clone()))
                .unwrap();
            let (status, _) = send(&router, req).await;
            assert_eq!(status, expected);
        }
        // The real key's window is untouched.
        assert!(gw.state().rate_window.get(TEST_KEY).is_none());
    }
}
