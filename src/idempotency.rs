use sha2::{Digest, Sha256};

use crate::state::{now_ms, Gateway};

const IDEMPOTENCY_TTL_MS: i64 = 10 * 60 * 1000;
pub(crate) const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct IdempotencyRecord {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
    pub(crate) request_hash: String,
    pub(crate) ts_ms: i64,
}

pub(crate) enum IdempotencyProbe {
    Miss,
    Hit { status: u16, body: Vec<u8> },
    Conflict,
}

pub(crate) fn normalize_idempotency_key(raw: &str) -> Option<String> {
    let key = raw.trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return None;
    }
    if key.chars().any(|c| c.is_whitespace() || c == '/') {
        return None;
    }
    Some(key.to_string())
}

pub(crate) fn request_hash(method: &str, path: &str, body: &[u8]) -> String {
    let mut hash = Sha256::new();
    hash.update(method.as_bytes());
    hash.update(b"\n");
    hash.update(path.as_bytes());
    hash.update(b"\n");
    hash.update(body);
    hex::encode(hash.finalize())
}

fn store_key(principal: &str, method: &str, path: &str, idem_key: &str) -> String {
    format!("{principal}|{method}|{path}|{idem_key}")
}

impl Gateway {
    pub(crate) fn idempotency_probe(
        &self,
        principal: &str,
        idem_key: &str,
        method: &str,
        path: &str,
        request_hash: &str,
    ) -> IdempotencyProbe {
        let k = store_key(principal, method, path, idem_key);
        let now = now_ms();
        let mut st = self.state();
        st.idempotency.retain(|_, rec| now - rec.ts_ms <= IDEMPOTENCY_TTL_MS);
        let Some(rec) = st.idempotency.get(&k) else {
            return IdempotencyProbe::Miss;
        };
        if !rec.request_hash.is_empty() && !request_hash.is_empty() && rec.request_hash != request_hash {
            return IdempotencyProbe::Conflict;
        }
        IdempotencyProbe::Hit {
            status: rec.status,
            body: rec.body.clone(),
        }
    }

    pub(crate) fn idempotency_store(
        &self,
        principal: &str,
        idem_key: &str,
        method: &str,
        path: &str,
        request_hash: &str,
        status: u16,
        body: &[u8],
    ) {
        let k = store_key(principal, method, path, idem_key);
        let mut st = self.state();
        st.idempotency.insert(
            k,
            IdempotencyRecord {
                status,
                body: body.to_vec(),
                request_hash: request_hash.to_string(),
                ts_ms: now_ms(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn gateway() -> Gateway {
        Gateway::new(test_config(), None, None, None)
    }

    #[test]
    fn key_normalization_rules() {
        assert_eq!(
            normalize_idempotency_key("idem-OK_1:2.3").as_deref(),
            Some("idem-OK_1:2.3")
        );
        assert!(normalize_idempotency_key("").is_none());
        assert!(normalize_idempotency_key("   ").is_none());
        assert!(normalize_idempotency_key("bad key").is_none());
        assert!(normalize_idempotency_key("bad/key").is_none());
        assert!(normalize_idempotency_key(&"a".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_none());
    }

    #[test]
    fn hit_replays_cached_response() {
        let gw = gateway();
        let h = request_hash("POST", "/v1/orders", b"{}");
        gw.idempotency_store("key", "idem-1", "POST", "/v1/orders", &h, 200, b"{\"ok\":true}");

        match gw.idempotency_probe("key", "idem-1", "POST", "/v1/orders", &h) {
            IdempotencyProbe::Hit { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"{\"ok\":true}");
            }
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn differing_request_hash_is_conflict() {
        let gw = gateway();
        let h1 = request_hash("POST", "/v1/orders", b"{\"qty\":\"1\"}");
        let h2 = request_hash("POST", "/v1/orders", b"{\"qty\":\"2\"}");
        gw.idempotency_store("key", "idem-1", "POST", "/v1/orders", &h1, 200, b"{}");

        assert!(matches!(
            gw.idempotency_probe("key", "idem-1", "POST", "/v1/orders", &h2),
            IdempotencyProbe::Conflict
        ));
    }

    #[test]
    fn probe_sweeps_expired_records() {
        let gw = gateway();
        let h = request_hash("POST", "/v1/orders", b"{}");
        gw.idempotency_store("key", "idem-1", "POST", "/v1/orders", &h, 200, b"{}");
        {
            let mut st = gw.state();
            let rec = st.idempotency.values_mut().next().expect("record");
            rec.ts_ms -= IDEMPOTENCY_TTL_MS + 1;
        }
        assert!(matches!(
            gw.idempotency_probe("key", "idem-1", "POST", "/v1/orders", &h),
            IdempotencyProbe::Miss
        ));
    }

    #[test]
    fn scoped_by_principal_and_route() {
        let gw = gateway();
        let h = request_hash("POST", "/v1/orders", b"{}");
        gw.idempotency_store("key-a", "idem-1", "POST", "/v1/orders", &h, 200, b"{}");
        assert!(matches!(
            gw.idempotency_probe("key-b", "idem-1", "POST", "/v1/orders", &h),
            IdempotencyProbe::Miss
        ));
        assert!(matches!(
            gw.idempotency_probe("key-a", "idem-1", "DELETE", "/v1/orders/x", &h),
            IdempotencyProbe::Miss
        ));
    }
}
