use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::state::{now_ms, Gateway};
use crate::wallet::default_wallet_balances;

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) user_id: String,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    pub(crate) token_hash: String,
    pub(crate) user_id: String,
    pub(crate) issued_at_ms: i64,
    pub(crate) expires_at_ms: i64,
}

pub(crate) fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 {
        return false;
    }
    let Some(at) = email.find('@') else {
        return false;
    };
    let Some(dot) = email.rfind('.') else {
        return false;
    };
    at > 0 && dot > at + 1 && dot < email.len() - 1
}

fn session_cache_key(token_hash: &str) -> String {
    format!("session:{token_hash}")
}

impl Gateway {
    pub(crate) async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> anyhow::Result<UserRecord> {
        if self.get_user_by_email(email).await?.is_some() {
            anyhow::bail!("already_exists");
        }

        let user = UserRecord {
            user_id: format!("usr_{}", Uuid::new_v4()),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at_ms: now_ms(),
        };
        let wallet = default_wallet_balances();

        self.insert_user_with_wallet(&user, &wallet).await?;

        let mut st = self.state();
        st.users_by_email.insert(user.email.clone(), user.clone());
        st.users_by_id.insert(user.user_id.clone(), user.clone());
        st.wallets.insert(user.user_id.clone(), wallet);
        Ok(user)
    }

    pub(crate) async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<UserRecord>> {
        {
            let st = self.state();
            if let Some(user) = st.users_by_email.get(email) {
                return Ok(Some(user.clone()));
            }
        }
        let Some(user) = self.query_user_by_email(email).await? else {
            return Ok(None);
        };
        let wallet = self.load_wallet_from_db(&user.user_id).await;

        let mut st = self.state();
        st.users_by_email.insert(user.email.clone(), user.clone());
        st.users_by_id.insert(user.user_id.clone(), user.clone());
        st.wallets.entry(user.user_id.clone()).or_insert_with(|| {
            if wallet.is_empty() {
                default_wallet_balances()
            } else {
                wallet
            }
        });
        Ok(Some(user))
    }

    pub(crate) async fn get_user_by_id(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        {
            let st = self.state();
            if let Some(user) = st.users_by_id.get(user_id) {
                return Ok(Some(user.clone()));
            }
        }
        let Some(user) = self.query_user_by_id(user_id).await? else {
            return Ok(None);
        };
        let wallet = self.load_wallet_from_db(&user.user_id).await;

        let mut st = self.state();
        st.users_by_email.insert(user.email.clone(), user.clone());
        st.users_by_id.insert(user.user_id.clone(), user.clone());
        st.wallets.entry(user.user_id.clone()).or_insert_with(|| {
            if wallet.is_empty() {
                default_wallet_balances()
            } else {
                wallet
            }
        });
        Ok(Some(user))
    }

    pub(crate) async fn create_session(
        &self,
        user: &UserRecord,
    ) -> anyhow::Result<(String, SessionRecord)> {
        let now = now_ms();
        let raw_token = format!("{}{}", Uuid::new_v4(), Uuid::new_v4());
        let token_hash = sha256_hex(&raw_token);
        let session = SessionRecord {
            token_hash: token_hash.clone(),
            user_id: user.user_id.clone(),
            issued_at_ms: now,
            expires_at_ms: now + self.cfg.session_ttl.as_millis() as i64,
        };

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let raw = serde_json::to_string(&session)?;
            let ttl = self.cfg.session_ttl.as_secs();
            redis::cmd("SET")
                .arg(session_cache_key(&token_hash))
                .arg(raw)
                .arg("EX")
                .arg(ttl)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("persist session: {e}"))?;
        }

        let evicted = {
            let mut st = self.state();
            st.sessions_by_hash.insert(token_hash.clone(), session.clone());
            let hashes = st.sessions_by_user.entry(user.user_id.clone()).or_default();
            hashes.push(token_hash.clone());
            let cap = self.cfg.session_cap_per_user;
            let mut evicted = Vec::new();
            if cap > 0 && hashes.len() > cap {
                let overflow = hashes.len() - cap;
                evicted = hashes.drain(..overflow).collect::<Vec<_>>();
                for old in &evicted {
                    st.sessions_by_hash.remove(old);
                }
                st.session_evictions += evicted.len() as u64;
            }
            evicted
        };

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            for old in &evicted {
                let _ = redis::cmd("DEL")
                    .arg(session_cache_key(old))
                    .query_async::<_, ()>(&mut conn)
                    .await;
            }
        }

        Ok((raw_token, session))
    }

    pub(crate) async fn get_session(&self, raw_token: &str) -> Option<SessionRecord> {
        let token_hash = sha256_hex(raw_token);
        let now = now_ms();

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let cached: Result<Option<String>, _> = redis::cmd("GET")
                .arg(session_cache_key(&token_hash))
                .query_async(&mut conn)
                .await;
            if let Ok(Some(raw)) = cached {
                if let Ok(session) = serde_json::from_str::<SessionRecord>(&raw) {
                    if session.expires_at_ms > now {
                        return Some(session);
                    }
                }
                let _ = redis::cmd("DEL")
                    .arg(session_cache_key(&token_hash))
                    .query_async::<_, ()>(&mut conn)
                    .await;
            }
        }

        let mut st = self.state();
        let session = st.sessions_by_hash.get(&token_hash)?.clone();
        if session.expires_at_ms <= now {
            st.sessions_by_hash.remove(&token_hash);
            remove_user_session_hash(&mut st.sessions_by_user, &session.user_id, &token_hash);
            return None;
        }
        Some(session)
    }

    pub(crate) async fn delete_session(&self, raw_token: &str) {
        let token_hash = sha256_hex(raw_token);
        {
            let mut st = self.state();
            if let Some(session) = st.sessions_by_hash.remove(&token_hash) {
                remove_user_session_hash(&mut st.sessions_by_user, &session.user_id, &token_hash);
            }
        }
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let _ = redis::cmd("DEL")
                .arg(session_cache_key(&token_hash))
                .query_async::<_, ()>(&mut conn)
                .await;
        }
    }
}

fn remove_user_session_hash(
    sessions_by_user: &mut std::collections::HashMap<String, Vec<String>>,
    user_id: &str,
    token_hash: &str,
) {
    let Some(hashes) = sessions_by_user.get_mut(user_id) else {
        return;
    };
    hashes.retain(|h| h != token_hash);
    if hashes.is_empty() {
        sessions_by_user.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn gateway() -> Gateway {
        Gateway::new(test_config(), None, None, None)
    }

    fn user() -> UserRecord {
        UserRecord {
            user_id: "usr_test".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "x".to_string(),
            created_at_ms: now_ms(),
        }
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("alice@.x"));
        assert!(!is_valid_email("a@b."));
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[tokio::test]
    async fn raw_token_is_never_stored() {
        let gw = gateway();
        let (raw, session) = gw.create_session(&user()).await.expect("session");
        assert!(raw.len() >= 64);
        assert_eq!(session.token_hash, sha256_hex(&raw));
        let st = gw.state();
        assert!(!st.sessions_by_hash.contains_key(&raw));
        assert!(st.sessions_by_hash.contains_key(&session.token_hash));
    }

    #[tokio::test]
    async fn lookup_round_trip_and_logout() {
        let gw = gateway();
        let (raw, _) = gw.create_session(&user()).await.expect("session");
        assert!(gw.get_session(&raw).await.is_some());
        gw.delete_session(&raw).await;
        assert!(gw.get_session(&raw).await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_deleted_on_read() {
        let gw = gateway();
        let (raw, session) = gw.create_session(&user()).await.expect("session");
        {
            let mut st = gw.state();
            st.sessions_by_hash
                .get_mut(&session.token_hash)
                .expect("session")
                .expires_at_ms = now_ms() - 1;
        }
        assert!(gw.get_session(&raw).await.is_none());
        assert!(gw.state().sessions_by_hash.is_empty());
    }

    #[tokio::test]
    async fn session_cap_evicts_oldest_fifo() {
        let mut cfg = test_config();
        cfg.session_cap_per_user = 2;
        let gw = Gateway::new(cfg, None, None, None);
        let u = user();

        let (raw1, _) = gw.create_session(&u).await.expect("s1");
        let (raw2, _) = gw.create_session(&u).await.expect("s2");
        let (raw3, _) = gw.create_session(&u).await.expect("s3");

        assert!(gw.get_session(&raw1).await.is_none());
        assert!(gw.get_session(&raw2).await.is_some());
        assert!(gw.get_session(&raw3).await.is_some());
        assert_eq!(gw.state().session_evictions, 1);
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate_email() {
        let gw = gateway();
        gw.create_user("alice@example.com", "hash").await.expect("first");
        let err = gw.create_user("alice@example.com", "hash").await.unwrap_err();
        assert!(err.to_string().contains("already_exists"));
    }

    #[tokio::test]
    async fn create_user_seeds_default_wallet() {
        let gw = gateway();
        let u = gw.create_user("bob@example.com", "hash").await.expect("user");
        let st = gw.state();
        let wallet = st.wallets.get(&u.user_id).expect("wallet");
        assert!(wallet["KRW"].available > 0.0);
        assert!(wallet.contains_key("BTC"));
    }
}
