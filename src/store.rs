use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};

use crate::config::Config;
use crate::session::UserRecord;
use crate::state::Gateway;
use crate::wallet::Balance;

pub(crate) async fn open_pool(cfg: &Config) -> Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .min_connections(cfg.db_min_pool_size)
        .max_connections(cfg.db_max_pool_size)
        .acquire_timeout(cfg.db_acquire_timeout)
        .connect(&cfg.db_dsn)
        .await
        .context("open db")?;
    Ok(pool)
}

pub(crate) async fn init_schema(pool: &Pool<Postgres>, timeout: Duration) -> Result<()> {
    with_db_timeout(timeout, async {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS smoke_ledger_entries (
                id BIGSERIAL PRIMARY KEY,
                trade_id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(pool)
        .await
        .context("init ledger schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS web_users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(pool)
        .await
        .context("init users schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS web_wallet_balances (
                user_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                available DOUBLE PRECISION NOT NULL DEFAULT 0,
                hold DOUBLE PRECISION NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (user_id, currency)
            )
            "#,
        )
        .execute(pool)
        .await
        .context("init wallet schema")?;
        Ok(())
    })
    .await
}

pub(crate) async fn with_db_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("db statement deadline exceeded after {timeout:?}")),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

impl Gateway {
    pub(crate) async fn persist_wallet_balance(
        &self,
        user_id: &str,
        currency: &str,
        balance: Balance,
    ) -> Result<()> {
        let Some(pool) = &self.db else {
            return Ok(());
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            sqlx::query(
                r#"
                INSERT INTO web_wallet_balances(user_id, currency, available, hold)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, currency) DO UPDATE SET
                    available = EXCLUDED.available,
                    hold = EXCLUDED.hold,
                    updated_at = now()
                "#,
            )
            .bind(user_id)
            .bind(currency.to_uppercase())
            .bind(balance.available)
            .bind(balance.hold)
            .execute(pool)
            .await
            .context("persist wallet balance")?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn load_wallet_from_db(&self, user_id: &str) -> HashMap<String, Balance> {
        let Some(pool) = &self.db else {
            return HashMap::new();
        };
        let rows = with_db_timeout(self.cfg.db_statement_timeout, async {
            sqlx::query("SELECT currency, available, hold FROM web_wallet_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("load wallet")
        })
        .await;
        let Ok(rows) = rows else {
            return HashMap::new();
        };

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let currency: String = row.get("currency");
            let available: f64 = row.get("available");
            let hold: f64 = row.get("hold");
            out.insert(currency.to_uppercase(), Balance { available, hold });
        }
        out
    }

    pub(crate) async fn insert_user_with_wallet(
        &self,
        user: &UserRecord,
        wallet: &HashMap<String, Balance>,
    ) -> Result<()> {
        let Some(pool) = &self.db else {
            return Ok(());
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            let mut tx = pool.begin().await.context("begin tx")?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO web_users(user_id, email, password_hash, created_at)
                VALUES ($1, $2, $3, to_timestamp($4 / 1000.0))
                "#,
            )
            .bind(&user.user_id)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.created_at_ms)
            .execute(&mut *tx)
            .await;
            if let Err(err) = inserted {
                if is_unique_violation(&err) {
                    return Err(anyhow!("already_exists"));
                }
                return Err(anyhow::Error::new(err).context("insert user"));
            }

            for (currency, balance) in wallet {
                sqlx::query(
                    r#"
                    INSERT INTO web_wallet_balances(user_id, currency, available, hold)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (user_id, currency) DO UPDATE SET
                        available = EXCLUDED.available,
                        hold = EXCLUDED.hold,
                        updated_at = now()
                    "#,
                )
                .bind(&user.user_id)
                .bind(currency)
                .bind(balance.available)
                .bind(balance.hold)
                .execute(&mut *tx)
                .await
                .context("insert wallet")?;
            }

            tx.commit().await.context("commit tx")?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn query_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let Some(pool) = &self.db else {
            return Ok(None);
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            let row = sqlx::query(
                "SELECT user_id, email, password_hash, created_at FROM web_users WHERE email = $1",
            )
            .bind(email)
            .fetch_optional(pool)
            .await
            .context("query user by email")?;
            Ok(row.map(user_from_row))
        })
        .await
    }

    pub(crate) async fn query_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let Some(pool) = &self.db else {
            return Ok(None);
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            let row = sqlx::query(
                "SELECT user_id, email, password_hash, created_at FROM web_users WHERE user_id = $1",
            )
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .context("query user by id")?;
            Ok(row.map(user_from_row))
        })
        .await
    }

    pub(crate) async fn append_settlement(
        &self,
        trade_id: &str,
        symbol: &str,
        price: &str,
        qty: &str,
    ) -> Result<()> {
        let Some(pool) = &self.db else {
            return Ok(());
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            sqlx::query(
                r#"
                INSERT INTO smoke_ledger_entries (trade_id, symbol, price, qty)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (trade_id) DO NOTHING
                "#,
            )
            .bind(trade_id)
            .bind(symbol)
            .bind(price)
            .bind(qty)
            .execute(pool)
            .await
            .context("append settlement")?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn db_ready(&self) -> bool {
        let Some(pool) = &self.db else {
            return true;
        };
        with_db_timeout(self.cfg.db_statement_timeout, async {
            sqlx::query("SELECT 1").execute(pool).await.context("ping")?;
            Ok(())
        })
        .await
        .is_ok()
    }
}

fn user_from_row(row: sqlx::postgres::PgRow) -> UserRecord {
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    UserRecord {
        user_id: row.get("user_id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        created_at_ms: created_at.timestamp_millis(),
    }
}
