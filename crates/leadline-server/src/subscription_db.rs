use anyhow::Result;
use leadline_proto::{PushKeys, PushSubscriptionPayload};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

/// Push subscriptions keyed by `(user_id, endpoint)`.
#[derive(Clone)]
pub struct SubscriptionDb {
    pool: SqlitePool,
}

impl SubscriptionDb {
    pub async fn open(base_dir: &Path) -> Result<Self> {
        if !base_dir.exists() {
            std::fs::create_dir_all(base_dir)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(base_dir.join("subscriptions.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS push_subscriptions (
                user_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                p256dh TEXT NOT NULL,
                auth TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, endpoint)
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(SubscriptionDb { pool })
    }

    /// Insert, or refresh the keys of an existing `(user_id, endpoint)` row.
    pub async fn upsert(&self, user_id: &str, subscription: &PushSubscriptionPayload) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(user_id, endpoint) DO UPDATE SET
                   p256dh = excluded.p256dh,
                   auth = excluded.auth,
                   updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(user_id)
        .bind(&subscription.endpoint)
        .bind(&subscription.keys.p256dh)
        .bind(&subscription.keys.auth)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, user_id: &str, endpoint: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM push_subscriptions WHERE user_id = ? AND endpoint = ?")
            .bind(user_id)
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<PushSubscriptionPayload>> {
        let rows = sqlx::query(
            "SELECT endpoint, p256dh, auth FROM push_subscriptions WHERE user_id = ? ORDER BY created_at, endpoint",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PushSubscriptionPayload {
                endpoint: row.get("endpoint"),
                keys: PushKeys {
                    p256dh: row.get("p256dh"),
                    auth: row.get("auth"),
                },
            })
            .collect())
    }
}
