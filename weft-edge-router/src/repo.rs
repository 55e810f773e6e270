// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::model::CoordinatorRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

#[derive(Debug, thiserror::Error)]
#[error("Repository error: {0}")]
pub struct RepoError(#[from] sqlx::Error);

#[async_trait]
pub trait CoordinatorRepo: Send + Sync {
    async fn upsert(&self, record: &CoordinatorRecord) -> Result<(), RepoError>;

    /// Refreshes `last_heartbeat`; false when the id is unknown.
    async fn touch(&self, coordinator_id: &str, now: DateTime<Utc>) -> Result<bool, RepoError>;

    async fn get_all(&self) -> Result<Vec<CoordinatorRecord>, RepoError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
}

pub struct DbCoordinatorRepo {
    pool: SqlitePool,
}

impl DbCoordinatorRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoordinatorRepo for DbCoordinatorRepo {
    async fn upsert(&self, record: &CoordinatorRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO coordinators
                (coordinator_id, tunnel_url, location, dht_port, registered_at, last_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (coordinator_id) DO UPDATE SET
                tunnel_url = excluded.tunnel_url,
                location = excluded.location,
                dht_port = excluded.dht_port,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&record.coordinator_id)
        .bind(&record.tunnel_url)
        .bind(&record.location)
        .bind(record.dht_port)
        .bind(record.registered_at)
        .bind(record.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, coordinator_id: &str, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE coordinators SET last_heartbeat = ? WHERE coordinator_id = ?")
            .bind(now)
            .bind(coordinator_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_all(&self) -> Result<Vec<CoordinatorRecord>, RepoError> {
        let records = sqlx::query_as::<_, CoordinatorRecord>(
            "SELECT coordinator_id, tunnel_url, location, dht_port, registered_at, last_heartbeat \
             FROM coordinators ORDER BY coordinator_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM coordinators WHERE last_heartbeat < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
