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

use chrono::{DateTime, Utc};
use std::time::Duration;
use weft_common::model::{CoordinatorId, CoordinatorView};

/// One coordinator as persisted in the edge store.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CoordinatorRecord {
    pub coordinator_id: String,
    pub tunnel_url: String,
    pub location: Option<String>,
    pub dht_port: Option<i64>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl CoordinatorRecord {
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.last_heartbeat)
            .to_std()
            .map(|age| age <= ttl)
            .unwrap_or(true)
    }

    pub fn view(&self) -> CoordinatorView {
        CoordinatorView {
            coordinator_id: CoordinatorId::new(self.coordinator_id.clone()),
            tunnel_url: self.tunnel_url.clone(),
            location: self.location.clone(),
            dht_port: self.dht_port.and_then(|port| u16::try_from(port).ok()),
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}
