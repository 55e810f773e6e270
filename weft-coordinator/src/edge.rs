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

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;
use weft_common::clients::edge::{EdgeClientError, EdgeRouterService};
use weft_common::model::{
    CoordinatorHeartbeatRequest, CoordinatorId, RegisterCoordinatorRequest,
};
use weft_common::retries::{with_retries, RetryConfig};

/// Keeps this coordinator registered and heart-beating against the edge
/// router so client traffic keeps flowing to it.
pub struct EdgeAnnouncer {
    client: Arc<dyn EdgeRouterService>,
    coordinator_id: CoordinatorId,
    advertised_url: Url,
    dht_port: Option<u16>,
    retries: RetryConfig,
    interval: Duration,
}

impl EdgeAnnouncer {
    pub fn new(
        client: Arc<dyn EdgeRouterService>,
        coordinator_id: CoordinatorId,
        advertised_url: Url,
        dht_port: Option<u16>,
        retries: RetryConfig,
    ) -> Self {
        Self {
            client,
            coordinator_id,
            advertised_url,
            dht_port,
            retries,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn register(&self) -> Result<(), EdgeClientError> {
        let request = RegisterCoordinatorRequest {
            coordinator_id: Some(self.coordinator_id.clone()),
            tunnel_url: self.advertised_url.to_string(),
            location: None,
            dht_port: self.dht_port,
        };
        let response = with_retries(
            "edge-router",
            "register-coordinator",
            Some(self.coordinator_id.to_string()),
            &self.retries,
            &(self.client.clone(), request),
            |(client, request)| Box::pin(async move { client.register_coordinator(request).await }),
            EdgeClientError::is_retriable,
        )
        .await?;
        info!(
            coordinator_id = %response.coordinator_id,
            "Registered with the edge router"
        );
        Ok(())
    }

    async fn heartbeat(&self) -> Result<bool, EdgeClientError> {
        let request = CoordinatorHeartbeatRequest {
            coordinator_id: self.coordinator_id.clone(),
        };
        let response = self.client.heartbeat_coordinator(&request).await?;
        Ok(!response.requires_re_register())
    }

    /// Spawns the announce loop. Send on the returned channel to stop it;
    /// await the handle to join.
    pub fn start(self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut registered = false;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Edge announcer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !registered {
                            match self.register().await {
                                Ok(()) => registered = true,
                                Err(err) => {
                                    warn!(error = %err, "Edge router registration failed; will retry");
                                    continue;
                                }
                            }
                        }
                        match self.heartbeat().await {
                            Ok(true) => {}
                            Ok(false) => {
                                info!("Edge router asked for re-registration");
                                registered = false;
                            }
                            Err(err) => {
                                warn!(error = %err, "Edge router heartbeat failed; will retry next tick");
                            }
                        }
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }
}
