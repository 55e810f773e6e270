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

use crate::clients::{control_http_client, join_url};
use crate::config::RemoteServiceConfig;
use crate::model::{
    CoordinatorHeartbeatRequest, CoordinatorView, DhtBootstrapResponse, HeartbeatResponse,
    RegisterCoordinatorRequest, RegisterCoordinatorResponse,
};
use crate::SafeDisplay;
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

/// Client of the edge router's coordinator-registry API.
#[async_trait]
pub trait EdgeRouterService: Send + Sync {
    async fn register_coordinator(
        &self,
        request: &RegisterCoordinatorRequest,
    ) -> Result<RegisterCoordinatorResponse, EdgeClientError>;

    async fn heartbeat_coordinator(
        &self,
        request: &CoordinatorHeartbeatRequest,
    ) -> Result<HeartbeatResponse, EdgeClientError>;

    async fn list_coordinators(&self) -> Result<Vec<CoordinatorView>, EdgeClientError>;

    async fn dht_bootstrap(&self) -> Result<DhtBootstrapResponse, EdgeClientError>;
}

pub struct EdgeRouterServiceDefault {
    base_url: Url,
    client: reqwest::Client,
}

impl EdgeRouterServiceDefault {
    pub fn new(config: &RemoteServiceConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            client: control_http_client(config.request_timeout),
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl EdgeRouterService for EdgeRouterServiceDefault {
    async fn register_coordinator(
        &self,
        request: &RegisterCoordinatorRequest,
    ) -> Result<RegisterCoordinatorResponse, EdgeClientError> {
        let response = self
            .client
            .post(self.url("/api/coordinator/register"))
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn heartbeat_coordinator(
        &self,
        request: &CoordinatorHeartbeatRequest,
    ) -> Result<HeartbeatResponse, EdgeClientError> {
        let response = self
            .client
            .post(self.url("/api/coordinator/heartbeat"))
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn list_coordinators(&self) -> Result<Vec<CoordinatorView>, EdgeClientError> {
        let response = self.client.get(self.url("/api/coordinators")).send().await?;
        read_json(response).await
    }

    async fn dht_bootstrap(&self) -> Result<DhtBootstrapResponse, EdgeClientError> {
        let response = self.client.get(self.url("/api/dht/bootstrap")).send().await?;
        read_json(response).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, EdgeClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json().await?)
    } else {
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::SERVICE_UNAVAILABLE => Err(EdgeClientError::NoLiveCoordinator),
            status if status.is_server_error() => {
                Err(EdgeClientError::Server(format!("{status}: {body}")))
            }
            status => Err(EdgeClientError::Rejected(format!("{status}: {body}"))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EdgeClientError {
    #[error("No live coordinator behind the edge router")]
    NoLiveCoordinator,
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Edge router error: {0}")]
    Server(String),
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl EdgeClientError {
    pub fn is_retriable(error: &EdgeClientError) -> bool {
        matches!(
            error,
            EdgeClientError::Transport(_)
                | EdgeClientError::Server(_)
                | EdgeClientError::NoLiveCoordinator
        )
    }
}

impl SafeDisplay for EdgeClientError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
