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
    AvailableServicesResponse, DiscoverServiceResponse, ErrorBody, ErrorsBody, HeartbeatResponse,
    RegisterWorkerRequest, RegisterWorkerResponse, ServiceName, UnavailableBody,
    WorkerHeartbeatRequest,
};
use crate::SafeDisplay;
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

/// Client of the coordinator control API. Workers talk to it through the
/// edge router, which exposes the same paths, so the base URL may be
/// either a coordinator or an edge router.
#[async_trait]
pub trait CoordinatorService: Send + Sync {
    async fn register_worker(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<RegisterWorkerResponse, CoordinatorClientError>;

    async fn heartbeat_worker(
        &self,
        request: &WorkerHeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorClientError>;

    async fn discover_service(
        &self,
        service: &ServiceName,
    ) -> Result<DiscoverServiceResponse, CoordinatorClientError>;

    async fn list_services(&self) -> Result<AvailableServicesResponse, CoordinatorClientError>;
}

pub struct CoordinatorServiceDefault {
    base_url: Url,
    client: reqwest::Client,
}

impl CoordinatorServiceDefault {
    pub fn new(config: &RemoteServiceConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            client: control_http_client(config.request_timeout),
        }
    }

    pub fn with_base_url(base_url: Url) -> Self {
        Self::new(&RemoteServiceConfig {
            url: base_url,
            ..RemoteServiceConfig::default()
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl CoordinatorService for CoordinatorServiceDefault {
    async fn register_worker(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<RegisterWorkerResponse, CoordinatorClientError> {
        let response = self
            .client
            .post(self.url("/api/worker/register"))
            .json(request)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::CONFLICT => {
                let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
                    error: "worker id collision".to_string(),
                });
                Err(CoordinatorClientError::IdCollision(body.error))
            }
            StatusCode::BAD_REQUEST => {
                let body: ErrorsBody = response.json().await.unwrap_or(ErrorsBody {
                    errors: vec!["registration rejected".to_string()],
                });
                Err(CoordinatorClientError::Rejected(body.errors.join(", ")))
            }
            status => Err(error_from_status(status, response).await),
        }
    }

    async fn heartbeat_worker(
        &self,
        request: &WorkerHeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorClientError> {
        let response = self
            .client
            .post(self.url("/api/worker/heartbeat"))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(error_from_status(status, response).await)
        }
    }

    async fn discover_service(
        &self,
        service: &ServiceName,
    ) -> Result<DiscoverServiceResponse, CoordinatorClientError> {
        let response = self
            .client
            .get(self.url(&format!("/api/services/discover/{service}")))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::SERVICE_UNAVAILABLE => {
                let body: UnavailableBody = response.json().await.unwrap_or(UnavailableBody {
                    error: format!("No healthy workers for service {service}"),
                    available_services: vec![],
                });
                Err(CoordinatorClientError::ServiceUnavailable {
                    service: service.clone(),
                    available_services: body.available_services,
                })
            }
            status => Err(error_from_status(status, response).await),
        }
    }

    async fn list_services(&self) -> Result<AvailableServicesResponse, CoordinatorClientError> {
        let response = self.client.get(self.url("/api/services/list")).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(error_from_status(status, response).await)
        }
    }
}

async fn error_from_status(
    status: StatusCode,
    response: reqwest::Response,
) -> CoordinatorClientError {
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        CoordinatorClientError::Server(format!("{status}: {body}"))
    } else {
        CoordinatorClientError::Rejected(format!("{status}: {body}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorClientError {
    #[error("No healthy workers for service {service}")]
    ServiceUnavailable {
        service: ServiceName,
        available_services: Vec<ServiceName>,
    },
    #[error("Worker id collision: {0}")]
    IdCollision(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Coordinator error: {0}")]
    Server(String),
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl CoordinatorClientError {
    pub fn is_retriable(error: &CoordinatorClientError) -> bool {
        matches!(
            error,
            CoordinatorClientError::Transport(_) | CoordinatorClientError::Server(_)
        )
    }
}

impl SafeDisplay for CoordinatorClientError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
