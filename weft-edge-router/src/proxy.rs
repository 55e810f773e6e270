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

use crate::registry::CoordinatorRegistry;
use poem::http::StatusCode;
use poem::web::{Data, Path};
use poem::{handler, Body, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use weft_common::model::ErrorBody;
use weft_common::relay::{
    copy_request_headers, json_response, read_payload, relay_response, RelayPayload,
};

/// Catch-all forwarder: any request that is not for the edge router's own
/// API goes verbatim to a live coordinator.
pub struct EdgeForwarder {
    registry: Arc<CoordinatorRegistry>,
    client: reqwest::Client,
    failover_retries: usize,
    forward_timeout: Duration,
}

impl EdgeForwarder {
    pub fn new(
        registry: Arc<CoordinatorRegistry>,
        failover_retries: usize,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client construction only fails on invalid builder settings"),
            failover_retries,
            forward_timeout,
        }
    }

    pub async fn handle(&self, path: &str, request: &Request, body: Body) -> Response {
        let candidates = match self.registry.pick_ordered().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "Coordinator lookup failed");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorBody {
                        error: "Coordinator lookup failed".to_string(),
                    },
                );
            }
        };
        if candidates.is_empty() {
            crate::metrics::record_forward("no_coordinator");
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorBody {
                    error: "No live coordinator".to_string(),
                },
            );
        }

        let payload = match read_payload(body).await {
            Ok(payload) => payload,
            Err(err) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &ErrorBody {
                        error: format!("Failed to read request body: {err}"),
                    },
                )
            }
        };
        let max_attempts = if payload.replayable() {
            (1 + self.failover_retries).min(candidates.len())
        } else {
            1
        };

        let mut payload = Some(payload);
        for coordinator in candidates.into_iter().take(max_attempts) {
            let outgoing_body = match payload.take() {
                Some(RelayPayload::Buffered(bytes)) => {
                    payload = Some(RelayPayload::Buffered(bytes.clone()));
                    reqwest::Body::from(bytes)
                }
                Some(RelayPayload::Streaming(stream)) => reqwest::Body::wrap_stream(stream),
                None => break,
            };

            let base = coordinator.tunnel_url.trim_end_matches('/');
            let mut target = format!("{base}/{path}");
            if let Some(query) = request.uri().query() {
                target.push('?');
                target.push_str(query);
            }

            let builder = self
                .client
                .request(request.method().clone(), &target)
                .timeout(self.forward_timeout)
                .body(outgoing_body);
            let builder = copy_request_headers(builder, request.headers());

            match builder.send().await {
                Ok(upstream) => {
                    crate::metrics::record_forward("success");
                    return relay_response(upstream);
                }
                Err(err) => {
                    warn!(
                        coordinator_id = %coordinator.coordinator_id,
                        error = %err,
                        "Failed to reach coordinator; trying next"
                    );
                }
            }
        }

        info!("All live coordinators failed to answer");
        crate::metrics::record_forward("failure");
        json_response(
            StatusCode::BAD_GATEWAY,
            &ErrorBody {
                error: "All live coordinators failed to answer".to_string(),
            },
        )
    }
}

#[handler]
pub async fn forward(
    request: &Request,
    body: Body,
    Path(path): Path<String>,
    Data(forwarder): Data<&Arc<EdgeForwarder>>,
) -> Response {
    forwarder.handle(&path, request, body).await
}
