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

use crate::metrics;
use crate::registry::WorkerRegistry;
use poem::http::StatusCode;
use poem::web::{Data, Path};
use poem::{handler, Body, Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use weft_common::catalog::ServiceCatalog;
use weft_common::model::{ErrorBody, ServiceName, ServicePeer, UnavailableBody};
use weft_common::relay::{
    copy_request_headers, json_response, read_payload, relay_response, RelayPayload,
};

/// Streaming reverse proxy from `/service/{service}/{rest}` to a healthy
/// worker's tunnel. Selection is round-robin per service; connect
/// failures and worker 5xx responses fail over to the next candidate.
pub struct ServiceProxy {
    registry: Arc<WorkerRegistry>,
    catalog: Arc<ServiceCatalog>,
    client: reqwest::Client,
    cursors: Mutex<HashMap<ServiceName, usize>>,
    failover_retries: usize,
    timeout_override: Option<Duration>,
}

impl ServiceProxy {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        catalog: Arc<ServiceCatalog>,
        failover_retries: usize,
        timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            catalog,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client construction only fails on invalid builder settings"),
            cursors: Mutex::new(HashMap::new()),
            failover_retries,
            timeout_override,
        }
    }

    pub async fn handle(
        &self,
        service_name: &str,
        rest: &str,
        request: &Request,
        body: Body,
    ) -> Response {
        let service = ServiceName::new(service_name);
        let candidates = self.registry.find_by_service(&service).await;
        if candidates.is_empty() {
            let available_services = self.registry.available_services().await;
            let body = UnavailableBody {
                error: format!("No healthy workers for service {service}"),
                available_services,
            };
            return json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
        }

        let payload = match read_payload(body).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(service = %service, error = %err, "Failed to read request body");
                let body = ErrorBody {
                    error: format!("Failed to read request body: {err}"),
                };
                return json_response(StatusCode::BAD_REQUEST, &body);
            }
        };

        let ordered = self.ordered_candidates(&service, candidates);
        let timeout = self
            .timeout_override
            .unwrap_or_else(|| self.catalog.forward_timeout(&service));

        // A body too large to replay pins the request to one worker.
        let max_attempts = if payload.replayable() {
            (1 + self.failover_retries).min(ordered.len())
        } else {
            1
        };

        let mut payload = Some(payload);
        for (attempt, peer) in ordered.into_iter().take(max_attempts).enumerate() {
            let outgoing_body = match payload.take() {
                Some(RelayPayload::Buffered(bytes)) => {
                    payload = Some(RelayPayload::Buffered(bytes.clone()));
                    reqwest::Body::from(bytes)
                }
                Some(RelayPayload::Streaming(stream)) => reqwest::Body::wrap_stream(stream),
                None => break,
            };

            let target = peer_url(&peer, &service, rest, request.uri().query());
            let builder = self
                .client
                .request(request.method().clone(), &target)
                .timeout(timeout)
                .body(outgoing_body);
            let builder = copy_request_headers(builder, request.headers());

            match builder.send().await {
                Ok(upstream) if upstream.status().is_server_error() => {
                    metrics::record_proxy_attempt(&service.0, false);
                    warn!(
                        service = %service,
                        worker_id = %peer.worker_id,
                        status = %upstream.status(),
                        attempt,
                        "Worker answered with a server error; trying next candidate"
                    );
                }
                Ok(upstream) => {
                    metrics::record_proxy_attempt(&service.0, true);
                    return relay_response(upstream);
                }
                Err(err) => {
                    metrics::record_proxy_attempt(&service.0, false);
                    warn!(
                        service = %service,
                        worker_id = %peer.worker_id,
                        error = %err,
                        attempt,
                        "Failed to reach worker; trying next candidate"
                    );
                }
            }
        }

        info!(service = %service, "All candidate workers failed");
        json_response(
            StatusCode::BAD_GATEWAY,
            &ErrorBody {
                error: format!("All workers for service {service} failed to answer"),
            },
        )
    }

    /// Rotates the candidate list by the per-service cursor; the cursor
    /// advances once per request, not per attempt, to keep the rotation
    /// fair under failover.
    fn ordered_candidates(
        &self,
        service: &ServiceName,
        candidates: Vec<ServicePeer>,
    ) -> Vec<ServicePeer> {
        let start = {
            let mut cursors = self
                .cursors
                .lock()
                .expect("proxy cursor lock is never poisoned");
            let cursor = cursors.entry(service.clone()).or_insert(0);
            let start = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            start
        };
        let mut ordered = Vec::with_capacity(candidates.len());
        ordered.extend_from_slice(&candidates[start..]);
        ordered.extend_from_slice(&candidates[..start]);
        ordered
    }
}

/// The worker's agent surface keeps the service prefix, so the request
/// stays routable after the hop: the receiving agent either dispatches it
/// to the local container or relays it onward.
fn peer_url(peer: &ServicePeer, service: &ServiceName, rest: &str, query: Option<&str>) -> String {
    let base = peer.tunnel_url.trim_end_matches('/');
    let mut url = if rest.is_empty() {
        format!("{base}/service/{service}")
    } else {
        format!("{base}/service/{service}/{rest}")
    };
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[handler]
pub async fn proxy_service(
    request: &Request,
    body: Body,
    Path((service, rest)): Path<(String, String)>,
    Data(proxy): Data<&Arc<ServiceProxy>>,
) -> Response {
    proxy.handle(&service, &rest, request, body).await
}

#[handler]
pub async fn proxy_service_root(
    request: &Request,
    body: Body,
    Path(service): Path<String>,
    Data(proxy): Data<&Arc<ServiceProxy>>,
) -> Response {
    proxy.handle(&service, "", request, body).await
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn peer_urls_keep_the_service_prefix_and_query() {
        let peer = ServicePeer {
            worker_id: weft_common::model::WorkerId::new("gpu-1"),
            tunnel_url: "https://gpu-1.tunnel.test/".to_string(),
            mesh_ip: None,
            load: 0.0,
        };
        let service = ServiceName::new("llm-inference");
        assert_eq!(
            peer_url(&peer, &service, "generate", Some("stream=true")),
            "https://gpu-1.tunnel.test/service/llm-inference/generate?stream=true"
        );
        assert_eq!(
            peer_url(&peer, &service, "", None),
            "https://gpu-1.tunnel.test/service/llm-inference"
        );
    }
}
