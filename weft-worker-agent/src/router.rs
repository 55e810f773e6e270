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
use async_trait::async_trait;
use poem::http::StatusCode;
use poem::{Body, Request, Response};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use weft_common::catalog::ServiceCatalog;
use weft_common::clients::coordinator::{CoordinatorClientError, CoordinatorService};
use weft_common::model::{ErrorBody, ServiceName, ServicePeer, UnavailableBody};
use weft_common::relay::{
    copy_request_headers, json_response, read_payload, relay_response, RelayPayload,
};

/// How long a resolved peer stays good for a service before the next
/// request pays for a fresh lookup.
pub const FINGER_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("No healthy workers for service {service}")]
    Unavailable {
        service: ServiceName,
        available_services: Vec<ServiceName>,
    },
    #[error("Directory lookup failed: {0}")]
    Transport(String),
}

/// A source of peers able to serve a service. The coordinator registry
/// implements this over HTTP discovery; the optional DHT accelerator
/// implements it over the bootstrap seeds.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn lookup(&self, service: &ServiceName) -> Result<Vec<ServicePeer>, DirectoryError>;
}

/// `PeerDirectory` over the coordinator's `/api/services/discover` API.
pub struct CoordinatorDirectory {
    client: Arc<dyn CoordinatorService>,
}

impl CoordinatorDirectory {
    pub fn new(client: Arc<dyn CoordinatorService>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PeerDirectory for CoordinatorDirectory {
    async fn lookup(&self, service: &ServiceName) -> Result<Vec<ServicePeer>, DirectoryError> {
        match self.client.discover_service(service).await {
            Ok(response) => Ok(response.workers),
            Err(CoordinatorClientError::ServiceUnavailable {
                service,
                available_services,
            }) => Err(DirectoryError::Unavailable {
                service,
                available_services,
            }),
            Err(err) => Err(DirectoryError::Transport(err.to_string())),
        }
    }
}

struct CacheEntry {
    peer: ServicePeer,
    cached_at: Instant,
}

#[derive(Default)]
pub struct RouterStats {
    pub local_requests: AtomicU64,
    pub forwarded_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub dht_lookups: AtomicU64,
    pub http_lookups: AtomicU64,
    pub failed_requests: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, poem_openapi::Object)]
pub struct RouterStatsView {
    pub local_requests: u64,
    pub forwarded_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dht_lookups: u64,
    pub http_lookups: u64,
    pub failed_requests: u64,
    pub cache_size: u64,
    pub cache_hit_rate: f64,
}

/// Routes a service request the worker received: local container first,
/// then the finger cache, then the optional DHT accelerator, then the
/// coordinator registry. Forwarding prefers the peer's mesh address over
/// its public tunnel.
pub struct FingerCacheRouter {
    catalog: Arc<ServiceCatalog>,
    assigned: Arc<RwLock<BTreeSet<ServiceName>>>,
    cache: Mutex<HashMap<ServiceName, CacheEntry>>,
    /// Optional accelerator; installed once the registration response
    /// brings the seed list.
    accelerator: RwLock<Option<Arc<dyn PeerDirectory>>>,
    directory: Arc<dyn PeerDirectory>,
    client: reqwest::Client,
    cache_ttl: Duration,
    stats: RouterStats,
}

impl FingerCacheRouter {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        assigned: Arc<RwLock<BTreeSet<ServiceName>>>,
        directory: Arc<dyn PeerDirectory>,
        accelerator: Option<Arc<dyn PeerDirectory>>,
    ) -> Self {
        Self {
            catalog,
            assigned,
            cache: Mutex::new(HashMap::new()),
            accelerator: RwLock::new(accelerator),
            directory,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client construction only fails on invalid builder settings"),
            cache_ttl: FINGER_CACHE_TTL,
            stats: RouterStats::default(),
        }
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub async fn set_accelerator(&self, accelerator: Option<Arc<dyn PeerDirectory>>) {
        *self.accelerator.write().await = accelerator;
    }

    pub async fn stats(&self) -> RouterStatsView {
        let cache_size = self.cache.lock().await.len() as u64;
        let hits = self.stats.cache_hits.load(Ordering::Relaxed);
        let misses = self.stats.cache_misses.load(Ordering::Relaxed);
        let cache_hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };
        RouterStatsView {
            local_requests: self.stats.local_requests.load(Ordering::Relaxed),
            forwarded_requests: self.stats.forwarded_requests.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            dht_lookups: self.stats.dht_lookups.load(Ordering::Relaxed),
            http_lookups: self.stats.http_lookups.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            cache_size,
            cache_hit_rate,
        }
    }

    /// Number of requests completed, for heartbeat reporting.
    pub fn tasks_completed(&self) -> u64 {
        self.stats.local_requests.load(Ordering::Relaxed)
            + self.stats.forwarded_requests.load(Ordering::Relaxed)
    }

    pub async fn handle(
        &self,
        service_name: &str,
        rest: &str,
        request: &Request,
        body: Body,
    ) -> Response {
        let service = ServiceName::new(service_name);

        // Local short-circuit: the container is on this host.
        if self.assigned.read().await.contains(&service) {
            return self.dispatch_local(&service, rest, request, body).await;
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
        let mut payload = Some(payload);

        // Finger cache.
        if let Some(peer) = self.cached_peer(&service).await {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_router_request("cache");
            match self
                .try_forward(&service, rest, request, &peer, &mut payload)
                .await
            {
                Some(response) => return response,
                None => {
                    // The cached peer is gone; drop it and look again.
                    self.invalidate(&service).await;
                }
            }
        } else {
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        // DHT accelerator, never trusted as the only source.
        let accelerator = self.accelerator.read().await.clone();
        if let Some(accelerator) = &accelerator {
            self.stats.dht_lookups.fetch_add(1, Ordering::Relaxed);
            match accelerator.lookup(&service).await {
                Ok(candidates) if !candidates.is_empty() => {
                    if let Some(peer) = select_peer(&candidates) {
                        let peer = peer.clone();
                        self.remember(&service, &peer).await;
                        if let Some(response) = self
                            .try_forward(&service, rest, request, &peer, &mut payload)
                            .await
                        {
                            return response;
                        }
                        self.invalidate(&service).await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(service = %service, error = %err, "DHT lookup failed; falling back");
                }
            }
        }

        // Mandatory HTTP fallback against the coordinator registry.
        self.stats.http_lookups.fetch_add(1, Ordering::Relaxed);
        let candidates = match self.directory.lookup(&service).await {
            Ok(candidates) => candidates,
            Err(DirectoryError::Unavailable {
                service,
                available_services,
            }) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &UnavailableBody {
                        error: format!("No healthy workers for service {service}"),
                        available_services,
                    },
                );
            }
            Err(err) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    &ErrorBody {
                        error: format!("Service discovery failed: {err}"),
                    },
                );
            }
        };

        let Some(peer) = select_peer(&candidates).cloned() else {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &UnavailableBody {
                    error: format!("No healthy workers for service {service}"),
                    available_services: vec![],
                },
            );
        };
        self.remember(&service, &peer).await;
        match self
            .try_forward(&service, rest, request, &peer, &mut payload)
            .await
        {
            Some(response) => response,
            None => {
                self.invalidate(&service).await;
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &ErrorBody {
                        error: format!(
                            "Worker {} failed to answer for service {service}",
                            peer.worker_id
                        ),
                    },
                )
            }
        }
    }

    async fn dispatch_local(
        &self,
        service: &ServiceName,
        rest: &str,
        request: &Request,
        body: Body,
    ) -> Response {
        let Some(descriptor) = self.catalog.get(service) else {
            return json_response(
                StatusCode::NOT_FOUND,
                &ErrorBody {
                    error: format!("Service {service} is not in the catalog"),
                },
            );
        };
        let url = join_path(&format!("http://127.0.0.1:{}", descriptor.port), rest, request);
        self.stats.local_requests.fetch_add(1, Ordering::Relaxed);
        metrics::record_router_request("local");

        let payload = match read_payload(body).await {
            Ok(RelayPayload::Buffered(bytes)) => reqwest::Body::from(bytes),
            Ok(RelayPayload::Streaming(stream)) => reqwest::Body::wrap_stream(stream),
            Err(err) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &ErrorBody {
                        error: format!("Failed to read request body: {err}"),
                    },
                )
            }
        };
        let builder = self
            .client
            .request(request.method().clone(), &url)
            .timeout(descriptor.forward_timeout)
            .body(payload);
        let builder = copy_request_headers(builder, request.headers());
        match builder.send().await {
            Ok(upstream) => relay_response(upstream),
            Err(err) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                warn!(service = %service, error = %err, "Local service dispatch failed");
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &ErrorBody {
                        error: format!("Local service {service} failed: {err}"),
                    },
                )
            }
        }
    }

    /// One forwarding attempt against a chosen peer. `None` means the
    /// peer could not be reached (or answered 5xx) and the payload is
    /// still replayable, so the caller may fall through to another
    /// lookup layer.
    async fn try_forward(
        &self,
        service: &ServiceName,
        rest: &str,
        request: &Request,
        peer: &ServicePeer,
        payload: &mut Option<RelayPayload>,
    ) -> Option<Response> {
        let outgoing_body = match payload.take() {
            Some(RelayPayload::Buffered(bytes)) => {
                *payload = Some(RelayPayload::Buffered(bytes.clone()));
                reqwest::Body::from(bytes)
            }
            Some(RelayPayload::Streaming(stream)) => reqwest::Body::wrap_stream(stream),
            None => return None,
        };

        let url = forward_url(peer, service, rest, request, &self.catalog);
        let builder = self
            .client
            .request(request.method().clone(), &url)
            .timeout(self.catalog.forward_timeout(service))
            .body(outgoing_body);
        let builder = copy_request_headers(builder, request.headers());

        match builder.send().await {
            Ok(upstream) if upstream.status().is_server_error() => {
                warn!(
                    service = %service,
                    worker_id = %peer.worker_id,
                    status = %upstream.status(),
                    "Peer answered with a server error"
                );
                None
            }
            Ok(upstream) => {
                self.stats.forwarded_requests.fetch_add(1, Ordering::Relaxed);
                metrics::record_router_request("forwarded");
                Some(relay_response(upstream))
            }
            Err(err) => {
                warn!(
                    service = %service,
                    worker_id = %peer.worker_id,
                    error = %err,
                    "Failed to reach peer"
                );
                None
            }
        }
    }

    async fn cached_peer(&self, service: &ServiceName) -> Option<ServicePeer> {
        let cache = self.cache.lock().await;
        let entry = cache.get(service)?;
        if entry.cached_at.elapsed() < self.cache_ttl {
            Some(entry.peer.clone())
        } else {
            None
        }
    }

    async fn remember(&self, service: &ServiceName, peer: &ServicePeer) {
        self.cache.lock().await.insert(
            service.clone(),
            CacheEntry {
                peer: peer.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    async fn invalidate(&self, service: &ServiceName) {
        self.cache.lock().await.remove(service);
    }
}

/// Prefers mesh-reachable peers, then picks randomly among the three
/// lowest-loaded to spread traffic.
pub fn select_peer(candidates: &[ServicePeer]) -> Option<&ServicePeer> {
    if candidates.is_empty() {
        return None;
    }
    let meshed: Vec<&ServicePeer> = candidates
        .iter()
        .filter(|peer| peer.mesh_ip.is_some())
        .collect();
    let pool: Vec<&ServicePeer> = if meshed.is_empty() {
        candidates.iter().collect()
    } else {
        meshed
    };
    let mut sorted = pool;
    sorted.sort_by(|a, b| a.load.total_cmp(&b.load));
    let top = sorted.len().min(3);
    let index = rand::rng().random_range(0..top);
    Some(sorted[index])
}

/// Mesh addresses point straight at the service container on the peer;
/// tunnel URLs go through the peer's agent surface so the request stays
/// routable.
fn forward_url(
    peer: &ServicePeer,
    service: &ServiceName,
    rest: &str,
    request: &Request,
    catalog: &ServiceCatalog,
) -> String {
    match (&peer.mesh_ip, catalog.get(service)) {
        (Some(mesh_ip), Some(descriptor)) => {
            join_path(&format!("http://{mesh_ip}:{}", descriptor.port), rest, request)
        }
        _ => {
            let base = peer.tunnel_url.trim_end_matches('/');
            let prefixed = if rest.is_empty() {
                format!("{base}/service/{service}")
            } else {
                format!("{base}/service/{service}/{rest}")
            };
            match request.uri().query() {
                Some(query) => format!("{prefixed}?{query}"),
                None => prefixed,
            }
        }
    }
}

fn join_path(base: &str, rest: &str, request: &Request) -> String {
    let mut url = if rest.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{rest}")
    };
    if let Some(query) = request.uri().query() {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn peer(id: &str, load: f64, mesh_ip: Option<&str>) -> ServicePeer {
        ServicePeer {
            worker_id: weft_common::model::WorkerId::new(id),
            tunnel_url: format!("https://{id}.tunnel.test"),
            mesh_ip: mesh_ip.map(|ip| ip.to_string()),
            load,
        }
    }

    #[test]
    fn selection_prefers_mesh_reachable_peers() {
        let candidates = vec![
            peer("a", 0.1, None),
            peer("b", 0.9, Some("10.0.0.2")),
        ];
        let selected = select_peer(&candidates).unwrap();
        assert_eq!(selected.worker_id.0, "b");
    }

    #[test]
    fn selection_picks_among_the_lowest_loaded() {
        let candidates = vec![
            peer("a", 0.1, None),
            peer("b", 0.2, None),
            peer("c", 0.3, None),
            peer("d", 0.95, None),
        ];
        for _ in 0..50 {
            let selected = select_peer(&candidates).unwrap();
            assert_ne!(selected.worker_id.0, "d");
        }
    }

    #[test]
    fn selection_of_nothing_is_none() {
        assert!(select_peer(&[]).is_none());
    }
}
