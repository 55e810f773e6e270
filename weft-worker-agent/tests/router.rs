use async_trait::async_trait;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::test::TestClient;
use poem::web::Data;
use poem::{handler, Body, EndpointExt, Route};
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_r::test;
use tokio::sync::RwLock;
use weft_common::catalog::{ServiceCatalog, ServiceDescriptor, ServiceTier};
use weft_common::model::{ServiceName, ServicePeer, WorkerId, WorkerType};
use weft_worker_agent::agent::AgentState;
use weft_worker_agent::api::combined_routes;
use weft_worker_agent::router::{DirectoryError, FingerCacheRouter, PeerDirectory};

test_r::enable!();

struct Upstream {
    name: &'static str,
    hits: AtomicU64,
}

#[handler]
async fn upstream_echo(Data(state): Data<&Arc<Upstream>>, body: Body) -> String {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let payload = body.into_string().await.unwrap_or_default();
    format!("{}:{}", state.name, payload)
}

async fn spawn_upstream(name: &'static str) -> (Arc<Upstream>, SocketAddr) {
    let state = Arc::new(Upstream {
        name,
        hits: AtomicU64::new(0),
    });
    let app = Route::new()
        .at("/*path", upstream_echo.data(state.clone()))
        .at("/", upstream_echo.data(state.clone()));
    let acceptor = TcpListener::bind("127.0.0.1:0")
        .into_acceptor()
        .await
        .unwrap();
    let addr = *acceptor.local_addr()[0]
        .as_socket_addr()
        .expect("tcp acceptor must have a socket address");
    tokio::spawn(async move {
        let _ = poem::Server::new_with_acceptor(acceptor).run(app).await;
    });
    (state, addr)
}

struct StubDirectory {
    peers: Vec<ServicePeer>,
    lookups: AtomicU64,
    available_services: Vec<ServiceName>,
}

impl StubDirectory {
    fn with_peers(peers: Vec<ServicePeer>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            lookups: AtomicU64::new(0),
            available_services: vec![],
        })
    }

    fn unavailable(available_services: Vec<ServiceName>) -> Arc<Self> {
        Arc::new(Self {
            peers: vec![],
            lookups: AtomicU64::new(0),
            available_services,
        })
    }
}

#[async_trait]
impl PeerDirectory for StubDirectory {
    async fn lookup(&self, service: &ServiceName) -> Result<Vec<ServicePeer>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.peers.is_empty() {
            Err(DirectoryError::Unavailable {
                service: service.clone(),
                available_services: self.available_services.clone(),
            })
        } else {
            Ok(self.peers.clone())
        }
    }
}

fn llm_catalog(port: u16) -> ServiceCatalog {
    ServiceCatalog::from_descriptors(vec![ServiceDescriptor {
        name: ServiceName::new("llm-inference"),
        tier: ServiceTier::Gpu,
        requires: WorkerType::Gpu,
        priority: 1,
        port,
        forward_timeout: Duration::from_secs(5),
    }])
}

fn tunnel_peer(id: &str, addr: SocketAddr, load: f64) -> ServicePeer {
    ServicePeer {
        worker_id: WorkerId::new(id),
        tunnel_url: format!("http://{addr}"),
        mesh_ip: None,
        load,
    }
}

fn build_router(
    catalog: ServiceCatalog,
    directory: Arc<StubDirectory>,
) -> (Arc<AgentState>, Arc<FingerCacheRouter>) {
    build_router_with_ttl(catalog, directory, Duration::from_secs(60))
}

fn build_router_with_ttl(
    catalog: ServiceCatalog,
    directory: Arc<StubDirectory>,
    cache_ttl: Duration,
) -> (Arc<AgentState>, Arc<FingerCacheRouter>) {
    let state = Arc::new(AgentState::new(None));
    let shared: Arc<RwLock<BTreeSet<ServiceName>>> = state.assigned.clone();
    let router = Arc::new(
        FingerCacheRouter::new(Arc::new(catalog), shared, directory, None)
            .with_cache_ttl(cache_ttl),
    );
    (state, router)
}

async fn set_assigned(state: &Arc<AgentState>, assigned: &[&str]) {
    *state.assigned.write().await = assigned.iter().map(|name| ServiceName::new(*name)).collect();
}

#[test]
async fn first_call_uses_discovery_and_second_hits_the_cache() {
    let (upstream, addr) = spawn_upstream("y").await;
    let directory = StubDirectory::with_peers(vec![tunnel_peer("gpu-7", addr, 0.1)]);
    let (state, router) = build_router(llm_catalog(18001), directory.clone());
    set_assigned(&state, &[]).await;

    let cli = TestClient::new(combined_routes(state, router.clone()));

    let resp = cli
        .post("/service/llm-inference/infer")
        .body("question")
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let (_, body) = resp.0.into_parts();
    assert_eq!(body.into_string().await.unwrap(), "y:question");

    let resp = cli
        .post("/service/llm-inference/infer")
        .body("again")
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let (_, body) = resp.0.into_parts();
    assert_eq!(body.into_string().await.unwrap(), "y:again");

    let stats = router.stats().await;
    assert_eq!(stats.http_lookups, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.forwarded_requests, 2);
    assert_eq!(stats.cache_size, 1);
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
}

#[test]
async fn assigned_services_short_circuit_to_the_local_container() {
    let (upstream, addr) = spawn_upstream("local").await;
    let directory = StubDirectory::with_peers(vec![]);
    let (state, router) =
        build_router(llm_catalog(addr.port()), directory.clone());
    set_assigned(&state, &["llm-inference"]).await;

    let cli = TestClient::new(combined_routes(state, router.clone()));
    let resp = cli
        .post("/service/llm-inference/infer")
        .body("hi")
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let (_, body) = resp.0.into_parts();
    assert_eq!(body.into_string().await.unwrap(), "local:hi");

    let stats = router.stats().await;
    assert_eq!(stats.local_requests, 1);
    assert_eq!(stats.forwarded_requests, 0);
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[test]
async fn mesh_addresses_are_preferred_over_tunnels() {
    let (upstream, addr) = spawn_upstream("meshy").await;
    // The mesh path goes straight to the container port, so the catalog
    // port is the upstream's port; the tunnel URL is garbage on purpose.
    let peer = ServicePeer {
        worker_id: WorkerId::new("gpu-8"),
        tunnel_url: "http://127.0.0.1:9".to_string(),
        mesh_ip: Some("127.0.0.1".to_string()),
        load: 0.2,
    };
    let directory = StubDirectory::with_peers(vec![peer]);
    let (state, router) = build_router(llm_catalog(addr.port()), directory);
    set_assigned(&state, &[]).await;

    let cli = TestClient::new(combined_routes(state, router));
    let resp = cli
        .post("/service/llm-inference/infer")
        .body("ping")
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let (_, body) = resp.0.into_parts();
    assert_eq!(body.into_string().await.unwrap(), "meshy:ping");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[test]
async fn expired_cache_entries_trigger_a_fresh_lookup() {
    let (_upstream, addr) = spawn_upstream("y").await;
    let directory = StubDirectory::with_peers(vec![tunnel_peer("gpu-7", addr, 0.1)]);
    let (state, router) =
        build_router_with_ttl(llm_catalog(18001), directory.clone(), Duration::from_millis(50));
    set_assigned(&state, &[]).await;

    let cli = TestClient::new(combined_routes(state, router.clone()));

    let resp = cli.post("/service/llm-inference/infer").body("a").send().await;
    assert!(resp.0.status().is_success());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = cli.post("/service/llm-inference/infer").body("b").send().await;
    assert!(resp.0.status().is_success());

    let stats = router.stats().await;
    assert_eq!(stats.http_lookups, 2);
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
}

#[test]
async fn unknown_services_surface_503_with_the_available_list() {
    let directory = StubDirectory::unavailable(vec![ServiceName::new("entity-ner")]);
    let (state, router) = build_router(llm_catalog(18001), directory);
    set_assigned(&state, &[]).await;

    let cli = TestClient::new(combined_routes(state, router));
    let resp = cli
        .post("/service/llm-inference/infer")
        .body("x")
        .send()
        .await;
    assert_eq!(resp.0.status().as_u16(), 503);
    let (_, body) = resp.0.into_parts();
    let body: Value = serde_json::from_str(&body.into_string().await.unwrap()).unwrap();
    assert_eq!(body["available_services"][0], "entity-ner");
}

#[test]
async fn unreachable_peer_yields_502_and_counts_a_failure() {
    let dead = tunnel_peer("gpu-9", "127.0.0.1:9".parse().unwrap(), 0.0);
    let directory = StubDirectory::with_peers(vec![dead]);
    let (state, router) = build_router(llm_catalog(18001), directory);
    set_assigned(&state, &[]).await;

    let cli = TestClient::new(combined_routes(state, router.clone()));
    let resp = cli
        .post("/service/llm-inference/infer")
        .body("x")
        .send()
        .await;
    assert_eq!(resp.0.status().as_u16(), 502);

    let stats = router.stats().await;
    assert_eq!(stats.failed_requests, 1);
}
