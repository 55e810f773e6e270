use poem::listener::{Acceptor, Listener, TcpListener};
use poem::test::TestClient;
use poem::web::Data;
use poem::{handler, Body, EndpointExt, Route};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_r::test;
use weft_common::catalog::{ServiceCatalog, ServiceDescriptor, ServiceTier};
use weft_common::model::{Capabilities, RegisterWorkerRequest, ServiceName, WorkerType};
use weft_coordinator::api::combined_routes;
use weft_coordinator::bootstrap::Services;

test_r::enable!();

struct Upstream {
    name: &'static str,
    hits: AtomicUsize,
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
        hits: AtomicUsize::new(0),
    });
    let app = Route::new().at("/*path", upstream_echo.data(state.clone()));
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

fn llm_catalog() -> ServiceCatalog {
    ServiceCatalog::from_descriptors(vec![ServiceDescriptor {
        name: ServiceName::new("llm-inference"),
        tier: ServiceTier::Gpu,
        requires: WorkerType::Gpu,
        priority: 1,
        port: 18001,
        forward_timeout: Duration::from_secs(5),
    }])
}

fn gpu_request(tunnel_url: String) -> RegisterWorkerRequest {
    RegisterWorkerRequest {
        worker_id: None,
        tunnel_url,
        mesh_ip: None,
        capabilities: Capabilities {
            worker_type: WorkerType::Gpu,
            has_gpu: true,
            gpu_type: None,
            cpu_cores: Some(16),
            ram_gb: Some(64),
            storage_gb: Some(512),
            public_ip: None,
        },
    }
}

#[test]
async fn proxied_requests_reach_a_worker_and_stream_back() {
    let services = Services::for_tests(llm_catalog(), Duration::from_secs(150));
    let (_upstream, addr) = spawn_upstream("a").await;
    services
        .registry
        .register(&gpu_request(format!("http://{addr}")))
        .await
        .unwrap();

    let cli = TestClient::new(combined_routes(&services));
    let resp = cli
        .post("/service/llm-inference/generate")
        .body("prompt")
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let (_, body) = resp.0.into_parts();
    assert_eq!(body.into_string().await.unwrap(), "a:prompt");
}

#[test]
async fn round_robin_is_fair_across_healthy_workers() {
    let services = Services::for_tests(llm_catalog(), Duration::from_secs(150));
    let (upstream_a, addr_a) = spawn_upstream("a").await;
    let (upstream_b, addr_b) = spawn_upstream("b").await;
    services
        .registry
        .register(&gpu_request(format!("http://{addr_a}")))
        .await
        .unwrap();
    services
        .registry
        .register(&gpu_request(format!("http://{addr_b}")))
        .await
        .unwrap();

    let cli = TestClient::new(combined_routes(&services));
    for _ in 0..6 {
        let resp = cli.post("/service/llm-inference/run").body("x").send().await;
        assert!(resp.0.status().is_success());
    }
    assert_eq!(upstream_a.hits.load(Ordering::SeqCst), 3);
    assert_eq!(upstream_b.hits.load(Ordering::SeqCst), 3);
}

#[test]
async fn dead_worker_fails_over_to_the_next_candidate() {
    let services = Services::for_tests(llm_catalog(), Duration::from_secs(150));
    // Reserve a port and close it again so connections are refused.
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (upstream_b, addr_b) = spawn_upstream("b").await;
    services
        .registry
        .register(&gpu_request(format!("http://{dead_addr}")))
        .await
        .unwrap();
    services
        .registry
        .register(&gpu_request(format!("http://{addr_b}")))
        .await
        .unwrap();

    let cli = TestClient::new(combined_routes(&services));
    for _ in 0..2 {
        let resp = cli
            .post("/service/llm-inference/generate")
            .body("fallback")
            .send()
            .await;
        assert!(resp.0.status().is_success());
        let (_, body) = resp.0.into_parts();
        assert_eq!(body.into_string().await.unwrap(), "b:fallback");
    }
    assert_eq!(upstream_b.hits.load(Ordering::SeqCst), 2);
}

#[test]
async fn missing_service_returns_503_with_the_available_list() {
    let services = Services::for_tests(llm_catalog(), Duration::from_secs(150));
    let cli = TestClient::new(combined_routes(&services));

    let resp = cli.post("/service/llm-inference/generate").body("x").send().await;
    assert_eq!(resp.0.status().as_u16(), 503);
    let (_, body) = resp.0.into_parts();
    let body: Value = serde_json::from_str(&body.into_string().await.unwrap()).unwrap();
    assert!(body["available_services"].as_array().unwrap().is_empty());
    assert!(body["error"].as_str().unwrap().contains("llm-inference"));
}

#[test]
async fn all_workers_failing_yields_502() {
    let services = Services::for_tests(llm_catalog(), Duration::from_secs(150));
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    services
        .registry
        .register(&gpu_request(format!("http://{dead_addr}")))
        .await
        .unwrap();

    let cli = TestClient::new(combined_routes(&services));
    let resp = cli.post("/service/llm-inference/generate").body("x").send().await;
    assert_eq!(resp.0.status().as_u16(), 502);
}
