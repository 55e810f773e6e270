use poem::listener::{Acceptor, Listener, TcpListener};
use poem::test::TestClient;
use poem::web::Data;
use poem::{handler, EndpointExt, Route};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_r::test;
use weft_edge_router::api::{combined_routes, EdgeServices};
use weft_edge_router::config::DbConfig;
use weft_edge_router::db;
use weft_edge_router::proxy::EdgeForwarder;
use weft_edge_router::registry::CoordinatorRegistry;
use weft_edge_router::repo::DbCoordinatorRepo;

test_r::enable!();

struct Upstream {
    name: &'static str,
    hits: AtomicU64,
}

#[handler]
async fn upstream_echo(Data(state): Data<&Arc<Upstream>>) -> String {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.name.to_string()
}

async fn spawn_upstream(name: &'static str) -> (Arc<Upstream>, SocketAddr) {
    let state = Arc::new(Upstream {
        name,
        hits: AtomicU64::new(0),
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

async fn edge_client(
    coordinator_ttl: Duration,
) -> (TestClient<Route>, Arc<CoordinatorRegistry>) {
    let pool = db::connect_and_migrate(&DbConfig {
        database: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .expect("in-memory sqlite must open");
    let repo = Arc::new(DbCoordinatorRepo::new(pool));
    let registry = Arc::new(CoordinatorRegistry::new(
        repo,
        coordinator_ttl,
        Duration::from_secs(60),
    ));
    let forwarder = Arc::new(EdgeForwarder::new(
        registry.clone(),
        2,
        Duration::from_secs(5),
    ));
    let services = EdgeServices {
        registry: registry.clone(),
        dht_bootstrap_ttl: Duration::from_secs(300),
        started_at: Instant::now(),
    };
    (
        TestClient::new(combined_routes(services, forwarder)),
        registry,
    )
}

async fn response_json(resp: poem::test::TestResponse) -> Value {
    let (_, body) = resp.0.into_parts();
    let body = body.into_string().await.expect("body must be readable");
    serde_json::from_str(&body).expect("body must be JSON")
}

fn register_body(id: &str, addr: SocketAddr) -> Value {
    json!({
        "coordinator_id": id,
        "tunnel_url": format!("http://{addr}"),
        "location": null,
        "dht_port": null
    })
}

#[test]
async fn coordinators_register_and_appear_live() {
    let (cli, _) = edge_client(Duration::from_secs(300)).await;
    let (_, addr) = spawn_upstream("alpha").await;

    let resp = cli
        .post("/api/coordinator/register")
        .body_json(&register_body("alpha", addr))
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let registered = response_json(resp).await;
    assert_eq!(registered["coordinator_id"], "alpha");
    assert_eq!(registered["heartbeat_interval"], 60);

    let resp = cli.get("/api/coordinators").send().await;
    let live = response_json(resp).await;
    assert_eq!(live.as_array().unwrap().len(), 1);
    assert_eq!(live[0]["coordinator_id"], "alpha");

    let resp = cli.get("/health").send().await;
    let health = response_json(resp).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["coordinators"], 1);
}

#[test]
async fn unmatched_requests_are_forwarded_to_live_coordinators() {
    let (cli, _) = edge_client(Duration::from_secs(300)).await;
    let (upstream_a, addr_a) = spawn_upstream("alpha").await;
    let (upstream_b, addr_b) = spawn_upstream("beta").await;

    for (id, addr) in [("alpha", addr_a), ("beta", addr_b)] {
        let resp = cli
            .post("/api/coordinator/register")
            .body_json(&register_body(id, addr))
            .send()
            .await;
        assert!(resp.0.status().is_success());
    }

    for _ in 0..4 {
        let resp = cli.get("/api/admin/stats").send().await;
        assert!(resp.0.status().is_success());
    }
    assert_eq!(upstream_a.hits.load(Ordering::SeqCst), 2);
    assert_eq!(upstream_b.hits.load(Ordering::SeqCst), 2);
}

#[test]
async fn stale_coordinators_stop_receiving_traffic() {
    let (cli, _) = edge_client(Duration::from_millis(500)).await;
    let (upstream_a, addr_a) = spawn_upstream("alpha").await;
    let (upstream_b, addr_b) = spawn_upstream("beta").await;

    for (id, addr) in [("alpha", addr_a), ("beta", addr_b)] {
        let resp = cli
            .post("/api/coordinator/register")
            .body_json(&register_body(id, addr))
            .send()
            .await;
        assert!(resp.0.status().is_success());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Only beta keeps heart-beating.
    let resp = cli
        .post("/api/coordinator/heartbeat")
        .body_json(&json!({"coordinator_id": "beta"}))
        .send()
        .await;
    assert!(resp.0.status().is_success());

    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..3 {
        let resp = cli.get("/service/llm-inference/generate").send().await;
        assert!(resp.0.status().is_success());
    }
    assert_eq!(upstream_a.hits.load(Ordering::SeqCst), 0);
    assert_eq!(upstream_b.hits.load(Ordering::SeqCst), 3);

    // Once beta goes quiet too, the edge router has nothing to offer.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let resp = cli.get("/service/llm-inference/generate").send().await;
    assert_eq!(resp.0.status().as_u16(), 503);
}

#[test]
async fn heartbeat_of_unknown_coordinator_requests_re_registration() {
    let (cli, _) = edge_client(Duration::from_secs(300)).await;

    let resp = cli
        .post("/api/coordinator/heartbeat")
        .body_json(&json!({"coordinator_id": "ghost"}))
        .send()
        .await;
    assert!(resp.0.status().is_success());
    let heartbeat = response_json(resp).await;
    assert_eq!(heartbeat["ok"], false);
    assert_eq!(heartbeat["action"], "re-register");
}

#[test]
async fn bootstrap_seeds_are_the_live_coordinator_urls() {
    let (cli, _) = edge_client(Duration::from_secs(300)).await;
    let (_, addr) = spawn_upstream("alpha").await;

    let resp = cli
        .post("/api/coordinator/register")
        .body_json(&register_body("alpha", addr))
        .send()
        .await;
    assert!(resp.0.status().is_success());

    let resp = cli.get("/api/dht/bootstrap").send().await;
    let bootstrap = response_json(resp).await;
    assert_eq!(bootstrap["ttl"], 300);
    assert_eq!(
        bootstrap["seeds"][0],
        format!("http://{addr}")
    );
}

#[test]
async fn registration_without_tunnel_url_is_rejected() {
    let (cli, _) = edge_client(Duration::from_secs(300)).await;

    let resp = cli
        .post("/api/coordinator/register")
        .body_json(&json!({"coordinator_id": "x", "tunnel_url": ""}))
        .send()
        .await;
    assert_eq!(resp.0.status().as_u16(), 400);
}
