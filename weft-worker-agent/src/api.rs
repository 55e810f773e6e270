use crate::agent::AgentState;
use crate::router::{FingerCacheRouter, RouterStatsView};
use poem::web::{Data, Path};
use poem::{handler, Body, EndpointExt, Request, Response, Route};
use poem_openapi::payload::Json;
use poem_openapi::{OpenApi, OpenApiService, Tags};
use std::sync::Arc;
use weft_common::model::AgentHealth;

#[derive(Tags)]
enum ApiTags {
    HealthCheck,
    Routing,
}

pub struct HealthcheckApi {
    state: Arc<AgentState>,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::HealthCheck)]
impl HealthcheckApi {
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Json<AgentHealth> {
        Json(AgentHealth {
            status: self.state.reported_status().await,
            worker_id: self.state.worker_id.read().await.clone(),
            mesh_ip: self.state.mesh_ip.clone(),
            services: self.state.assigned.read().await.iter().cloned().collect(),
            uptime: self.state.started_at.elapsed().as_secs(),
        })
    }
}

pub struct StatsApi {
    router: Arc<FingerCacheRouter>,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Routing)]
impl StatsApi {
    /// Routing statistics of this worker's request router
    #[oai(path = "/stats", method = "get", operation_id = "stats")]
    async fn stats(&self) -> Json<RouterStatsView> {
        Json(self.router.stats().await)
    }
}

#[handler]
async fn dispatch_service(
    request: &Request,
    body: Body,
    Path((service, rest)): Path<(String, String)>,
    Data(router): Data<&Arc<FingerCacheRouter>>,
) -> Response {
    router.handle(&service, &rest, request, body).await
}

#[handler]
async fn dispatch_service_root(
    request: &Request,
    body: Body,
    Path(service): Path<String>,
    Data(router): Data<&Arc<FingerCacheRouter>>,
) -> Response {
    router.handle(&service, "", request, body).await
}

type ApiServices = (HealthcheckApi, StatsApi);

pub fn make_open_api_service(
    state: Arc<AgentState>,
    router: Arc<FingerCacheRouter>,
) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (HealthcheckApi { state }, StatsApi { router }),
        "Weft Worker Agent API",
        "1.0",
    )
}

pub fn combined_routes(state: Arc<AgentState>, router: Arc<FingerCacheRouter>) -> Route {
    let api_service = make_open_api_service(state, router.clone());

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
        .at(
            "/service/:service",
            dispatch_service_root.data(router.clone()),
        )
        .at("/service/:service/*rest", dispatch_service.data(router))
}
