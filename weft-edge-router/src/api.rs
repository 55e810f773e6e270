use crate::registry::{CoordinatorRegistry, EdgeRegistryError};
use poem::web::Data;
use poem::{handler, EndpointExt, IntoResponse, Response, Route};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService, Tags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;
use weft_common::model::{
    CoordinatorHeartbeatRequest, DhtBootstrapResponse, ErrorBody, ErrorsBody, HeartbeatResponse,
    RegisterCoordinatorRequest, RegisterCoordinatorResponse,
};

#[derive(Tags)]
enum ApiTags {
    Coordinator,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum RegisterError {
    /// Invalid registration request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Internal error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct EdgeHealth {
    pub status: String,
    pub coordinators: u64,
    /// Seconds since the edge router started.
    pub uptime: u64,
}

#[derive(Clone)]
pub struct EdgeServices {
    pub registry: Arc<CoordinatorRegistry>,
    pub dht_bootstrap_ttl: Duration,
    pub started_at: Instant,
}

/// Register/heartbeat surface for coordinators; mounted under
/// `/api/coordinator`.
pub struct CoordinatorApi {
    services: EdgeServices,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Coordinator)]
impl CoordinatorApi {
    pub fn new(services: EdgeServices) -> Self {
        Self { services }
    }

    /// Register a coordinator
    #[oai(path = "/register", method = "post", operation_id = "register_coordinator")]
    async fn register(
        &self,
        body: Json<RegisterCoordinatorRequest>,
    ) -> Result<Json<RegisterCoordinatorResponse>, RegisterError> {
        match self.services.registry.register(&body.0).await {
            Ok(response) => Ok(Json(response)),
            Err(EdgeRegistryError::InvalidRegistration(errors)) => {
                Err(RegisterError::BadRequest(Json(ErrorsBody { errors })))
            }
            Err(err) => {
                error!(error = %err, "Coordinator registration failed");
                Err(RegisterError::InternalError(Json(ErrorBody {
                    error: "Coordinator registration failed".to_string(),
                })))
            }
        }
    }

    /// Coordinator heartbeat; never answers 5xx
    #[oai(path = "/heartbeat", method = "post", operation_id = "coordinator_heartbeat")]
    async fn heartbeat(&self, body: Json<CoordinatorHeartbeatRequest>) -> Json<HeartbeatResponse> {
        match self
            .services
            .registry
            .heartbeat(&body.0.coordinator_id.0)
            .await
        {
            Ok(true) => Json(HeartbeatResponse::accepted()),
            Ok(false) => Json(HeartbeatResponse::re_register()),
            Err(err) => {
                error!(error = %err, "Coordinator heartbeat failed");
                Json(HeartbeatResponse {
                    ok: false,
                    action: None,
                })
            }
        }
    }
}

#[handler]
pub async fn health(Data(services): Data<&EdgeServices>) -> Response {
    let coordinators = match services.registry.live().await {
        Ok(live) => live.len() as u64,
        Err(_) => 0,
    };
    poem::web::Json(EdgeHealth {
        status: "ok".to_string(),
        coordinators,
        uptime: services.started_at.elapsed().as_secs(),
    })
    .into_response()
}

#[handler]
pub async fn list_coordinators(Data(services): Data<&EdgeServices>) -> Response {
    match services.registry.live().await {
        Ok(live) => {
            let views: Vec<_> = live.iter().map(|record| record.view()).collect();
            poem::web::Json(views).into_response()
        }
        Err(err) => {
            error!(error = %err, "Edge registry query failed");
            internal_error()
        }
    }
}

#[handler]
pub async fn dht_bootstrap(Data(services): Data<&EdgeServices>) -> Response {
    match services.registry.bootstrap_seeds().await {
        Ok(seeds) => poem::web::Json(DhtBootstrapResponse {
            seeds,
            ttl: services.dht_bootstrap_ttl.as_secs(),
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "Edge registry query failed");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    let mut response =
        poem::web::Json(ErrorBody {
            error: "Edge registry query failed".to_string(),
        })
        .into_response();
    response.set_status(poem::http::StatusCode::INTERNAL_SERVER_ERROR);
    response
}

pub fn make_open_api_service(services: EdgeServices) -> OpenApiService<CoordinatorApi, ()> {
    OpenApiService::new(CoordinatorApi::new(services), "Weft Edge Router API", "1.0")
}

/// The edge surface. The router's own paths are registered exactly so
/// that everything else, including `/api/admin/...` and `/service/...`,
/// falls through to the coordinator forwarder.
pub fn combined_routes(
    services: EdgeServices,
    forwarder: Arc<crate::proxy::EdgeForwarder>,
) -> Route {
    let api_service = make_open_api_service(services.clone());
    let ui = api_service.swagger_ui();

    Route::new()
        .at("/health", health.data(services.clone()))
        .nest("/api/coordinator", api_service)
        .at("/api/coordinators", list_coordinators.data(services.clone()))
        .at("/api/dht/bootstrap", dht_bootstrap.data(services))
        .nest("/docs", ui)
        .at("/*path", crate::proxy::forward.data(forwarder))
}
