use crate::api::ApiTags;
use crate::bootstrap::Services;
use crate::model::{HeartbeatOutcome, RegistryError};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use weft_common::model::{
    ErrorBody, ErrorsBody, HeartbeatResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    WorkerHeartbeatRequest, WorkerId,
};

#[derive(ApiResponse, Debug, Clone)]
pub enum RegisterError {
    /// Invalid registration request, with the list of detected issues
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// The requested worker id belongs to a live worker
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
}

impl From<RegistryError> for RegisterError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::InvalidRegistration(errors) => {
                RegisterError::BadRequest(Json(ErrorsBody { errors }))
            }
            RegistryError::IdCollision(_) => RegisterError::Conflict(Json(ErrorBody {
                error: value.to_string(),
            })),
        }
    }
}

#[derive(ApiResponse, Debug, Clone)]
pub enum HeartbeatError {
    /// Malformed heartbeat
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct DeregisterRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct DeregisterResponse {
    pub ok: bool,
}

pub struct WorkerApi {
    services: Services,
}

#[OpenApi(prefix_path = "/api/worker", tag = ApiTags::Worker)]
impl WorkerApi {
    pub fn new(services: &Services) -> Self {
        Self {
            services: services.clone(),
        }
    }

    /// Register a worker
    ///
    /// Inserts or refreshes the worker record, runs the assignment policy
    /// and returns the authoritative worker id together with the set of
    /// services the worker should launch.
    #[oai(path = "/register", method = "post", operation_id = "register_worker")]
    async fn register(
        &self,
        body: Json<RegisterWorkerRequest>,
    ) -> Result<Json<RegisterWorkerResponse>, RegisterError> {
        let span = info_span!(
            "register_worker",
            requested_id = body.0.worker_id.as_ref().map(|id| id.0.as_str())
        );
        async {
            let registration = self.services.registry.register(&body.0).await?;
            Ok(Json(RegisterWorkerResponse {
                worker_id: registration.worker_id,
                assigned_services: registration.assigned_services,
                heartbeat_interval: self.services.heartbeat_interval.as_secs(),
                coordinator_id: self.services.coordinator_id.clone(),
                dht_seeds: if self.services.dht_seeds.is_empty() {
                    None
                } else {
                    Some(self.services.dht_seeds.clone())
                },
            }))
        }
        .instrument(span)
        .await
    }

    /// Worker heartbeat
    ///
    /// Refreshes liveness and load. An unknown or expired worker id gets
    /// `{ok: false, action: "re-register"}` instead of an error; the
    /// worker is expected to go through registration again.
    #[oai(path = "/heartbeat", method = "post", operation_id = "worker_heartbeat")]
    async fn heartbeat(
        &self,
        body: Json<WorkerHeartbeatRequest>,
    ) -> Result<Json<HeartbeatResponse>, HeartbeatError> {
        if let Err(reason) = body.0.validate() {
            return Err(HeartbeatError::BadRequest(Json(ErrorBody {
                error: reason,
            })));
        }
        let outcome = self.services.registry.heartbeat(&body.0).await;
        match outcome {
            HeartbeatOutcome::Accepted => Ok(Json(HeartbeatResponse::accepted())),
            HeartbeatOutcome::Unknown => Ok(Json(HeartbeatResponse::re_register())),
        }
    }

    /// Deregister a worker
    ///
    /// Explicit removal on clean shutdown; absent ids are not an error.
    #[oai(path = "/deregister", method = "post", operation_id = "deregister_worker")]
    async fn deregister(&self, body: Json<DeregisterRequest>) -> Json<DeregisterResponse> {
        let removed = self.services.registry.deregister(&body.0.worker_id).await;
        Json(DeregisterResponse { ok: removed })
    }
}
