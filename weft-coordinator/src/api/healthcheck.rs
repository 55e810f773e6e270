use crate::api::ApiTags;
use crate::bootstrap::Services;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use weft_common::model::CoordinatorHealth;

pub struct HealthcheckApi {
    services: Services,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::HealthCheck)]
impl HealthcheckApi {
    pub fn new(services: &Services) -> Self {
        Self {
            services: services.clone(),
        }
    }

    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Json<CoordinatorHealth> {
        let workers = self.services.registry.worker_count().await as u64;
        let services_registered = self.services.registry.available_services().await.len() as u64;
        Json(CoordinatorHealth {
            status: "ok".to_string(),
            workers,
            services_registered,
            uptime: self.services.started_at.elapsed().as_secs(),
        })
    }
}
