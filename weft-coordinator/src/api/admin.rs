use crate::api::ApiTags;
use crate::bootstrap::Services;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use weft_common::model::{ServiceGap, ServiceSummary, WorkerView};

/// Read-only introspection; none of these endpoints mutate registry
/// state.
pub struct AdminApi {
    services: Services,
}

#[OpenApi(prefix_path = "/api/admin", tag = ApiTags::Admin)]
impl AdminApi {
    pub fn new(services: &Services) -> Self {
        Self {
            services: services.clone(),
        }
    }

    /// All non-stale worker records
    #[oai(path = "/workers", method = "get", operation_id = "admin_workers")]
    async fn workers(&self) -> Json<Vec<WorkerView>> {
        Json(self.services.registry.list_workers().await)
    }

    /// Per-service health summary
    #[oai(path = "/services", method = "get", operation_id = "admin_services")]
    async fn services(&self) -> Json<Vec<ServiceSummary>> {
        Json(self.services.registry.service_summaries().await)
    }

    /// Coverage gaps, worst first
    #[oai(path = "/gaps", method = "get", operation_id = "admin_gaps")]
    async fn gaps(&self) -> Json<Vec<ServiceGap>> {
        Json(self.services.registry.gaps().await)
    }
}
