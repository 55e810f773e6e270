use crate::api::ApiTags;
use crate::bootstrap::Services;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApi};
use weft_common::model::{
    AvailableServicesResponse, DiscoverServiceResponse, ServiceName, UnavailableBody,
};

#[derive(ApiResponse, Debug, Clone)]
pub enum DiscoverError {
    /// No healthy worker currently serves the requested service
    #[oai(status = 503)]
    Unavailable(Json<UnavailableBody>),
}

pub struct DiscoveryApi {
    services: Services,
}

#[OpenApi(prefix_path = "/api/services", tag = ApiTags::Discovery)]
impl DiscoveryApi {
    pub fn new(services: &Services) -> Self {
        Self {
            services: services.clone(),
        }
    }

    /// Services with at least one healthy worker
    #[oai(path = "/list", method = "get", operation_id = "list_services")]
    async fn list(&self) -> Json<AvailableServicesResponse> {
        Json(AvailableServicesResponse {
            services: self.services.registry.available_services().await,
        })
    }

    /// Healthy workers for one service, with a load-based recommendation
    #[oai(
        path = "/discover/:service",
        method = "get",
        operation_id = "discover_service"
    )]
    async fn discover(
        &self,
        service: Path<String>,
    ) -> Result<Json<DiscoverServiceResponse>, DiscoverError> {
        let service = ServiceName::new(service.0);
        let workers = self.services.registry.find_by_service(&service).await;
        if workers.is_empty() {
            let available_services = self.services.registry.available_services().await;
            return Err(DiscoverError::Unavailable(Json(UnavailableBody {
                error: format!("No healthy workers for service {service}"),
                available_services,
            })));
        }
        let recommended = workers
            .iter()
            .min_by(|a, b| a.load.total_cmp(&b.load))
            .map(|peer| peer.worker_id.clone())
            .unwrap_or_else(|| workers[0].worker_id.clone());
        Ok(Json(DiscoverServiceResponse {
            service,
            workers,
            recommended,
        }))
    }
}
