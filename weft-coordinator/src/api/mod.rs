use crate::bootstrap::Services;
use crate::proxy;
use poem::{EndpointExt, Route};
use poem_openapi::{OpenApiService, Tags};

pub mod admin;
pub mod discovery;
pub mod healthcheck;
pub mod worker;

#[derive(Tags)]
enum ApiTags {
    Worker,
    Admin,
    Discovery,
    HealthCheck,
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
        .at(
            "/service/:service",
            proxy::proxy_service_root.data(services.proxy.clone()),
        )
        .at(
            "/service/:service/*rest",
            proxy::proxy_service.data(services.proxy.clone()),
        )
}

type ApiServices = (
    worker::WorkerApi,
    admin::AdminApi,
    discovery::DiscoveryApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            worker::WorkerApi::new(services),
            admin::AdminApi::new(services),
            discovery::DiscoveryApi::new(services),
            healthcheck::HealthcheckApi::new(services),
        ),
        "Weft Coordinator API",
        "1.0",
    )
}
