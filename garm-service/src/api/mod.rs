pub mod callback;
pub mod healthcheck;
pub mod metadata;
pub mod webhook;

use std::sync::Arc;

use poem::endpoint::PrometheusExporter;
use poem::{EndpointExt, Route};
use poem_openapi::{OpenApiService, Tags};
use prometheus::Registry;

use crate::auth::InstanceAuthMiddleware;
use crate::bootstrap::Services;
use crate::controller::Controller;

#[derive(Tags)]
pub enum ApiTags {
    /// Endpoints used by booting runner agents.
    Agent,
    HealthCheck,
}

pub fn make_route(
    services: &Services,
    controller: Arc<Controller>,
    prometheus_registry: Registry,
) -> Route {
    let agent_api = OpenApiService::new(
        (
            callback::CallbackApi {
                store: services.store.clone(),
            },
            metadata::MetadataApi {
                store: services.store.clone(),
                clients: services.clients.clone(),
            },
        ),
        "garm agent API",
        crate::VERSION,
    )
    .url_prefix("/api/v1");

    let health_api = OpenApiService::new(healthcheck::HealthcheckApi, "garm", crate::VERSION);

    Route::new()
        .nest(
            "/api/v1",
            agent_api.with(InstanceAuthMiddleware::new(services.token_service.clone())),
        )
        .at(
            "/webhooks",
            poem::post(webhook::handle_webhook).data(controller),
        )
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .nest("/", health_api)
}
