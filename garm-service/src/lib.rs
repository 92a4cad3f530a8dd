pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod forge;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod runner;
pub mod scaleset;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use poem::listener::{Acceptor, Listener};
use prometheus::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bootstrap::Services;
use crate::config::GarmServiceConfig;
use crate::controller::Controller;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct RunDetails {
    pub http_port: u16,
}

pub struct GarmService {
    config: GarmServiceConfig,
    prometheus_registry: Registry,
    services: Services,
    controller: Arc<Controller>,
    cancel: CancellationToken,
}

impl GarmService {
    pub async fn new(
        config: GarmServiceConfig,
        prometheus_registry: Registry,
        cancel: CancellationToken,
    ) -> Result<Self, anyhow::Error> {
        debug!("Initializing garm service");

        let services = Services::new(&config)
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;

        let controller = Arc::new(Controller::new(
            services.store.clone(),
            config.clone(),
            services.clients.clone(),
            services.scale_set_clients.clone(),
            services.providers.clone(),
            services.token_service.clone(),
            services.controller_info.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            prometheus_registry,
            services,
            controller,
            cancel,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller.clone()
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        self.controller
            .start()
            .await
            .map_err(|e| anyhow!(e).context("Controller startup"))?;

        let controller = self.controller.clone();
        join_set.spawn(async move {
            controller.run().await;
            Ok(())
        });

        let http_port = self.start_http_server(join_set).await?;

        info!("Started garm service on port {http_port}");
        Ok(RunDetails { http_port })
    }

    async fn start_http_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        let app = api::make_route(
            &self.services,
            self.controller.clone(),
            self.prometheus_registry.clone(),
        );

        let poem_listener = poem::listener::TcpListener::bind(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.http_port),
        );
        let acceptor = poem_listener
            .into_acceptor()
            .await
            .context("binding the HTTP listener")?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("socket address")
            .port();

        let cancel = self.cancel.clone();
        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(
                    app,
                    cancel.cancelled(),
                    Some(Duration::from_secs(10)),
                )
                .await
                .map_err(|e| e.into())
        });

        Ok(port)
    }
}
