#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora::services::{background::background_service, listening::Service};
use pingora_core::{
    apps::HttpServerOptions,
    listeners::tls::TlsSettings,
    server::{configuration::Opt, Server},
};
use pingora_proxy::{http_proxy_service_with_name, HttpProxy};
use sentry::IntoDsn;

use pinggate::{
    config::{self, Config, Tls},
    core::ServiceContainer,
    logging::Logger,
    service::http::GatewayService,
};

const GATEWAY_SERVICE: &str = "pinggate";

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.gateway.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        None
    };

    // Build every component up front; configuration errors are fatal
    let container = match ServiceContainer::from_config(&config) {
        Ok(container) => Arc::new(container),
        Err(e) => {
            eprintln!("Failed to initialize gateway: {e}");
            std::process::exit(1);
        }
    };

    let mut gateway_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        gateway_server.add_service(log_service);
    }

    let mut http_service = http_proxy_service_with_name(
        &gateway_server.configuration,
        GatewayService::new(container.clone()),
        GATEWAY_SERVICE,
    );

    log::info!("Adding listeners...");
    if let Err(e) = add_listeners(&mut http_service, &config.gateway) {
        eprintln!("Failed to add listeners: {e}");
        std::process::exit(1);
    }

    log::info!("Adding health monitor service...");
    gateway_server.add_service(background_service(
        "health monitor",
        container.health.clone(),
    ));

    add_optional_services(&mut gateway_server, &config.gateway);

    log::info!("Bootstrapping...");
    gateway_server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    gateway_server.add_service(http_service);

    log::info!("Starting Server...");
    gateway_server.run_forever();
}

/// Adds the configured TCP and TLS listeners to the proxy service.
fn add_listeners(
    http_service: &mut Service<HttpProxy<GatewayService>>,
    cfg: &config::Gateway,
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in cfg.listeners.iter() {
        match &list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path)?;
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    let http_logic = http_service
                        .app_logic_mut()
                        .ok_or("Failed to get app logic")?;
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }
    Ok(())
}

/// Adds Sentry and the Prometheus scrape listener when configured.
fn add_optional_services(server: &mut Server, cfg: &config::Gateway) {
    if let Some(sentry_cfg) = &cfg.sentry {
        log::info!("Adding Sentry config...");
        match sentry_cfg.dsn.clone().into_dsn() {
            Ok(Some(dsn)) => {
                server.sentry = Some(sentry::ClientOptions {
                    dsn: Some(dsn),
                    ..Default::default()
                });
            }
            Ok(None) => log::warn!("Sentry DSN is empty or invalid, Sentry disabled."),
            Err(e) => log::error!("Error parsing Sentry DSN: {e}"),
        }
    }

    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }
}
