use actix_web::{App, HttpServer, dev::Server, web};
use tracing::info;

use super::forward::{Upstream, pass_through_config};
use crate::config::HopConfig;

/// Bind the bridge proxy in front of the execution service
pub fn run(config: &HopConfig) -> std::io::Result<Server> {
    let upstream = Upstream::new("execution-service", config.upstream_url.clone(), config.upstream_timeout)
        .map_err(std::io::Error::other)?;
    let max_payload_size = config.server.max_payload_size;

    info!("Bridge forwarding to {} (timeout {:?})", config.upstream_url, config.upstream_timeout);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(upstream.clone()))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .configure(pass_through_config)
    })
    .bind(&config.server.bind_addr)?
    .run();

    info!("Bridge listening on http://{}", config.server.bind_addr);
    Ok(server)
}
