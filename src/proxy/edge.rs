use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, web};
use thiserror::Error;
use tracing::{info, warn};

use super::forward::{Upstream, pass_through_config};
use crate::config::{EdgeConfig, TlsPaths};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Build the server-side TLS configuration from PEM files
pub fn load_tls_config(paths: &TlsPaths) -> Result<rustls::ServerConfig, TlsError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TlsError::Io { path, source }
    };

    let certs = rustls_pemfile::certs(&mut open(&paths.cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(&paths.cert))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(paths.cert.clone()));
    }

    let key = rustls_pemfile::private_key(&mut open(&paths.key)?)
        .map_err(io_error(&paths.key))?
        .ok_or_else(|| TlsError::NoPrivateKey(paths.key.clone()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(config)
}

/// Bind the public edge terminator in front of the gateway
///
/// Serves HTTPS when a certificate is configured and plain HTTP otherwise.
pub fn run(config: &EdgeConfig) -> std::io::Result<Server> {
    let hop = &config.hop;
    let upstream = Upstream::new("gateway", hop.upstream_url.clone(), hop.upstream_timeout)
        .map_err(std::io::Error::other)?;
    let max_payload_size = hop.server.max_payload_size;

    info!("Edge forwarding to {} (timeout {:?})", hop.upstream_url, hop.upstream_timeout);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(upstream.clone()))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .configure(pass_through_config)
    });

    let server = match &config.tls {
        Some(paths) => {
            let tls = load_tls_config(paths).map_err(std::io::Error::other)?;
            info!("Edge listening on https://{}", hop.server.bind_addr);
            server.bind_rustls_0_23(&hop.server.bind_addr, tls)?
        }
        None => {
            warn!("No TLS certificate configured, edge serving plain HTTP on {}", hop.server.bind_addr);
            server.bind(&hop.server.bind_addr)?
        }
    };

    Ok(server.run())
}
