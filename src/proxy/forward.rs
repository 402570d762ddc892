use std::time::Duration;

use actix_web::{
    HttpRequest, HttpResponse, ResponseError,
    http::{
        StatusCode,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    web,
};
use futures_util::TryStreamExt;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::api::validation::ErrorResponse;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Headers regenerated by each hop
fn is_regenerated(name: &str) -> bool {
    name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length")
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream {hop} unreachable: {source}")]
    Unreachable {
        hop: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream {hop} did not respond within {after:?}")]
    Timeout { hop: &'static str, after: Duration },

    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Transport failures, as opposed to requests that can never succeed
    pub fn is_transport(&self) -> bool {
        matches!(self, ProxyError::Unreachable { .. } | ProxyError::Timeout { .. })
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        error!("Forwarding failed: {}", self);
        let summary = match self {
            ProxyError::InvalidRequest(_) => "Bad request",
            _ => "Upstream unavailable",
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse::message(summary, self.to_string()))
    }
}

/// The next hop of the chain: an address, a wait bound and a pooled client
///
/// Holds no per-request state; one instance serves every request concurrently.
#[derive(Debug, Clone)]
pub struct Upstream {
    hop: &'static str,
    base_url: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl Upstream {
    pub fn new(hop: &'static str, base_url: Url, timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            hop,
            base_url,
            timeout,
            client,
        })
    }

    pub fn hop(&self) -> &'static str {
        self.hop
    }

    /// Upstream URL for `path`, keeping any path prefix of the base URL
    pub fn target_url(&self, path: &str, query: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = self.base_url.path().trim_end_matches('/');
        url.set_path(&format!("{}/{}", base_path, path.trim_start_matches('/')));
        url.set_query(if query.is_empty() { None } else { Some(query) });
        url
    }

    /// Send one request upstream and wait at most `timeout` for its response head
    ///
    /// Never retries: whether a retry is safe is the caller's decision.
    pub async fn send(
        &self,
        req: &HttpRequest,
        path: &str,
        body: web::Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        let url = self.target_url(path, req.query_string());
        debug!("Forwarding {} {} to {}", method, req.path(), self.hop);

        let request = self
            .client
            .request(method, url)
            .headers(outbound_headers(req.headers()))
            .body(body);

        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) if source.is_timeout() => Err(ProxyError::Timeout {
                hop: self.hop,
                after: self.timeout,
            }),
            Ok(Err(source)) => Err(ProxyError::Unreachable { hop: self.hop, source }),
            Err(_) => Err(ProxyError::Timeout {
                hop: self.hop,
                after: self.timeout,
            }),
        }
    }
}

/// Copy request headers for the next hop, dropping connection-scoped ones
pub fn outbound_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut outbound = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || is_regenerated(name.as_str()) {
            continue;
        }
        match (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => {
                outbound.append(name, value);
            }
            _ => warn!("Dropping unforwardable request header {}", name),
        }
    }
    outbound
}

/// Relay an upstream response unchanged: status, headers and a streamed body
pub fn relay_response(response: reqwest::Response) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);

    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => {
                builder.append_header((name, value));
            }
            _ => warn!("Dropping unforwardable response header {}", name),
        }
    }

    let body = response
        .bytes_stream()
        .inspect_err(|e| error!("Upstream body stream failed: {}", e));
    builder.streaming(body)
}

/// A pass-through pipeline stage: forward the request and relay the response
pub async fn pass_through(
    upstream: web::Data<Upstream>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let response = upstream.send(&req, req.path(), body).await?;
    Ok(relay_response(response))
}

/// Local liveness check for a proxy hop; never forwarded
pub async fn healthz(upstream: web::Data<Upstream>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "alive",
        "upstream": upstream.hop(),
    }))
}

/// Routes of a pass-through hop: local `/healthz`, everything else forwarded
pub fn pass_through_config(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .default_service(web::to(pass_through));
}
