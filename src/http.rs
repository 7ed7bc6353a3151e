use std::{convert::Infallible, error::Error, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Router,
    body::Body as AxumBody,
    response::{IntoResponse, Redirect},
};
use bon::Builder;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Uri, Version,
    header::{CONNECTION, HOST, STRICT_TRANSPORT_SECURITY, TE, TRAILER, TRANSFER_ENCODING, UPGRADE},
    uri::{Authority, PathAndQuery, Scheme},
};
use hyper::{Request, Response, StatusCode, body::Body, upgrade::OnUpgrade};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use tokio::io::copy_bidirectional;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::routes::{RouteKind, RouteTable, normalize_host};

const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
const X_REAL_IP: &str = "X-Real-IP";
const KEEP_ALIVE: &str = "Keep-Alive";
const PROXY_CONNECTION: &str = "Proxy-Connection";

pub(crate) const HSTS_VALUE: &str = "max-age=15552000; includeSubDomains";

// Destination for proxy requests whose target can't be used, so that they never reach a
// host chosen by the client.
pub(crate) const LOCAL_SINK: &str = "127.0.0.1:9";

pub(crate) type HttpClient = Client<HttpConnector, AxumBody>;

pub(crate) fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Invalid Host header")]
    InvalidHostHeader,
    #[error("Handler not found")]
    HandlerNotFound,
    #[error("Invalid upstream URI: {0}")]
    InvalidUri(#[from] http::Error),
    #[error("Backend error: {0}")]
    Backend(#[from] hyper_util::client::legacy::Error),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        debug!(error = %self, "HTTP proxy error.");
        match self {
            HttpError::MissingHostHeader | HttpError::InvalidHostHeader => StatusCode::BAD_REQUEST,
            HttpError::HandlerNotFound => StatusCode::NOT_FOUND,
            HttpError::InvalidUri(_) | HttpError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
        .into_response()
    }
}

// Scheme that the client used to reach the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http,
    Https,
}

impl Protocol {
    fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

// Data shared by every request of the virtual-host proxy.
#[derive(Builder)]
pub(crate) struct ProxyData {
    routes: Arc<RouteTable>,
    // Router for hosts routed to `home`.
    admin: Router,
    client: HttpClient,
}

// Host of the request, without port or trailing dot.
pub(crate) fn request_host<B>(request: &Request<B>) -> Result<String, HttpError> {
    let host = match request.headers().get(HOST) {
        Some(header) => header.to_str().map_err(|_| HttpError::InvalidHostHeader)?,
        None => request.uri().host().ok_or(HttpError::MissingHostHeader)?,
    };
    let authority: Authority = host.parse().map_err(|_| HttpError::InvalidHostHeader)?;
    let host = normalize_host(authority.host());
    if host.is_empty() {
        return Err(HttpError::InvalidHostHeader);
    }
    Ok(host)
}

// Dispatch a request received over HTTPS according to the routing table.
pub(crate) async fn proxy_handler<B>(
    request: Request<B>,
    peer: SocketAddr,
    proxy_data: Arc<ProxyData>,
) -> Result<Response<AxumBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    <B as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let timer = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = match proxy_handler_inner(request, peer, &proxy_data).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    debug!(
        status = response.status().as_u16(),
        %method,
        %path,
        %peer,
        elapsed = ?timer.elapsed(),
        "HTTPS request."
    );
    Ok(response)
}

async fn proxy_handler_inner<B>(
    request: Request<B>,
    peer: SocketAddr,
    proxy_data: &ProxyData,
) -> Result<Response<AxumBody>, HttpError>
where
    B: Body<Data = Bytes> + Send + 'static,
    <B as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let host = request_host(&request)?;
    let route = proxy_data
        .routes
        .get(&host)
        .ok_or(HttpError::HandlerNotFound)?;
    match (route.kind(), route.destination()) {
        (RouteKind::Home, _) => {
            let request = request.map(AxumBody::new);
            let response = match proxy_data.admin.clone().oneshot(request).await {
                Ok(response) => response,
                Err(infallible) => match infallible {},
            };
            Ok(response)
        }
        (RouteKind::Redirect, Some(destination)) => {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(PathAndQuery::as_str)
                .unwrap_or("/");
            Ok(Redirect::temporary(&format!("https://{destination}{path_and_query}")).into_response())
        }
        (_, destination) => {
            let mut response = match forward_request(
                request,
                destination.unwrap_or_default(),
                peer,
                &host,
                Protocol::Https,
                &proxy_data.client,
            )
            .await
            {
                Ok(response) => response,
                Err(error) => error.into_response(),
            };
            response.headers_mut().insert(
                STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS_VALUE),
            );
            Ok(response)
        }
    }
}

// Protocol the client asks to switch to, if it sent both `Connection: upgrade` and `Upgrade`.
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

// Copy data between both halves of an upgraded connection once they are available.
async fn splice_upgraded(client: OnUpgrade, backend: OnUpgrade, host: String) {
    match tokio::try_join!(client, backend) {
        Ok((client, backend)) => {
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            if let Err(error) = copy_bidirectional(&mut client, &mut backend).await {
                debug!(%host, %error, "Upgraded connection closed.");
            }
        }
        Err(error) => warn!(%host, %error, "Unable to upgrade proxied connection."),
    }
}

// Send the request to a plain-HTTP backend, returning its response.
//
// Upgrade requests keep their `Upgrade` header, and the connection is spliced to the
// backend once it answers 101 with the same protocol.
pub(crate) async fn forward_request<B>(
    mut request: Request<B>,
    destination: &str,
    peer: SocketAddr,
    host: &str,
    protocol: Protocol,
    client: &HttpClient,
) -> Result<Response<AxumBody>, HttpError>
where
    B: Body<Data = Bytes> + Send + 'static,
    <B as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let upgrade = requested_upgrade(request.headers());
    let client_upgrade = upgrade
        .is_some()
        .then(|| hyper::upgrade::on(&mut request));
    let (mut parts, body) = request.into_parts();
    let authority = match destination.parse::<Authority>() {
        Ok(authority) if !destination.is_empty() => authority,
        _ => {
            warn!(%destination, %host, "Unusable proxy destination, using local sink.");
            Authority::from_static(LOCAL_SINK)
        }
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?;
    parts.version = Version::HTTP_11;
    let headers = &mut parts.headers;
    for header in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(header);
    }
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);
    if let Some(protocol) = &upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol.clone());
    }
    // Never trust forwarding headers sent by the client.
    headers.remove(X_FORWARDED_FOR);
    headers.remove(X_REAL_IP);
    if let Ok(ip) = HeaderValue::from_str(&peer.ip().to_canonical().to_string()) {
        headers.insert(X_FORWARDED_FOR, ip);
    }
    if let Ok(host) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(protocol.as_str()),
    );
    let request = Request::from_parts(parts, AxumBody::new(body));
    let mut response = client.request(request).await?;
    if let (Some(client_upgrade), Some(protocol)) = (client_upgrade, upgrade) {
        let accepted = response.status() == StatusCode::SWITCHING_PROTOCOLS
            && response
                .headers()
                .get(UPGRADE)
                .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(protocol.as_bytes()));
        if accepted {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(splice_upgraded(
                client_upgrade,
                backend_upgrade,
                host.to_owned(),
            ));
        }
    }
    Ok(response.map(AxumBody::new))
}
