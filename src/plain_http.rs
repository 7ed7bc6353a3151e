use std::{
    convert::Infallible,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Body as AxumBody,
    response::{IntoResponse, Redirect},
};
use bon::Builder;
use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::{
    admin::HEALTH_PATH,
    http::{HttpClient, Protocol, forward_request, request_host},
};

const RESTART_DELAY: Duration = Duration::from_secs(1);

// Data shared by every request of the plain-HTTP server.
#[derive(Builder)]
pub(crate) struct PlainHttpData {
    // Where requests for IP or `.local` hosts are proxied to. The admin router answers them otherwise.
    local_proxy_address: Option<String>,
    admin: Router,
    client: HttpClient,
}

// Hosts that are only reachable inside the local network.
pub(crate) fn is_local_host(host: &str) -> bool {
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    unbracketed.parse::<IpAddr>().is_ok() || host.ends_with(".local")
}

// Redirect to HTTPS, or serve local hosts directly.
pub(crate) async fn plain_http_handler<B>(
    request: Request<B>,
    peer: SocketAddr,
    data: Arc<PlainHttpData>,
) -> Result<Response<AxumBody>, Infallible>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    <B as hyper::body::Body>::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let host = match request_host(&request) {
        Ok(host) => host,
        Err(error) => return Ok(error.into_response()),
    };
    if !is_local_host(&host) {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        return Ok(Redirect::permanent(&format!("https://{host}{path_and_query}")).into_response());
    }
    // The gateway's own health endpoint is never proxied.
    let proxy_address = data
        .local_proxy_address
        .as_deref()
        .filter(|_| request.uri().path() != HEALTH_PATH);
    let response = match proxy_address {
        Some(address) => {
            match forward_request(request, address, peer, &host, Protocol::Http, &data.client).await
            {
                Ok(response) => response,
                Err(error) => error.into_response(),
            }
        }
        None => match data.admin.clone().oneshot(request.map(AxumBody::new)).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        },
    };
    Ok(response)
}

async fn serve(listener: TcpListener, data: Arc<PlainHttpData>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let data = Arc::clone(&data);
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                plain_http_handler(request, peer, Arc::clone(&data))
            });
            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(%peer, %error, "HTTP connection error.");
            }
        });
    }
}

// Run the plain-HTTP server until cancelled, restarting it whenever it stops.
pub(crate) async fn supervise_plain_http(
    address: SocketAddr,
    data: Arc<PlainHttpData>,
    cancellation_token: CancellationToken,
) {
    loop {
        let result = match TcpListener::bind(address).await {
            Ok(listener) => {
                info!(%address, "Listening for HTTP connections.");
                tokio::select! {
                    _ = cancellation_token.cancelled() => return,
                    result = serve(listener, Arc::clone(&data)) => result,
                }
            }
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            error!(%address, %error, "HTTP server stopped.");
        }
        warn!("Restarting HTTP server in {RESTART_DELAY:?}.");
        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            _ = sleep(RESTART_DELAY) => (),
        }
    }
}
