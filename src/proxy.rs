use std::{convert::Infallible, error::Error as StdError, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    config::Config,
    error::ProxyError,
    matcher, recorder,
    request::{self, NormalizedRequest},
    store::{ExampleStore, FsStore},
};

type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type UpstreamHttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Non-end-to-end headers never forwarded upstream. `host` is re-derived from
/// the target URL and `content-length` from the actual body.
const STRIPPED_REQUEST_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

/// The captured result of one upstream exchange.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The HTTP transport used to reach the remote service. The proxy core only
/// needs "forward a request, get status+headers+body"; everything else about
/// the transport is this collaborator's concern.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &NormalizedRequest) -> Result<CapturedResponse, ProxyError>;
}

/// Production forwarder: hyper legacy client over a rustls HTTPS connector.
/// No retries and no timeouts of its own; a failure is fatal for the request.
pub struct HttpsForwarder {
    client: UpstreamHttpClient,
}

impl HttpsForwarder {
    pub fn new() -> anyhow::Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

#[async_trait::async_trait]
impl Forwarder for HttpsForwarder {
    async fn forward(&self, request: &NormalizedRequest) -> Result<CapturedResponse, ProxyError> {
        let upstream_req = build_upstream_request(request)?;
        let response = self.client.request(upstream_req).await.map_err(|err| {
            ProxyError::TransportFailure {
                reason: err.to_string(),
            }
        })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| ProxyError::TransportFailure {
                reason: format!("read upstream response body: {err}"),
            })?
            .to_bytes();

        Ok(CapturedResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

fn build_upstream_request(
    request: &NormalizedRequest,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let url: Uri = request.url().clone();
    if url.authority().is_none() {
        return Err(ProxyError::TransportFailure {
            reason: format!("request target `{url}` has no host to forward to"),
        });
    }

    let mut upstream_req = Request::builder()
        .method(request.method().clone())
        .uri(url.clone())
        .body(Full::new(request.body().clone()))
        .map_err(|err| ProxyError::TransportFailure {
            reason: format!("build upstream request: {err}"),
        })?;

    let headers = upstream_req.headers_mut();
    for (name, value) in request.headers() {
        if !STRIPPED_REQUEST_HEADERS.contains(name) && name.as_str() != "proxy-connection" {
            headers.append(name.clone(), value.clone());
        }
    }
    set_host_header(headers, &url);

    Ok(upstream_req)
}

fn set_host_header(headers: &mut HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ProxyState {
    forwarder: Arc<dyn Forwarder>,
    store: Arc<dyn ExampleStore>,
    namespace: String,
}

/// Starts the proxy with the production HTTPS forwarder.
pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;
    let forwarder = Arc::new(HttpsForwarder::new()?);
    serve_with(config, forwarder).await
}

/// Starts the proxy with an explicit forwarder. This is the transport seam:
/// the pipeline, store, and recording behavior are identical regardless of
/// how the upstream is reached.
pub async fn serve_with(
    config: &Config,
    forwarder: Arc<dyn Forwarder>,
) -> anyhow::Result<ProxyHandle> {
    let listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.proxy.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(ProxyState {
        forwarder,
        store: Arc::new(FsStore::new(&config.store.path)),
        namespace: config.store.namespace.clone(),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let span = tracing::info_span!(
        "proxy.request",
        method = %req.method(),
        url = %req.uri(),
    );
    Ok(handle_request(req, state).instrument(span).await)
}

/// One request end-to-end: normalize, try the example store, otherwise
/// forward and record. Every error in the taxonomy aborts the exchange; the
/// consumer never receives a response whose recording failed.
async fn handle_request(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read request body failed: {err}");
            return simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    let normalized = request::normalize(parts.method, parts.uri, parts.headers, body);

    match try_example(&state, &normalized).await {
        Ok(Some(descriptor)) => {
            build_response(descriptor.status, descriptor.headers, descriptor.body)
        }
        Ok(None) => forward_and_record(&state, &normalized).await,
        Err(err) => error_response(&err),
    }
}

async fn try_example(
    state: &Arc<ProxyState>,
    normalized: &NormalizedRequest,
) -> Result<Option<crate::example::ResponseDescriptor>, ProxyError> {
    let store = Arc::clone(&state.store);
    let namespace = state.namespace.clone();
    let request = normalized.clone();
    let matched = tokio::task::spawn_blocking(move || {
        matcher::find_match(store.as_ref(), &namespace, &request)
    })
    .await
    .unwrap_or_else(|err| {
        Err(ProxyError::StoreFailure {
            reason: format!("join example scan task: {err}"),
        })
    })?;

    Ok(matched.map(|example| {
        tracing::info!(key = example.key(), "replaying stored example");
        example.into_response()
    }))
}

async fn forward_and_record(
    state: &Arc<ProxyState>,
    normalized: &NormalizedRequest,
) -> Response<ProxyBody> {
    let captured = match state.forwarder.forward(normalized).await {
        Ok(captured) => captured,
        Err(err) => return error_response(&err),
    };

    let store = Arc::clone(&state.store);
    let namespace = state.namespace.clone();
    let request = normalized.clone();
    let response = captured.clone();
    let recorded = tokio::task::spawn_blocking(move || {
        recorder::record(store.as_ref(), &namespace, &request, &response)
    })
    .await
    .unwrap_or_else(|err| {
        Err(ProxyError::StoreFailure {
            reason: format!("join example record task: {err}"),
        })
    });

    match recorded {
        Ok(key) => {
            tracing::info!(key = %key, status = captured.status.as_u16(), "recorded new example");
            build_response(captured.status, captured.headers, captured.body)
        }
        Err(err) => error_response(&err),
    }
}

/// Single choke point for outbound responses, replayed or forwarded: the
/// length header always reflects the bytes actually sent, never an upstream
/// or recorded value.
fn build_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response<ProxyBody> {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut response = Response::new(boxed_full(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    tracing::warn!(kind = err.kind(), "request aborted: {err}");
    simple_response(err.status(), &err.to_string())
}

fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Bytes::from(message.to_owned());
    let mut response = Response::new(boxed_full(body.clone()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}

fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}
