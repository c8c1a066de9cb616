use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, StatusCode,
    header::{self, HeaderValue},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tempfile::TempDir;

use collectproxy::{
    config::Config,
    error::ProxyError,
    example::{BodyFormat, MatchRule, StoredExample, StoredResponse, StoredValue, url_pattern},
    proxy::{CapturedResponse, Forwarder, ProxyHandle},
    request::NormalizedRequest,
    store::{ExampleStore as _, FsStore},
};

const SCENARIO_KEY: &str = "examples/response/example/GET users.inc";

/// In-process transport stand-in: counts forwarding calls, remembers the
/// forwarded URLs, and answers with a canned upstream response.
struct CountingForwarder {
    calls: AtomicUsize,
    forwarded_urls: Mutex<Vec<String>>,
    response: CapturedResponse,
}

impl CountingForwarder {
    fn json_ok(body: &'static str) -> Arc<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        // Deliberately stale; the proxy must recompute it.
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert("x-upstream", HeaderValue::from_static("ok"));
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            forwarded_urls: Mutex::new(Vec::new()),
            response: CapturedResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(body.as_bytes()),
            },
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn forwarded_urls(&self) -> Vec<String> {
        self.forwarded_urls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Forwarder for CountingForwarder {
    async fn forward(&self, request: &NormalizedRequest) -> Result<CapturedResponse, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.forwarded_urls.lock().unwrap().push(request.full_url());
        Ok(self.response.clone())
    }
}

struct FailingForwarder;

#[async_trait::async_trait]
impl Forwarder for FailingForwarder {
    async fn forward(&self, _request: &NormalizedRequest) -> Result<CapturedResponse, ProxyError> {
        Err(ProxyError::TransportFailure {
            reason: "connection refused".to_owned(),
        })
    }
}

async fn spawn_proxy(store_dir: &Path, forwarder: Arc<dyn Forwarder>) -> ProxyHandle {
    let config_toml = format!(
        r#"
[proxy]
listen = "127.0.0.1:0"

[store]
path = "{}"
"#,
        store_dir.display()
    );
    let config = Config::from_toml_str(&config_toml).unwrap();
    collectproxy::proxy::serve_with(&config, forwarder)
        .await
        .unwrap()
}

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

fn proxied_request(
    proxy: &ProxyHandle,
    method: Method,
    path_and_query: &str,
    host: &'static str,
) -> Request<Full<Bytes>> {
    let uri = format!("http://{}{path_and_query}", proxy.listen_addr);
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, HeaderValue::from_static(host))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn write_unit(store_dir: &Path, key: &str, method: &str, pattern: &str, body: &str) {
    let unit = StoredExample {
        when: MatchRule {
            method: method.to_owned(),
            url_pattern: pattern.to_owned(),
        },
        response: StoredResponse {
            status: 200,
            headers: vec![(
                "content-type".to_owned(),
                StoredValue::Text("application/json".to_owned()),
            )],
            body: StoredValue::Text(body.to_owned()),
            format: BodyFormat::Json,
        },
    };
    FsStore::new(store_dir)
        .write_new(key, &serde_json::to_vec_pretty(&unit).unwrap())
        .unwrap();
}

#[tokio::test]
async fn miss_forwards_once_records_and_then_replays_without_forwarding() {
    let store_dir = TempDir::new().unwrap();
    let forwarder = CountingForwarder::json_ok(r#"{"id":42}"#);
    let proxy = spawn_proxy(store_dir.path(), Arc::clone(&forwarder) as Arc<dyn Forwarder>).await;
    let client = client();

    // First request: empty store, so the exchange is forwarded and recorded.
    let res = client
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(header::CONTENT_LENGTH).unwrap(),
        &HeaderValue::from_static("9")
    );
    assert_eq!(
        res.headers().get("x-upstream").unwrap(),
        &HeaderValue::from_static("ok")
    );
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"id":42}"#);

    assert_eq!(forwarder.call_count(), 1);
    assert_eq!(
        forwarder.forwarded_urls(),
        vec!["https://api.example.com/v1/users/42?active=true".to_owned()]
    );

    let unit_path = store_dir.path().join(SCENARIO_KEY);
    assert!(unit_path.is_file(), "expected {}", unit_path.display());
    let unit: StoredExample =
        serde_json::from_slice(&std::fs::read(&unit_path).unwrap()).unwrap();
    assert_eq!(unit.when.method, "GET");
    assert_eq!(
        unit.when.url_pattern,
        r"^https?://api\.example\.com/v1/users/42\?active=true$"
    );
    assert_eq!(unit.response.status, 200);
    assert_eq!(unit.response.format, BodyFormat::Json);

    // Second identical request: replayed from the store, upstream untouched.
    let res = client
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"id":42}"#);
    assert_eq!(forwarder.call_count(), 1);

    proxy.shutdown().await;
}

#[tokio::test]
async fn colliding_storage_key_fails_recording_and_preserves_the_original() {
    let store_dir = TempDir::new().unwrap();
    let forwarder = CountingForwarder::json_ok(r#"{"id":42}"#);
    let proxy = spawn_proxy(store_dir.path(), Arc::clone(&forwarder) as Arc<dyn Forwarder>).await;
    let client = client();

    let res = client
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let original = std::fs::read(store_dir.path().join(SCENARIO_KEY)).unwrap();

    // Different user id: no stored predicate matches, but the derived key
    // collides with the existing example. The whole exchange fails.
    let res = client
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/43?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let message = String::from_utf8_lossy(&body);
    assert!(message.contains(SCENARIO_KEY), "message: {message}");
    assert!(message.contains("already exists"), "message: {message}");

    assert_eq!(forwarder.call_count(), 2);
    assert_eq!(
        std::fs::read(store_dir.path().join(SCENARIO_KEY)).unwrap(),
        original,
        "stored bytes must never be mutated"
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn ambiguous_match_aborts_without_forwarding_and_names_all_keys() {
    let store_dir = TempDir::new().unwrap();
    write_unit(
        store_dir.path(),
        SCENARIO_KEY,
        "GET",
        &url_pattern("https://api.example.com/v1/users/42?active=true"),
        r#"{"id":42}"#,
    );
    write_unit(
        store_dir.path(),
        "examples/response/example/GET all-users.inc",
        "GET",
        r"^https?://api\.example\.com/v1/users/.*$",
        "[]",
    );

    let forwarder = CountingForwarder::json_ok("{}");
    let proxy = spawn_proxy(store_dir.path(), Arc::clone(&forwarder) as Arc<dyn Forwarder>).await;

    let res = client()
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let message = String::from_utf8_lossy(&body);
    assert!(message.contains(SCENARIO_KEY), "message: {message}");
    assert!(
        message.contains("examples/response/example/GET all-users.inc"),
        "message: {message}"
    );
    assert_eq!(forwarder.call_count(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn replay_hit_serves_stored_response_exactly() {
    let store_dir = TempDir::new().unwrap();
    write_unit(
        store_dir.path(),
        SCENARIO_KEY,
        "GET",
        &url_pattern("https://api.example.com/v1/users/42?active=true"),
        r#"{"id":42}"#,
    );

    let forwarder = CountingForwarder::json_ok("{}");
    let proxy = spawn_proxy(store_dir.path(), Arc::clone(&forwarder) as Arc<dyn Forwarder>).await;

    let res = client()
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42?active=true",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        &HeaderValue::from_static("application/json")
    );
    assert_eq!(
        res.headers().get(header::CONTENT_LENGTH).unwrap(),
        &HeaderValue::from_static("9")
    );
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"id":42}"#);
    assert_eq!(forwarder.call_count(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn transport_failure_maps_to_bad_gateway() {
    let store_dir = TempDir::new().unwrap();
    let proxy = spawn_proxy(store_dir.path(), Arc::new(FailingForwarder)).await;

    let res = client()
        .request(proxied_request(
            &proxy,
            Method::GET,
            "/v1/users/42",
            "api.example.com",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert!(
        String::from_utf8_lossy(&body).contains("connection refused"),
        "body: {}",
        String::from_utf8_lossy(&body)
    );
    // A failed forward records nothing.
    assert!(!store_dir.path().join(SCENARIO_KEY).exists());

    proxy.shutdown().await;
}
