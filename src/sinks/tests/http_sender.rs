use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use sinks::configurable::{http_export, Parameters};
use sinks::http::HTTP_EXPORT_SIZE;
use sinks::{
    AppContext, AppFunctionContext, InMemorySecretProvider, PipelineData, SecretData, Sender,
    SenderError, ServiceResources,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use telemetry::{MetricsManager, PrometheusMetrics};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Received {
    path: String,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<Received>>>,
    token_requests: Arc<AtomicUsize>,
}

impl Recorder {
    fn push(&self, path: String, headers: HeaderMap, body: String) {
        self.requests.lock().push(Received {
            path,
            headers,
            body,
        });
    }

    fn last(&self) -> Received {
        self.requests.lock().last().cloned().expect("no request received")
    }

    fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

async fn ingest(State(rec): State<Recorder>, headers: HeaderMap, body: String) -> &'static str {
    rec.push("/ingest".to_string(), headers, body);
    "accepted"
}

async fn templated(
    State(rec): State<Recorder>,
    Path(test): Path<String>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    rec.push(format!("/base/{test}"), headers, body);
    if test == "bad" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

async fn broken(State(rec): State<Recorder>, headers: HeaderMap, body: String) -> StatusCode {
    rec.push("/broken".to_string(), headers, body);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn token(State(rec): State<Recorder>) -> Json<serde_json::Value> {
    rec.token_requests.fetch_add(1, Ordering::SeqCst);
    Json(json!({"access_token": "abc123", "token_type": "bearer", "expires_in": 3600}))
}

async fn spawn_server() -> (SocketAddr, Recorder) {
    let recorder = Recorder::default();
    let app = Router::new()
        .route("/ingest", post(ingest))
        .route("/base/:test", post(templated))
        .route("/broken", post(broken))
        .route("/token", post(token))
        .with_state(recorder.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, recorder)
}

fn params(pairs: &[(&str, &str)]) -> Parameters {
    pairs.iter().copied().collect()
}

fn post_to(url: &str) -> Vec<(&str, &str)> {
    vec![
        ("method", "post"),
        ("url", url),
        ("mimetype", "application/json"),
    ]
}

fn context_with(secrets: Arc<InMemorySecretProvider>) -> AppContext {
    ServiceResources::new(secrets).context("p1")
}

fn context() -> AppContext {
    context_with(Arc::new(InMemorySecretProvider::new()))
}

fn payload() -> PipelineData {
    PipelineData::Text(r#"{"reading":42}"#.to_string())
}

#[tokio::test]
async fn returns_response_body_by_default() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/ingest");
    let sender = http_export(&params(&post_to(&url))).unwrap();
    let ctx = context();

    let out = sender.send(&ctx, Some(payload())).await.unwrap();

    assert_eq!(out, PipelineData::Bytes(b"accepted".to_vec()));
    let received = rec.last();
    assert_eq!(received.body, r#"{"reading":42}"#);
    assert_eq!(received.headers["content-type"], "application/json");
}

#[tokio::test]
async fn returns_input_when_requested_and_records_size() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/ingest");
    let mut pairs = post_to(&url);
    pairs.push(("returninputdata", "true"));
    pairs.push(("httprequestheaders", r#"{"X-Site":"plant-1"}"#));
    let sender = http_export(&params(&pairs)).unwrap();

    let metrics = Arc::new(PrometheusMetrics::default());
    let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new()))
        .with_metrics(metrics.clone())
        .context("p1");

    let out = sender.send(&ctx, Some(payload())).await.unwrap();
    assert_eq!(out, payload());
    assert_eq!(rec.last().headers["x-site"], "plant-1");

    let tags: BTreeMap<String, String> = [("destination".to_string(), url.clone())].into();
    let histogram = metrics.histogram(HTTP_EXPORT_SIZE, "", &tags).unwrap();
    assert_eq!(histogram.get_sample_count(), 1);
    assert_eq!(histogram.get_sample_sum(), 14.0);
}

#[tokio::test]
async fn export_size_is_tracked_per_destination() {
    let (addr, _rec) = spawn_server().await;
    let metrics = Arc::new(PrometheusMetrics::default());
    let resources = ServiceResources::new(Arc::new(InMemorySecretProvider::new()))
        .with_metrics(metrics.clone());

    for path in ["ingest", "base/archive"] {
        let url = format!("http://{addr}/{path}");
        let sender = http_export(&params(&post_to(&url))).unwrap();
        sender
            .send(&resources.context("p1"), Some(payload()))
            .await
            .unwrap();
    }

    let families = metrics.registry().gather();
    assert_eq!(families.len(), 1);
    let mut destinations: Vec<String> = families[0]
        .get_metric()
        .iter()
        .map(|m| m.get_label()[0].get_value().to_string())
        .collect();
    destinations.sort();
    assert_eq!(
        destinations,
        [format!("http://{addr}/base/archive"), format!("http://{addr}/ingest")]
    );
}

#[tokio::test]
async fn templated_url_uses_context_values() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/base/{{test}}");
    let sender = http_export(&params(&post_to(&url))).unwrap();
    let ctx = context();
    ctx.add_value("test", "foo");

    sender.send(&ctx, Some(payload())).await.unwrap();
    assert_eq!(rec.last().path, "/base/foo");
}

#[tokio::test]
async fn unresolved_template_fails_without_staging() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/base/{{test}}");
    let mut pairs = post_to(&url);
    pairs.push(("persistonerror", "true"));
    let sender = http_export(&params(&pairs)).unwrap();
    let ctx = context();

    let err = sender.send(&ctx, Some(payload())).await.unwrap_err();
    assert!(matches!(err, SenderError::Template(_)));
    assert!(ctx.retry_data().is_none());
    assert_eq!(rec.count(), 0);
}

#[tokio::test]
async fn error_status_stages_payload_when_persisting() {
    let (addr, _rec) = spawn_server().await;
    let url = format!("http://{addr}/broken");
    let mut pairs = post_to(&url);
    pairs.push(("persistonerror", "true"));
    let sender = http_export(&params(&pairs)).unwrap();
    let ctx = context();

    let err = sender.send(&ctx, Some(payload())).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "XpertHTTPExport received 500 HTTP response status code after sending POST request to {url} in pipeline 'p1'"
        )
    );
    assert_eq!(ctx.retry_data(), Some(br#"{"reading":42}"#.to_vec()));
}

#[tokio::test]
async fn error_status_without_persist_drops_payload() {
    let (addr, _rec) = spawn_server().await;
    let url = format!("http://{addr}/broken");
    let sender = http_export(&params(&post_to(&url))).unwrap();
    let ctx = context();

    assert!(sender.send(&ctx, Some(payload())).await.is_err());
    assert!(ctx.retry_data().is_none());
}

#[tokio::test]
async fn continue_on_send_error_passes_input_through() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/broken");
    let mut pairs = post_to(&url);
    pairs.push(("continueonsenderror", "true"));
    pairs.push(("returninputdata", "true"));
    let sender = http_export(&params(&pairs)).unwrap();
    let ctx = context();

    let out = sender.send(&ctx, Some(payload())).await.unwrap();
    assert_eq!(out, payload());
    assert!(ctx.retry_data().is_none());
    assert_eq!(rec.count(), 1);
}

#[tokio::test]
async fn not_found_with_persist_halts_and_stages_original_bytes() {
    let (addr, _rec) = spawn_server().await;
    let url = format!("http://{addr}/base/bad");
    let mut pairs = post_to(&url);
    pairs.push(("persistonerror", "true"));
    let sender = http_export(&params(&pairs)).unwrap();
    let ctx = context();
    let message = PipelineData::Bytes(b"original message".to_vec());

    let err = sender.send(&ctx, Some(message)).await.unwrap_err();
    assert!(err.to_string().contains("received 404 HTTP response status code"));
    assert_eq!(ctx.retry_data(), Some(b"original message".to_vec()));
}

#[tokio::test]
async fn not_found_with_continue_returns_original_input() {
    let (addr, _rec) = spawn_server().await;
    let url = format!("http://{addr}/base/bad");
    let mut pairs = post_to(&url);
    pairs.extend([("continueonsenderror", "true"), ("returninputdata", "true")]);
    let sender = http_export(&params(&pairs)).unwrap();
    let ctx = context();
    let message = PipelineData::Bytes(b"original message".to_vec());

    let out = sender.send(&ctx, Some(message.clone())).await.unwrap();
    assert_eq!(out, message);
}

#[tokio::test]
async fn missing_input_is_rejected() {
    let sender = http_export(&params(&post_to("http://127.0.0.1:9/ingest"))).unwrap();
    let err = sender.send(&context(), None).await.unwrap_err();
    assert!(matches!(err, SenderError::NoData(_)));
}

#[tokio::test]
async fn header_secret_follows_secret_rotation() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/ingest");
    let mut pairs = post_to(&url);
    pairs.extend([
        ("authmode", "header_secret"),
        ("headername", "X-Api-Key"),
        ("secretpath", "http"),
        ("secretname", "apikey"),
    ]);
    let sender = http_export(&params(&pairs)).unwrap();

    let secrets = Arc::new(InMemorySecretProvider::with_secrets(HashMap::from([(
        "http".to_string(),
        SecretData::from([("apikey".to_string(), "first".to_string())]),
    )])));
    let ctx = context_with(secrets.clone());

    sender.send(&ctx, Some(payload())).await.unwrap();
    assert_eq!(rec.last().headers["x-api-key"], "first");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    secrets.set_secret(
        "http",
        SecretData::from([("apikey".to_string(), "second".to_string())]),
    );
    sender.send(&ctx, Some(payload())).await.unwrap();
    assert_eq!(rec.last().headers["x-api-key"], "second");
}

#[tokio::test]
async fn header_secret_missing_value_is_a_credentials_error() {
    let mut pairs = post_to("http://127.0.0.1:9/ingest");
    pairs.extend([
        ("authmode", "header_secret"),
        ("headername", "X-Api-Key"),
        ("secretpath", "http"),
        ("secretname", "apikey"),
    ]);
    let sender = http_export(&params(&pairs)).unwrap();
    let secrets = Arc::new(InMemorySecretProvider::with_secrets(HashMap::from([(
        "http".to_string(),
        SecretData::new(),
    )])));

    let err = sender
        .send(&context_with(secrets), Some(payload()))
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::Credentials(_)));
}

#[tokio::test]
async fn oauth2_token_is_fetched_once_and_reused() {
    let (addr, rec) = spawn_server().await;
    let url = format!("http://{addr}/ingest");
    let mut pairs = post_to(&url);
    pairs.extend([("authmode", "oauth2_clientcredentials"), ("secretpath", "oauth")]);
    let sender = http_export(&params(&pairs)).unwrap();

    let secrets = Arc::new(InMemorySecretProvider::with_secrets(HashMap::from([(
        "oauth".to_string(),
        SecretData::from([
            ("client_id".to_string(), "edge".to_string()),
            ("client_secret".to_string(), "s3cr3t".to_string()),
            ("token_url".to_string(), format!("http://{addr}/token")),
        ]),
    )])));
    let ctx = context_with(secrets);

    sender.send(&ctx, Some(payload())).await.unwrap();
    sender.send(&ctx, Some(payload())).await.unwrap();

    assert_eq!(rec.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(rec.count(), 2);
    assert_eq!(rec.last().headers["authorization"], "Bearer abc123");
}
