use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use sinks::configurable::{influxdb_sync_write, Parameters};
use sinks::{
    AppFunctionContext, Event, InMemorySecretProvider, PipelineData, SecretData, Sender,
    SenderError, ServiceResources,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Write {
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone)]
struct FakeInflux {
    status: StatusCode,
    writes: Arc<Mutex<Vec<Write>>>,
}

async fn write(
    State(server): State<FakeInflux>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    server.writes.lock().push(Write {
        query,
        headers,
        body,
    });
    if server.status.is_success() {
        (server.status, "")
    } else {
        (server.status, "bucket not found")
    }
}

async fn spawn_influx(status: StatusCode) -> (SocketAddr, Arc<Mutex<Vec<Write>>>) {
    let server = FakeInflux {
        status,
        writes: Arc::new(Mutex::new(Vec::new())),
    };
    let writes = Arc::clone(&server.writes);
    let app = Router::new()
        .route("/api/v2/write", post(write))
        .with_state(server);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, writes)
}

fn event(device: &str, value: &str) -> Event {
    let mut event = Event::new("thermostat", device, "source");
    event.origin = 1_700_000_000_000_000_000;
    event.add_simple_reading("temperature", "Float64", value);
    event
}

fn writer_params(addr: SocketAddr, extra: &[(&str, &str)]) -> Parameters {
    let url = format!("http://{addr}");
    let mut params: Parameters = [
        ("influxdbserverurl", url.as_str()),
        ("influxdborganization", "edge"),
        ("influxdbbucket", "telemetry"),
        ("influxdbprecision", "ms"),
    ]
    .into_iter()
    .collect();
    for (name, value) in extra {
        params.insert(name, *value);
    }
    params
}

fn secrets() -> Arc<InMemorySecretProvider> {
    Arc::new(InMemorySecretProvider::with_secrets(HashMap::from([(
        "influx".to_string(),
        SecretData::from([("token".to_string(), "t0ken".to_string())]),
    )])))
}

#[tokio::test]
async fn batch_of_events_writes_like_event_list() {
    let (addr, writes) = spawn_influx(StatusCode::NO_CONTENT).await;
    let writer = influxdb_sync_write(&writer_params(addr, &[])).unwrap();
    let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new())).context("p1");

    let events = vec![event("dev-1", "21.5"), event("dev-2", "19")];
    let batch = PipelineData::Batch(events.iter().cloned().map(PipelineData::Event).collect());
    let list = PipelineData::Events(events);

    assert_eq!(writer.send(&ctx, Some(batch.clone())).await.unwrap(), batch);
    assert_eq!(writer.send(&ctx, Some(list.clone())).await.unwrap(), list);

    let writes = writes.lock();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].body, writes[1].body);
    assert_eq!(
        writes[0].body,
        "readings,deviceName=dev-1,resourceName=temperature value=21.5 1700000000000\n\
         readings,deviceName=dev-2,resourceName=temperature value=19 1700000000000"
    );
    assert_eq!(writes[0].query.get("org").map(String::as_str), Some("edge"));
    assert_eq!(writes[0].query.get("bucket").map(String::as_str), Some("telemetry"));
    assert_eq!(writes[0].query.get("precision").map(String::as_str), Some("ms"));
    assert!(writes[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn token_auth_sets_authorization_header() {
    let (addr, writes) = spawn_influx(StatusCode::NO_CONTENT).await;
    let params = writer_params(addr, &[("authmode", "token"), ("secretpath", "influx")]);
    let writer = influxdb_sync_write(&params).unwrap();
    let ctx = ServiceResources::new(secrets()).context("p1");

    writer
        .send(&ctx, Some(PipelineData::Event(event("dev-1", "1.5"))))
        .await
        .unwrap();
    assert_eq!(writes.lock()[0].headers["authorization"], "Token t0ken");
}

#[tokio::test]
async fn empty_token_is_rejected() {
    let (addr, writes) = spawn_influx(StatusCode::NO_CONTENT).await;
    let params = writer_params(addr, &[("authmode", "token"), ("secretpath", "influx")]);
    let writer = influxdb_sync_write(&params).unwrap();
    let provider = Arc::new(InMemorySecretProvider::with_secrets(HashMap::from([(
        "influx".to_string(),
        SecretData::from([("token".to_string(), String::new())]),
    )])));
    let ctx = ServiceResources::new(provider).context("p1");

    let err = writer
        .send(&ctx, Some(PipelineData::Event(event("dev-1", "1.5"))))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "mandatory secret authentication token is empty");
    assert!(writes.lock().is_empty());
}

#[tokio::test]
async fn failed_write_stages_events_when_persisting() {
    let (addr, _writes) = spawn_influx(StatusCode::NOT_FOUND).await;
    let writer = influxdb_sync_write(&writer_params(addr, &[("persistonerror", "true")])).unwrap();
    let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new())).context("p1");
    let events = vec![event("dev-1", "21.5")];

    let err = writer
        .send(&ctx, Some(PipelineData::Events(events.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::Transport(_)));
    assert!(err
        .to_string()
        .starts_with("failed to write points to influxdb, persisting Events for later retry. Error: 404"));

    let staged: Vec<Event> = serde_json::from_slice(&ctx.retry_data().unwrap()).unwrap();
    assert_eq!(staged, events);
}

#[tokio::test]
async fn failed_write_drops_events_by_default() {
    let (addr, _writes) = spawn_influx(StatusCode::INTERNAL_SERVER_ERROR).await;
    let writer = influxdb_sync_write(&writer_params(addr, &[])).unwrap();
    let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new())).context("p1");

    let err = writer
        .send(&ctx, Some(PipelineData::Event(event("dev-1", "21.5"))))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("drop event"));
    assert!(ctx.retry_data().is_none());
}

#[tokio::test]
async fn mixed_batch_is_unsupported() {
    let (addr, writes) = spawn_influx(StatusCode::NO_CONTENT).await;
    let writer = influxdb_sync_write(&writer_params(addr, &[])).unwrap();
    let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new())).context("p1");
    let batch = PipelineData::Batch(vec![
        PipelineData::Event(event("dev-1", "21.5")),
        PipelineData::Text("not an event".to_string()),
    ]);

    let err = writer.send(&ctx, Some(batch)).await.unwrap_err();
    assert_eq!(err.to_string(), "unsupported data type passed in");
    assert!(writes.lock().is_empty());
}
