//! Webhook bridge: accepts third-party webhook POSTs and forwards their
//! payloads into the cloud as device data messages. Devices unknown to the
//! cloud are created and activated on first sight.

use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::{Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug_span, field::{Empty, display}, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use nimbus_client::{
    ClientConfig, ClientError, Device, DeviceAttributes, EndpointId, IotClient, KeyPair, Uri,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(env = "NIMBUS_BRIDGE_LISTEN", long = "listen", value_name = "addr", default_value = "0.0.0.0:9905")]
    listen: std::net::SocketAddr,

    /// Base URI of the cloud service
    #[arg(env = "NIMBUS_ENDPOINT", long = "endpoint", value_name = "uri")]
    endpoint: Uri,

    /// Username of the basic-auth principal
    #[arg(env = "NIMBUS_USERNAME", long = "username", value_name = "user")]
    username: String,

    /// Password of the basic-auth principal
    #[arg(env = "NIMBUS_PASSWORD", long = "password", value_name = "pass")]
    password: String,

    /// Shared secret used to open and register bridged devices
    #[arg(env = "NIMBUS_SHARED_SECRET", long = "shared-secret", value_name = "secret")]
    shared_secret: String,

    /// Accept self-signed server certificates (development instances only)
    #[arg(env = "NIMBUS_ACCEPT_INVALID_CERTS", long = "accept-invalid-certs")]
    accept_invalid_certs: bool,
}

#[derive(Clone)]
struct BridgeState {
    client: IotClient,
    shared_secret: String,
    // Webhooks for the same device often arrive back to back; serialize
    // per device name so only one of them runs create-and-activate.
    device_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Incoming webhook event. `device` is the name the device is (or will be)
/// registered under, `format` the data-message format URN.
#[derive(Debug, Deserialize)]
struct WebhookEvent {
    device: String,
    format: String,
    data: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("hyper_util=error".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let cli = Cli::parse();

    let config = ClientConfig::new(cli.endpoint.clone())
        .with_accept_invalid_certs(cli.accept_invalid_certs)
        .with_request_timeout(Duration::from_millis(30_000));
    let keys = KeyPair::generate(2048)?;
    let client = IotClient::new(config, keys)?;
    client.set_principal(cli.username, cli.password);

    let state = BridgeState {
        client,
        shared_secret: cli.shared_secret,
        device_locks: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/ping", get(|| async { "OK" }))
        .route("/messages", post(forward))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    debug_span!("request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                        status = Empty,
                    )
                })
                .on_response(|response: &Response<Body>, _: Duration, span: &Span| {
                    span.record("status", display(response.status()));
                }),
        )
        .with_state(state);

    let listener = TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, endpoint = %cli.endpoint, "bridge ready");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Handles one webhook event: find (or create and activate) the device and
/// forward the payload as a data message.
async fn forward(
    State(state): State<BridgeState>,
    Json(event): Json<WebhookEvent>,
) -> Result<StatusCode, (StatusCode, String)> {
    let lock = {
        let mut locks = state.device_locks.lock().await;
        locks
            .entry(event.device.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = lock.lock().await;

    let device = open_device(&state, &event.device).await.map_err(|error| {
        warn!(device = %event.device, %error, "opening device failed");
        (StatusCode::BAD_GATEWAY, error.to_string())
    })?;

    device
        .send_data_messages(&event.format, event.data, None)
        .await
        .map_err(|error| {
            warn!(device = %event.device, %error, "forwarding failed");
            (StatusCode::BAD_GATEWAY, error.to_string())
        })?;

    info!(device = %event.device, format = %event.format, "message forwarded");
    Ok(StatusCode::ACCEPTED)
}

/// Looks a device up by name, falling back to registering and activating a
/// new one under that name.
async fn open_device(state: &BridgeState, name: &str) -> Result<Device, ClientError> {
    let client = &state.client;
    let query = json!({"name": name, "state": "ACTIVATED"});
    let page = client.list_devices(Some(&query), Some(0), Some(1)).await?;

    if let Some(id) = page.items.first().and_then(|item| item["id"].as_str()) {
        return client
            .get_device(&EndpointId::from(id), state.shared_secret.as_str())
            .await;
    }

    info!(device = name, "unknown device, registering");
    let device = client
        .create_device(
            state.shared_secret.as_str(),
            name,
            DeviceAttributes::default(),
        )
        .await?;
    device.activate(&[]).await?;
    Ok(device)
}
