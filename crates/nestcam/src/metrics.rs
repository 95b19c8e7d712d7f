use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use hyper::{
    Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9464
}

#[derive(Default, Serialize)]
pub struct Metrics {
    pub pipeline: PipelineMetrics,
}

#[derive(Default, Serialize)]
pub struct PipelineMetrics {
    pub polls: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_skipped: AtomicU64,
    pub fetch_retries: AtomicU64,
    pub frames_extracted: AtomicU64,
    pub frames_uploaded: AtomicU64,
    pub predictions_inserted: AtomicU64,
    pub stage_failures: AtomicU64,
}

pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

pub fn increment(counter: &AtomicU64) {
    add(counter, 1);
}

pub async fn start_metrics_server(
    metrics: Arc<Metrics>,
    address: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{address}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Metrics server listening on http://{addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(|req| handle_request(req, metrics.clone())))
                .await
            {
                tracing::error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<String>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<String> {
    match path {
        "/metrics" => {
            let mut response = Response::new(render(metrics));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        _ => {
            let mut response = Response::new("Not Found".to_string());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

pub fn render(metrics: &Metrics) -> String {
    serde_prometheus::to_string(metrics, None, std::collections::HashMap::new())
        .unwrap_or_else(|e| format!("Error serializing metrics: {e}"))
}
