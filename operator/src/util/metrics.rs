use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder};
use tokio::net::TcpListener;

/// Prometheus instruments shared by the reconcile loop and the worker pool.
/// Registered once per process into the default registry.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
    pub running_workers: IntGauge,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = prometheus::register_int_counter_vec!(
            prometheus::opts!(
                format!("{controller}_reconciles_total"),
                "Total reconcile invocations per resource"
            ),
            &["name", "namespace"]
        )
        .expect("register reconcile counter");
        let action_counter = prometheus::register_int_counter_vec!(
            prometheus::opts!(
                format!("{controller}_actions_total"),
                "Reconcile outcomes by action"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register action counter");
        let read_histogram = prometheus::register_histogram_vec!(
            prometheus::histogram_opts!(
                format!("{controller}_read_phase_seconds"),
                "Duration of the reconcile read phase"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register read histogram");
        let write_histogram = prometheus::register_histogram_vec!(
            prometheus::histogram_opts!(
                format!("{controller}_write_phase_seconds"),
                "Duration of the reconcile write phase"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register write histogram");
        let running_workers = prometheus::register_int_gauge!(
            format!("{controller}_running_workers"),
            "Restore executions currently holding a concurrency permit"
        )
        .expect("register worker gauge");
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
            running_workers,
        }
    }
}

/// Expose the default registry when METRICS_PORT is set.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    tokio::spawn(run_metrics_server(port));
}

async fn run_metrics_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let _ = http1::Builder::new()
                .serve_connection(io, service_fn(serve_request))
                .await;
        });
    }
}

async fn serve_request(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buf = Vec::new();
            if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
                buf.clear();
            }
            Response::new(Full::new(Bytes::from(buf)))
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    };
    Ok(response)
}
