//! Fake ingestion collector.
//!
//! Stands in for the production span-ingestion endpoint as ground
//! truth for what the client actually transmitted. Reports arrive over
//! three paths: a length-prefixed binary RPC on HTTP POST, a JSON RPC
//! (optionally gzipped), and a gRPC service on its own port. Every
//! path counts the spans in the payload, scans the internal-metrics
//! counters for the one literally named `spans.dropped`, and adds the
//! raw body length to the byte counter. Nothing else of the production
//! collector API is modeled.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Protobuf report schema, shared by the binary-frame and gRPC paths.
pub mod collectorpb {
    tonic::include_proto!("collector");
}

use collectorpb::collector_service_server::{CollectorService, CollectorServiceServer};
use collectorpb::{metrics_sample, ReportRequest, ReportResponse};

pub const COLLECTOR_BINARY_PATH: &str = "/_rpc/v1/reports/binary";
pub const COLLECTOR_JSON_PATH: &str = "/api/v0/reports";

/// The counter name clients use for spans they had to drop.
const SPANS_DROPPED_METRIC: &str = "spans.dropped";

/// A dropped-span counter value. Clients encode it as either an
/// integer or a floating count; both map onto this tagged variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Double(f64),
}

impl MetricValue {
    fn as_count(self) -> i64 {
        match self {
            MetricValue::Int(v) => v,
            MetricValue::Double(v) => v as i64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Counters {
    spans_received: i64,
    spans_dropped: i64,
    bytes_received: i64,
}

/// Shared counter handle. Writers live on the HTTP and gRPC server
/// tasks while the measurement engine reads between trials, so reads
/// and resets take a consistent snapshot under one lock.
#[derive(Clone, Default)]
pub struct CollectorStats {
    inner: std::sync::Arc<parking_lot::Mutex<Counters>>,
}

impl CollectorStats {
    pub fn new() -> Self {
        CollectorStats::default()
    }

    /// (spans received, spans dropped, bytes received)
    pub fn get(&self) -> (i64, i64, i64) {
        let c = self.inner.lock();
        (c.spans_received, c.spans_dropped, c.bytes_received)
    }

    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }

    pub fn record(&self, spans: i64, dropped: i64, bytes: i64) {
        let mut c = self.inner.lock();
        c.spans_received += spans;
        c.spans_dropped += dropped;
        c.bytes_received += bytes;
    }

    /// Count one protobuf report: spans, dropped-span metrics, and the
    /// raw body length it arrived with.
    fn ingest_report(&self, request: &ReportRequest, body_len: usize) {
        let dropped = request
            .internal_metrics
            .iter()
            .flat_map(|m| m.counts.iter())
            .filter(|c| c.name == SPANS_DROPPED_METRIC)
            .filter_map(|c| match c.value {
                Some(metrics_sample::Value::IntValue(v)) => Some(MetricValue::Int(v)),
                Some(metrics_sample::Value::DoubleValue(v)) => Some(MetricValue::Double(v)),
                None => None,
            })
            .map(MetricValue::as_count)
            .sum();
        self.record(request.spans.len() as i64, dropped, body_len as i64);
    }
}

/// Wrap an encoded message in the binary RPC envelope: a big-endian
/// u32 length prefix followed by the protobuf bytes.
pub fn encode_frame<M: prost::Message>(msg: &M) -> Vec<u8> {
    let body = msg.encode_to_vec();
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    framed
}

/// Decode a binary RPC envelope, rejecting short or trailing bytes.
pub fn decode_frame<M: prost::Message + Default>(buf: &[u8]) -> Result<M, String> {
    if buf.len() < 4 {
        return Err(format!("frame too short: {} bytes", buf.len()));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let body = &buf[4..];
    if body.len() != len {
        return Err(format!(
            "frame length mismatch: prefix says {}, body is {}",
            len,
            body.len()
        ));
    }
    M::decode(body).map_err(|e| format!("could not decode report: {}", e))
}

fn report_ack() -> ReportResponse {
    let now_micros = chrono::Utc::now().timestamp_micros();
    ReportResponse {
        receive_micros: now_micros,
        transmit_micros: now_micros,
    }
}

/// JSON wire model for `POST /api/v0/reports`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonReportRequest {
    #[serde(default)]
    span_records: Vec<serde_json::Value>,
    #[serde(default)]
    internal_metrics: Option<JsonInternalMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonInternalMetrics {
    #[serde(default)]
    counts: Vec<JsonMetricsSample>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMetricsSample {
    #[serde(default)]
    name: String,
    #[serde(default)]
    int64_value: Option<i64>,
    #[serde(default)]
    double_value: Option<f64>,
}

impl JsonMetricsSample {
    fn value(&self) -> Option<MetricValue> {
        match (self.int64_value, self.double_value) {
            (Some(v), _) => Some(MetricValue::Int(v)),
            (None, Some(v)) => Some(MetricValue::Double(v)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReportAck {
    receive_micros: i64,
    transmit_micros: i64,
}

/// The fake collector's server half: one HTTP server carrying the
/// binary and JSON report paths, plus a gRPC service on its own port.
pub struct FakeCollector {
    stats: CollectorStats,
}

impl Default for FakeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCollector {
    pub fn new() -> Self {
        FakeCollector {
            stats: CollectorStats::new(),
        }
    }

    /// Handle to the shared counters.
    pub fn stats(&self) -> CollectorStats {
        self.stats.clone()
    }

    /// Bind and serve the HTTP report endpoints on a background task,
    /// returning the bound address.
    pub async fn serve_http(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let app = Router::new()
            .route(COLLECTOR_BINARY_PATH, post(serve_binary))
            .route(COLLECTOR_JSON_PATH, post(serve_json))
            .with_state(self.stats.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("collector HTTP server terminated: {}", e);
            }
        });
        info!("collector HTTP listening on {}", local);
        Ok(local)
    }

    /// Serve the gRPC Report service on a background task.
    pub fn serve_grpc(&self, addr: SocketAddr) {
        let service = CollectorServiceServer::new(GrpcCollector {
            stats: self.stats.clone(),
        });
        tokio::spawn(async move {
            info!("collector gRPC listening on {}", addr);
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve(addr)
                .await
            {
                error!("collector gRPC server terminated: {}", e);
            }
        });
    }
}

/// Binary-framed report: length-prefixed protobuf in, length-prefixed
/// protobuf ack out.
async fn serve_binary(State(stats): State<CollectorStats>, body: Bytes) -> Response {
    let request: ReportRequest = match decode_frame(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("bad binary report: {}", e);
            return (StatusCode::BAD_REQUEST, e).into_response();
        }
    };
    stats.ingest_report(&request, body.len());
    debug!("binary report: {} spans", request.spans.len());

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        encode_frame(&report_ack()),
    )
        .into_response()
}

/// JSON report, with optional `Content-Encoding: gzip`.
async fn serve_json(
    State(stats): State<CollectorStats>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let decoded = match headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        Some("gzip") => {
            let mut buf = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            if let Err(e) = decoder.read_to_end(&mut buf) {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("could not decode gzipped content: {}", e),
                )
                    .into_response();
            }
            buf
        }
        _ => body.to_vec(),
    };

    let request: JsonReportRequest = match serde_json::from_slice(&decoded) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unable to decode body: {}", e),
            )
                .into_response();
        }
    };

    let dropped = request
        .internal_metrics
        .iter()
        .flat_map(|m| m.counts.iter())
        .filter(|c| c.name == SPANS_DROPPED_METRIC)
        .filter_map(JsonMetricsSample::value)
        .map(MetricValue::as_count)
        .sum();
    stats.record(
        request.span_records.len() as i64,
        dropped,
        decoded.len() as i64,
    );

    let ack = report_ack();
    Json(JsonReportAck {
        receive_micros: ack.receive_micros,
        transmit_micros: ack.transmit_micros,
    })
    .into_response()
}

struct GrpcCollector {
    stats: CollectorStats,
}

#[tonic::async_trait]
impl CollectorService for GrpcCollector {
    async fn report(
        &self,
        request: tonic::Request<ReportRequest>,
    ) -> Result<tonic::Response<ReportResponse>, tonic::Status> {
        let request = request.into_inner();
        self.stats
            .ingest_report(&request, request.encoded_len());
        Ok(tonic::Response::new(report_ack()))
    }
}
