// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::info;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static MD_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("md_updates_total", "accepted top-of-book updates"), &["symbol"]).unwrap()
});

pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 if the stream is connected (label: stream = book|user)"),
        &["stream"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_reconnects_total", "stream reconnect attempts"), &["stream"]).unwrap()
});

pub static LISTEN_KEEPALIVE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("listenkey_keepalive_total", "listenKey keepalive calls (label: result = ok|err)"),
        &["result"],
    )
    .unwrap()
});

// -------- Tick loop --------
pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total", "strategy ticks by outcome (quoted|taker|stale|skipped|resync)"),
        &["outcome"],
    )
    .unwrap()
});

pub static RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("resyncs_total", "full re-syncs (label: reason = cadence|timeout|divergence)"),
        &["reason"],
    )
    .unwrap()
});

pub static POSITION_OVERWRITES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("position_overwrites_total", "local position replaced by exchange value").unwrap()
});

// -------- Orders --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_placed_total", "orders placed"), &["side", "kind"]).unwrap()
});

pub static ORDERS_CANCELLED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_cancelled_total", "cancel requests confirmed").unwrap());

pub static ORDER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_errors_total", "adapter failures (labels: op, kind)"),
        &["op", "kind"],
    )
    .unwrap()
});

pub static LIVE_ORDERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("live_orders", "live tracked orders per side"), &["side"]).unwrap()
});

pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_reports_total", "execution reports"), &["status"]).unwrap()
});

pub static DUPLICATE_FILLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("duplicate_fills_total", "fill reports that carried no new quantity").unwrap()
});

pub static UNKNOWN_EXECS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("unknown_exec_reports_total", "reports for client ids we do not track").unwrap()
});

pub static CALL_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("adapter_call_latency_ms", "exchange adapter call latency (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        &["op"],
    )
    .unwrap()
});

// -------- Risk / inventory --------
pub static DERISK_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("derisk_actions_total", "de-risk orders decided"), &["side"]).unwrap()
});

pub static POSITION_NET: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("position_net", "net base-asset position").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL net of fees (quote)").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "mark-to-mid PnL of open position (quote)").unwrap());

pub static FEES_PAID: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("fees_paid", "fees paid this session (quote)").unwrap());

// ---- Config visibility ----
pub static CONFIG_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_info", "running configuration, value always 1"),
        &["exchange", "market", "symbol", "mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(MD_UPDATES.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(LISTEN_KEEPALIVE.clone())),
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(RESYNCS.clone())),
        REGISTRY.register(Box::new(POSITION_OVERWRITES.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_CANCELLED.clone())),
        REGISTRY.register(Box::new(ORDER_ERRORS.clone())),
        REGISTRY.register(Box::new(LIVE_ORDERS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(DUPLICATE_FILLS.clone())),
        REGISTRY.register(Box::new(UNKNOWN_EXECS.clone())),
        REGISTRY.register(Box::new(CALL_LATENCY.clone())),
        REGISTRY.register(Box::new(DERISK_ACTIONS.clone())),
        REGISTRY.register(Box::new(POSITION_NET.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(FEES_PAID.clone())),
        REGISTRY.register(Box::new(CONFIG_INFO.clone())),
    ] {
        let _ = m;
    }
}

/// Gauges are f64; precision loss is fine for dashboards.
pub fn set_decimal(g: &Gauge, v: Decimal) {
    g.set(v.to_f64().unwrap_or(0.0));
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if !matches!(req.uri().path(), "/" | "/metrics") {
        let mut resp = Response::new(Body::from("not found\n"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }
    let mut resp = Response::new(Body::from(encode_metrics()));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(resp)
}

/// Serves GET / and /metrics until the shutdown flag flips.
pub async fn serve_metrics(port: u16, mut shutdown: watch::Receiver<bool>) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make);
    info!(%addr, "metrics listening on / and /metrics");
    server
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_path_is_404() {
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn decimal_gauge() {
        let g = Gauge::new("test_gauge", "t").unwrap();
        set_decimal(&g, Decimal::new(125, 2));
        assert_eq!(g.get(), 1.25);
    }
}
