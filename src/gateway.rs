// ===============================
// src/gateway.rs (exchange adapter contract)
// ===============================
//
// Every venue sits behind `ExchangeAdapter`. The engine only ever holds an
// `Arc<dyn ExchangeAdapter>`; streaming pushes go through `StreamSink`.
//
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{ExecReport, MarketType, Side, Symbol, TimeInForce};
use crate::feed::MarketDataCache;
use crate::metrics::{CALL_LATENCY, ORDER_ERRORS};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{op} timed out after {ms}ms")]
    Timeout { op: &'static str, ms: u64 },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("fatal adapter error: {0}")]
    Fatal(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Stops the run after a best-effort cancel_all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Auth(_) | GatewayError::Fatal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Transient(_) => "transient",
            GatewayError::Rejected(_) => "rejected",
            GatewayError::Auth(_) => "auth",
            GatewayError::Fatal(_) => "fatal",
            GatewayError::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceAck { pub exchange_id: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already filled, cancelled or expired on the exchange.
    AlreadyTerminal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionInfo { pub net: Decimal, pub entry_price: Decimal }

#[derive(Debug, Clone, PartialEq)]
pub struct Balance { pub asset: String, pub free: Decimal, pub locked: Decimal }

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub cl_id: String,
    pub exchange_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Resting post-only/GTC limit orders.
    pub maker: bool,
    /// Immediate-or-cancel orders.
    pub ioc: bool,
}

/// Where stream listeners push. Book updates overwrite the cache, exec reports
/// queue for the tick worker.
#[derive(Clone)]
pub struct StreamSink {
    pub cache: Arc<MarketDataCache>,
    pub exec_tx: mpsc::Sender<ExecReport>,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    async fn symbol_info(&self, symbol: &str, market: MarketType) -> Result<Symbol, GatewayError>;
    /// One-shot REST best bid/ask.
    async fn order_book(&self, symbol: &str) -> Result<(Decimal, Decimal), GatewayError>;
    /// Spawns auto-reconnecting listeners and returns once they are running.
    async fn subscribe(&self, symbol: &str, sink: StreamSink) -> Result<(), GatewayError>;
    async fn place_order(
        &self,
        symbol: &str,
        cl_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        tif: TimeInForce,
    ) -> Result<PlaceAck, GatewayError>;
    async fn cancel_order(
        &self,
        symbol: &str,
        cl_id: &str,
        exchange_id: Option<&str>,
    ) -> Result<CancelOutcome, GatewayError>;
    async fn position(&self, symbol: &str) -> Result<PositionInfo, GatewayError>;
    async fn balances(&self) -> Result<Vec<Balance>, GatewayError>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError>;
}

/// Bounds an adapter call. Latency and failures land in metrics under `op`.
pub async fn timed<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    let started = std::time::Instant::now();
    let out = match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(GatewayError::Timeout { op, ms: limit.as_millis() as u64 }),
    };
    CALL_LATENCY
        .with_label_values(&[op])
        .observe(started.elapsed().as_secs_f64() * 1000.0);
    if let Err(e) = &out {
        ORDER_ERRORS.with_label_values(&[op, e.kind()]).inc();
    }
    out
}

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local client order id, e.g. `MM-1718000000123-42`. Binance caps these at 36 chars.
pub fn new_client_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("MM-{ms}-{seq}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(GatewayError::Auth("bad key".into()).is_fatal());
        assert_eq!(GatewayError::RateLimited("429".into()).kind(), "rate_limited");
        assert!(!GatewayError::RateLimited("429".into()).is_fatal());
        assert!(!GatewayError::Rejected("min notional".into()).is_fatal());
    }

    #[tokio::test]
    async fn hung_call_times_out() {
        let r: Result<(), _> = timed("place", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(r, Err(GatewayError::Timeout { op: "place", ms: 20 })));
    }

    #[test]
    fn client_ids_fit_exchange_limit() {
        let a = new_client_id();
        let b = new_client_id();
        assert!(a.starts_with("MM-"));
        assert!(a.len() <= 36);
        assert_ne!(a, b);
    }
}
