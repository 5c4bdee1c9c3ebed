// ===============================
// src/feed.rs
// ===============================
//
// Market data:
// - MarketDataCache : latest top of book per symbol, written by stream
//                     listeners, read by the tick worker (snapshot swap only)
// - run_mock        : random-walk generator driving the paper exchange
// - run_binance     : Binance WS bookTicker with reconnect/backoff
//

use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::StreamExt; // for .next()
use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{now_ns, MarketSnapshot};
use crate::gateway_paper::PaperGateway;
use crate::metrics::{MD_UPDATES, WS_CONNECTED, WS_RECONNECTS};

/// Result of a cache read.
#[derive(Debug, Clone)]
pub enum BookRead {
    Fresh(MarketSnapshot),
    /// No update inside the staleness window; carries the last value if there ever was one.
    Stale(Option<MarketSnapshot>),
}

impl BookRead {
    pub fn fresh(&self) -> Option<&MarketSnapshot> {
        match self { BookRead::Fresh(s) => Some(s), BookRead::Stale(_) => None }
    }
    pub fn last_known(&self) -> Option<&MarketSnapshot> {
        match self { BookRead::Fresh(s) => Some(s), BookRead::Stale(s) => s.as_ref() }
    }
}

pub struct MarketDataCache {
    books: RwLock<HashMap<String, MarketSnapshot>>,
    stale_after: Duration,
}

impl MarketDataCache {
    pub fn new(stale_after: Duration) -> Self {
        Self { books: RwLock::new(HashMap::new()), stale_after }
    }

    /// Called from every stream tick. Crossed or empty books are dropped.
    pub fn update(&self, symbol: &str, bid: Decimal, ask: Decimal) -> bool {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO || bid > ask {
            debug!(%symbol, %bid, %ask, "ignoring invalid book update");
            return false;
        }
        let snap = MarketSnapshot {
            symbol: symbol.to_string(),
            best_bid: bid,
            best_ask: ask,
            mid: (bid + ask) / Decimal::TWO,
            updated_at: Instant::now(),
            ts_ns: now_ns(),
        };
        // whole-value swap under the write lock, readers never see half an update
        let mut books = self.books.write().unwrap_or_else(|e| e.into_inner());
        books.insert(symbol.to_string(), snap);
        drop(books);
        MD_UPDATES.with_label_values(&[symbol]).inc();
        true
    }

    pub fn snapshot(&self, symbol: &str) -> BookRead {
        self.snapshot_at(symbol, Instant::now())
    }

    pub fn snapshot_at(&self, symbol: &str, now: Instant) -> BookRead {
        let books = self.books.read().unwrap_or_else(|e| e.into_inner());
        match books.get(symbol) {
            Some(s) if now.saturating_duration_since(s.updated_at) <= self.stale_after => BookRead::Fresh(s.clone()),
            Some(s) => BookRead::Stale(Some(s.clone())),
            None => BookRead::Stale(None),
        }
    }
}

/// Random walk on the paper exchange (~5 updates/s), one tick-size step at a time.
pub async fn run_mock(gw: Arc<PaperGateway>, symbol: String, start_mid: Decimal, tick: Decimal) {
    let mut mid = start_mid;
    let floor = start_mid / Decimal::TWO;
    loop {
        // don't hold ThreadRng across .await
        let step: i64 = rand::thread_rng().gen_range(-3..=3);
        mid = (mid + tick * Decimal::from(step)).max(floor);
        gw.set_book(&symbol, mid - tick, mid + tick);
        sleep(Duration::from_millis(200)).await;
    }
}

/// Binance WS (read-only) best bid/ask via `bookTicker`.
///
/// - `ws_base` per market: spot `wss://stream.binance.com:9443/ws`, perp `wss://fstream.binance.com/ws`
/// - reconnects forever with exponential backoff + jitter
pub async fn run_binance(cache: Arc<MarketDataCache>, symbol: String, ws_base: String) {
    let topic = format!("{}@bookTicker", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);

    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(%ws_url, "connecting binance bookTicker");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to bookTicker");
                WS_CONNECTED.with_label_values(&["book"]).set(1);
                attempt = 0;

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            // {"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            if let Some((bid, ask)) = parse_book_ticker(&txt) {
                                cache.update(&symbol, bid, ask);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                WS_CONNECTED.with_label_values(&["book"]).set(0);
                info!("bookTicker disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        WS_RECONNECTS.with_label_values(&["book"]).inc();
        sleep(backoff_delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// 0.5s, 1s, 2s … capped at 32s, plus up to 250ms jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    let base_ms = 500u64.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

fn parse_book_ticker(txt: &str) -> Option<(Decimal, Decimal)> {
    let v = serde_json::from_str::<serde_json::Value>(txt).ok()?;
    let b = v.get("b")?.as_str()?.parse::<Decimal>().ok()?;
    let a = v.get("a")?.as_str()?.parse::<Decimal>().ok()?;
    Some((b, a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snapshot_derives_mid_and_spread() {
        let cache = MarketDataCache::new(Duration::from_secs(2));
        assert!(cache.update("SOLUSDT", dec!(239.400), dec!(239.416)));
        let snap = cache.snapshot("SOLUSDT");
        let s = snap.fresh().expect("fresh");
        assert_eq!(s.mid, dec!(239.408));
        assert_eq!(s.spread(), dec!(0.016));
        assert!(s.spread_pct() > Decimal::ZERO);
    }

    #[test]
    fn goes_stale_after_window() {
        let cache = MarketDataCache::new(Duration::from_secs(2));
        assert!(matches!(cache.snapshot("SOLUSDT"), BookRead::Stale(None)));
        cache.update("SOLUSDT", dec!(10), dec!(11));
        let later = Instant::now() + Duration::from_secs(3);
        match cache.snapshot_at("SOLUSDT", later) {
            BookRead::Stale(Some(last)) => assert_eq!(last.mid, dec!(10.5)),
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[test]
    fn crossed_book_is_ignored() {
        let cache = MarketDataCache::new(Duration::from_secs(2));
        assert!(!cache.update("SOLUSDT", dec!(11), dec!(10)));
        assert!(!cache.update("SOLUSDT", Decimal::ZERO, dec!(10)));
        assert!(matches!(cache.snapshot("SOLUSDT"), BookRead::Stale(None)));
    }

    #[test]
    fn book_ticker_payload() {
        let txt = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
        assert_eq!(parse_book_ticker(txt), Some((dec!(25.3519), dec!(25.3652))));
        assert_eq!(parse_book_ticker("{}"), None);
    }

    #[test]
    fn backoff_is_capped() {
        assert!(backoff_delay(0) >= Duration::from_millis(500));
        assert!(backoff_delay(40) <= Duration::from_millis(32_250));
    }
}
