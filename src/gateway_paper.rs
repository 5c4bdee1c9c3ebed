// ===============================
// src/gateway_paper.rs (simulated exchange)
// ===============================
//
// In-process exchange used for dry runs and as the adapter in tests.
// - book is driven by feed::run_mock (or set_book from tests)
// - GTC orders rest and fill in full at their limit once the book crosses them
// - IOC fills at the touch when marketable, otherwise expires
// - the exchange-side position here is the authoritative one
// - faults can be queued per operation to exercise error paths
//
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::{now_ns, ExecReport, ExecStatus, MarketType, Side, Symbol, TimeInForce};
use crate::gateway::{
    Balance, CancelOutcome, Capabilities, ExchangeAdapter, GatewayError, OpenOrder, PlaceAck,
    PositionInfo, StreamSink,
};
use crate::metrics::EXECS;

const START_CASH: Decimal = dec!(10000);

/// Queued per operation, consumed one per call.
#[derive(Debug, Clone)]
pub enum Fault {
    Reject(String),
    Auth,
    /// The call still takes effect, the reply is just late.
    Delay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op { Place, Cancel, Position, OpenOrders }

#[derive(Debug, Clone)]
struct PaperOrder {
    cl_id: String,
    exchange_id: String,
    symbol: String,
    side: Side,
    price: Decimal,
    size: Decimal,
}

#[derive(Default)]
struct PaperState {
    books: HashMap<String, (Decimal, Decimal)>,
    resting: Vec<PaperOrder>,
    net: Decimal,
    entry: Decimal,
    cash: Decimal,
    next_id: u64,
    sinks: Vec<(String, StreamSink)>,
    faults: HashMap<Op, VecDeque<Fault>>,
    mute_reports: bool,
}

impl PaperState {
    fn emit(&self, report: ExecReport) {
        EXECS.with_label_values(&[report.status.label()]).inc();
        if self.mute_reports {
            debug!(cl_id = %report.cl_id, "paper: report muted");
            return;
        }
        for (sym, sink) in &self.sinks {
            if *sym == report.symbol {
                if let Err(e) = sink.exec_tx.try_send(report.clone()) {
                    warn!(?e, cl_id = %report.cl_id, "paper: exec channel full, report dropped");
                }
            }
        }
    }

    fn apply_fill(&mut self, side: Side, qty: Decimal, px: Decimal, fee: Decimal) {
        let signed = side.sign() * qty;
        let prev = self.net;
        let next = prev + signed;
        if prev.is_zero() || prev.is_sign_positive() == signed.is_sign_positive() {
            self.entry = (self.entry * prev.abs() + px * qty) / next.abs();
        } else if next.is_zero() {
            self.entry = Decimal::ZERO;
        } else if next.is_sign_positive() != prev.is_sign_positive() {
            self.entry = px;
        }
        self.net = next;
        self.cash -= signed * px + fee;
    }

    fn take_fault(&mut self, op: Op) -> Option<Fault> {
        self.faults.get_mut(&op).and_then(|q| q.pop_front())
    }
}

fn report(o: &PaperOrder, status: ExecStatus, cum: Decimal, px: Decimal, fee: Decimal, is_maker: bool) -> ExecReport {
    ExecReport {
        cl_id: o.cl_id.clone(),
        symbol: o.symbol.clone(),
        status,
        cum_filled: cum,
        last_px: px,
        fee,
        is_maker,
        ts_ns: now_ns(),
    }
}

pub struct PaperGateway {
    state: Mutex<PaperState>,
    caps: Capabilities,
    tick_size: Decimal,
    lot_size: Decimal,
    maker_fee: Decimal,
    taker_fee: Decimal,
}

impl PaperGateway {
    pub fn new(tick_size: Decimal, lot_size: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState { cash: START_CASH, ..Default::default() }),
            caps: Capabilities { maker: true, ioc: true },
            tick_size,
            lot_size,
            // 2 bps maker, 5 bps taker
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0005),
        }
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// New top of book: pushes to subscribers and fills whatever it crosses.
    pub fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut st = self.lock();
        st.books.insert(symbol.to_string(), (bid, ask));
        for (sym, sink) in &st.sinks {
            if sym == symbol {
                sink.cache.update(symbol, bid, ask);
            }
        }

        let (crossed, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut st.resting).into_iter().partition(|o| {
            o.symbol == symbol
                && match o.side {
                    Side::Buy => ask <= o.price,
                    Side::Sell => bid >= o.price,
                }
        });
        st.resting = keep;
        for o in crossed {
            let fee = o.price * o.size * self.maker_fee;
            st.apply_fill(o.side, o.size, o.price, fee);
            debug!(cl_id = %o.cl_id, side = o.side.as_str(), px = %o.price, qty = %o.size, "paper: maker fill");
            st.emit(report(&o, ExecStatus::Filled, o.size, o.price, fee, true));
        }
    }

    pub fn inject(&self, op: Op, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Drops stream reports while set, as if the user stream missed them.
    pub fn mute_reports(&self, mute: bool) {
        self.lock().mute_reports = mute;
    }

    /// Overwrites the exchange-side position, e.g. a fill the engine never saw.
    pub fn force_position(&self, net: Decimal, entry: Decimal) {
        let mut st = self.lock();
        st.net = net;
        st.entry = entry;
    }

    pub fn resting_count(&self, symbol: &str) -> usize {
        self.lock().resting.iter().filter(|o| o.symbol == symbol).count()
    }

    /// Applies a queued fault: Err for failures, the delay for `Delay`.
    fn check(&self, op: Op) -> Result<Option<Duration>, GatewayError> {
        match self.lock().take_fault(op) {
            None => Ok(None),
            Some(Fault::Delay(d)) => Ok(Some(d)),
            Some(Fault::Reject(r)) => Err(GatewayError::Rejected(r)),
            Some(Fault::Auth) => Err(GatewayError::Auth("injected".into())),
        }
    }
}

fn split_pair(name: &str) -> (String, String) {
    for quote in ["USDT", "USDC", "FDUSD", "BUSD", "BTC", "ETH"] {
        if let Some(base) = name.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (name.to_string(), "USDT".to_string())
}

#[async_trait]
impl ExchangeAdapter for PaperGateway {
    fn name(&self) -> &str { "paper" }

    fn capabilities(&self) -> Capabilities { self.caps }

    async fn symbol_info(&self, symbol: &str, market: MarketType) -> Result<Symbol, GatewayError> {
        let (base_asset, quote_asset) = split_pair(symbol);
        Ok(Symbol {
            name: symbol.to_string(),
            market,
            base_asset,
            quote_asset,
            tick_size: self.tick_size,
            lot_size: self.lot_size,
        })
    }

    async fn order_book(&self, symbol: &str) -> Result<(Decimal, Decimal), GatewayError> {
        self.lock()
            .books
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Transient(format!("no book for {symbol}")))
    }

    async fn subscribe(&self, symbol: &str, sink: StreamSink) -> Result<(), GatewayError> {
        let mut st = self.lock();
        if let Some((bid, ask)) = st.books.get(symbol).copied() {
            sink.cache.update(symbol, bid, ask);
        }
        st.sinks.push((symbol.to_string(), sink));
        Ok(())
    }

    async fn place_order(
        &self,
        symbol: &str,
        cl_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        tif: TimeInForce,
    ) -> Result<PlaceAck, GatewayError> {
        let delay = self.check(Op::Place)?;
        if tif == TimeInForce::Ioc && !self.caps.ioc {
            return Err(GatewayError::Rejected("IOC not supported".into()));
        }
        if price <= Decimal::ZERO || size < self.lot_size {
            return Err(GatewayError::Rejected(format!("invalid price {price} / size {size}")));
        }

        let exchange_id = {
            let mut st = self.lock();
            st.next_id += 1;
            let o = PaperOrder {
                cl_id: cl_id.to_string(),
                exchange_id: format!("P{}", st.next_id),
                symbol: symbol.to_string(),
                side,
                price,
                size,
            };
            st.emit(report(&o, ExecStatus::Ack, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, false));

            let touch = st.books.get(symbol).and_then(|&(bid, ask)| match side {
                Side::Buy if ask <= price => Some(ask),
                Side::Sell if bid >= price => Some(bid),
                _ => None,
            });
            match (touch, tif) {
                (Some(px), _) => {
                    let fee = px * size * self.taker_fee;
                    st.apply_fill(side, size, px, fee);
                    st.emit(report(&o, ExecStatus::Filled, size, px, fee, false));
                }
                (None, TimeInForce::Ioc) => {
                    st.emit(report(&o, ExecStatus::Cancelled, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, false));
                }
                (None, TimeInForce::Gtc) => st.resting.push(o.clone()),
            }
            o.exchange_id
        };

        if let Some(d) = delay {
            sleep(d).await;
        }
        Ok(PlaceAck { exchange_id })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        cl_id: &str,
        _exchange_id: Option<&str>,
    ) -> Result<CancelOutcome, GatewayError> {
        let delay = self.check(Op::Cancel)?;
        let outcome = {
            let mut st = self.lock();
            match st.resting.iter().position(|o| o.symbol == symbol && o.cl_id == cl_id) {
                Some(i) => {
                    let o = st.resting.remove(i);
                    st.emit(report(&o, ExecStatus::Cancelled, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, false));
                    CancelOutcome::Cancelled
                }
                None => CancelOutcome::AlreadyTerminal,
            }
        };
        if let Some(d) = delay {
            sleep(d).await;
        }
        Ok(outcome)
    }

    async fn position(&self, _symbol: &str) -> Result<PositionInfo, GatewayError> {
        if let Some(d) = self.check(Op::Position)? {
            sleep(d).await;
        }
        let st = self.lock();
        Ok(PositionInfo { net: st.net, entry_price: st.entry })
    }

    async fn balances(&self) -> Result<Vec<Balance>, GatewayError> {
        let st = self.lock();
        Ok(vec![Balance { asset: "USDT".into(), free: st.cash, locked: Decimal::ZERO }])
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        if let Some(d) = self.check(Op::OpenOrders)? {
            sleep(d).await;
        }
        let st = self.lock();
        Ok(st
            .resting
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| OpenOrder {
                cl_id: o.cl_id.clone(),
                exchange_id: o.exchange_id.clone(),
                side: o.side,
                price: o.price,
                size: o.size,
                filled: Decimal::ZERO,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MarketDataCache;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn setup() -> (PaperGateway, mpsc::Receiver<ExecReport>, Arc<MarketDataCache>) {
        let gw = PaperGateway::new(dec!(0.01), dec!(0.001));
        let cache = Arc::new(MarketDataCache::new(Duration::from_secs(2)));
        let (tx, rx) = mpsc::channel(64);
        gw.subscribe("SOLUSDT", StreamSink { cache: cache.clone(), exec_tx: tx }).await.unwrap();
        gw.set_book("SOLUSDT", dec!(99.99), dec!(100.01));
        (gw, rx, cache)
    }

    fn drain(rx: &mut mpsc::Receiver<ExecReport>) -> Vec<ExecReport> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn book_reaches_cache() {
        let (_gw, _rx, cache) = setup().await;
        assert_eq!(cache.snapshot("SOLUSDT").fresh().unwrap().mid, dec!(100));
    }

    #[tokio::test]
    async fn resting_bid_fills_when_book_crosses() {
        let (gw, mut rx, _) = setup().await;
        gw.place_order("SOLUSDT", "c1", Side::Buy, dec!(99.90), dec!(0.1), TimeInForce::Gtc).await.unwrap();
        assert_eq!(gw.resting_count("SOLUSDT"), 1);
        gw.set_book("SOLUSDT", dec!(99.80), dec!(99.90));
        assert_eq!(gw.resting_count("SOLUSDT"), 0);

        let reports = drain(&mut rx);
        let fill = reports.iter().find(|r| r.status == ExecStatus::Filled).unwrap();
        assert_eq!(fill.cum_filled, dec!(0.1));
        assert_eq!(fill.last_px, dec!(99.90));
        assert!(fill.is_maker);
        assert_eq!(gw.position("SOLUSDT").await.unwrap().net, dec!(0.1));
    }

    #[tokio::test]
    async fn ioc_fills_at_touch_or_expires() {
        let (gw, mut rx, _) = setup().await;
        gw.place_order("SOLUSDT", "t1", Side::Sell, dec!(99.00), dec!(0.2), TimeInForce::Ioc).await.unwrap();
        gw.place_order("SOLUSDT", "t2", Side::Buy, dec!(99.00), dec!(0.2), TimeInForce::Ioc).await.unwrap();
        let reports = drain(&mut rx);
        let t1 = reports.iter().find(|r| r.cl_id == "t1" && r.status == ExecStatus::Filled).unwrap();
        assert_eq!(t1.last_px, dec!(99.99));
        assert!(reports.iter().any(|r| r.cl_id == "t2" && r.status == ExecStatus::Cancelled));
        let pos = gw.position("SOLUSDT").await.unwrap();
        assert_eq!(pos.net, dec!(-0.2));
        assert_eq!(pos.entry_price, dec!(99.99));
        assert_eq!(gw.resting_count("SOLUSDT"), 0);
    }

    #[tokio::test]
    async fn cancel_of_gone_order_is_already_terminal() {
        let (gw, _rx, _) = setup().await;
        gw.place_order("SOLUSDT", "c1", Side::Sell, dec!(100.10), dec!(0.1), TimeInForce::Gtc).await.unwrap();
        assert_eq!(gw.cancel_order("SOLUSDT", "c1", None).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(gw.cancel_order("SOLUSDT", "c1", None).await.unwrap(), CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let (gw, _rx, _) = setup().await;
        gw.inject(Op::Place, Fault::Reject("insufficient balance".into()));
        gw.inject(Op::Place, Fault::Auth);
        let r1 = gw.place_order("SOLUSDT", "a", Side::Buy, dec!(99), dec!(0.1), TimeInForce::Gtc).await;
        let r2 = gw.place_order("SOLUSDT", "b", Side::Buy, dec!(99), dec!(0.1), TimeInForce::Gtc).await;
        let r3 = gw.place_order("SOLUSDT", "c", Side::Buy, dec!(99), dec!(0.1), TimeInForce::Gtc).await;
        assert!(matches!(r1, Err(GatewayError::Rejected(_))));
        assert!(matches!(r2, Err(e) if e.is_fatal()));
        assert!(r3.is_ok());
    }

    #[tokio::test]
    async fn maker_only_venue_refuses_ioc() {
        let gw = PaperGateway::new(dec!(0.01), dec!(0.001)).with_capabilities(Capabilities { maker: true, ioc: false });
        let r = gw.place_order("SOLUSDT", "x", Side::Buy, dec!(100), dec!(0.1), TimeInForce::Ioc).await;
        assert!(matches!(r, Err(GatewayError::Rejected(_))));
    }

    #[test]
    fn pair_split() {
        assert_eq!(split_pair("SOLUSDT"), ("SOL".to_string(), "USDT".to_string()));
        assert_eq!(split_pair("ETHBTC"), ("ETH".to_string(), "BTC".to_string()));
    }
}
