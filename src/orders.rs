// ===============================
// src/orders.rs (order lifecycle manager)
// ===============================
//
// Owns every TrackedOrder; only the tick worker touches it.
//
//   place     : Pending --ack--> Open        (reject -> Rejected, timeout -> unknown_outcome)
//   exec      : cum_filled compared with what we already counted, never re-applied
//   sync_tick : keep makers still near target and young enough, cancel the rest,
//               place what is missing while each side stays <= max_orders
//   resync    : exchange open orders are the truth for what is live
//
// sync_tick and execute_ioc look at the stop flag before every exchange call
// and return early once it is set; cancel_all ignores it.
//
// Terminal orders leave the live set but stay in a short `closed` ring so a
// late fill report for them is still counted exactly once.
//
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    now_ns, Event, ExecReport, ExecStatus, Fill, IntentKind, OrderIntent, OrderState, Side, Symbol,
    TimeInForce, TrackedOrder,
};
use crate::gateway::{new_client_id, timed, CancelOutcome, Capabilities, ExchangeAdapter, GatewayError};
use crate::metrics::{DUPLICATE_FILLS, LIVE_ORDERS, ORDERS_CANCELLED, ORDERS_PLACED, UNKNOWN_EXECS};
use crate::posttrade::{log_exec, SessionStats};
use crate::recorder::EventSink;

const CLOSED_RING: usize = 512;

#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub max_orders: usize,
    pub reprice_tolerance_bps: Decimal,
    pub max_order_age: Duration,
    pub call_timeout: Duration,
}

pub struct OrderManager {
    gw: Arc<dyn ExchangeAdapter>,
    caps: Capabilities,
    symbol: Symbol,
    policy: OrderPolicy,
    live: HashMap<String, TrackedOrder>,
    closed: VecDeque<TrackedOrder>,
    tick_started: Instant,
    needs_resync: bool,
    stats: SessionStats,
    events: EventSink,
}

fn kind_label(kind: IntentKind) -> &'static str {
    match kind {
        IntentKind::Maker { .. } => "maker",
        IntentKind::DeRisk => "derisk",
        IntentKind::Taker => "taker",
    }
}

/// Moves `o` to `next`, stepping through Open when a report skips the ack.
fn advance(o: &mut TrackedOrder, next: OrderState) -> bool {
    if o.state == next && next != OrderState::PartiallyFilled {
        return true;
    }
    if o.state == OrderState::Pending && next != OrderState::Rejected && next != OrderState::Open {
        o.state = OrderState::Open;
    }
    if o.state.can_transition(next) {
        o.state = next;
        true
    } else {
        debug!(cl_id = %o.cl_id, from = o.state.as_str(), to = next.as_str(), "ignored backward transition");
        false
    }
}

impl OrderManager {
    pub fn new(gw: Arc<dyn ExchangeAdapter>, symbol: Symbol, policy: OrderPolicy, events: EventSink) -> Self {
        let caps = gw.capabilities();
        Self {
            gw,
            caps,
            symbol,
            policy,
            live: HashMap::new(),
            closed: VecDeque::with_capacity(CLOSED_RING),
            tick_started: Instant::now(),
            needs_resync: false,
            stats: SessionStats::default(),
            events,
        }
    }

    pub fn stats(&self) -> &SessionStats { &self.stats }

    pub fn needs_resync(&self) -> bool { self.needs_resync }

    pub fn request_resync(&mut self) { self.needs_resync = true; }

    /// Orders placed before this point count as "from an earlier tick".
    pub fn start_tick(&mut self) {
        self.tick_started = Instant::now();
    }

    pub fn live_count(&self, side: Side) -> usize {
        self.live.values().filter(|o| o.intent.side == side && o.state.is_live()).count()
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &TrackedOrder> {
        self.live.values()
    }

    fn refresh_gauges(&self) {
        for side in [Side::Buy, Side::Sell] {
            LIVE_ORDERS.with_label_values(&[side.as_str()]).set(self.live_count(side) as i64);
        }
    }

    fn retire(&mut self, cl_id: &str) {
        if let Some(o) = self.live.remove(cl_id) {
            if self.closed.len() == CLOSED_RING {
                self.closed.pop_front();
            }
            self.closed.push_back(o);
        }
    }

    // ---------------------------------------------------------------- place

    /// Places one intent. Only fatal adapter errors come back as Err.
    async fn place(&mut self, mut intent: OrderIntent) -> Result<(), GatewayError> {
        intent.size = self.symbol.floor_size(intent.size);
        if intent.size <= Decimal::ZERO {
            debug!(side = intent.side.as_str(), "size below lot, not placed");
            return Ok(());
        }
        if intent.tif == TimeInForce::Ioc && !self.caps.ioc {
            // maker-only venue: rests aggressively, swept next tick
            intent.tif = TimeInForce::Gtc;
        }

        let cl_id = new_client_id();
        self.live.insert(
            cl_id.clone(),
            TrackedOrder {
                cl_id: cl_id.clone(),
                exchange_id: None,
                intent: intent.clone(),
                state: OrderState::Pending,
                filled: Decimal::ZERO,
                placed_at: Instant::now(),
                unknown_outcome: false,
            },
        );

        let res = timed(
            "place",
            self.policy.call_timeout,
            self.gw.place_order(&self.symbol.name, &cl_id, intent.side, intent.price, intent.size, intent.tif),
        )
        .await;

        match res {
            Ok(ack) => {
                if let Some(o) = self.live.get_mut(&cl_id) {
                    o.exchange_id = Some(ack.exchange_id);
                    if o.state == OrderState::Pending {
                        advance(o, OrderState::Open);
                    }
                }
                self.stats.orders_placed += 1;
                ORDERS_PLACED.with_label_values(&[intent.side.as_str(), kind_label(intent.kind)]).inc();
                info!(
                    %cl_id,
                    side = intent.side.as_str(),
                    px = %intent.price,
                    qty = %intent.size,
                    tif = intent.tif.as_str(),
                    kind = kind_label(intent.kind),
                    "order placed"
                );
                self.events.record(Event::Placed { ts_ns: now_ns(), cl_id, intent });
            }
            Err(GatewayError::Rejected(reason)) => {
                if let Some(o) = self.live.get_mut(&cl_id) {
                    advance(o, OrderState::Rejected);
                }
                self.retire(&cl_id);
                self.stats.orders_rejected += 1;
                warn!(%cl_id, side = intent.side.as_str(), px = %intent.price, %reason, "order rejected");
            }
            Err(e) if e.is_fatal() => {
                self.live.remove(&cl_id);
                return Err(e);
            }
            Err(GatewayError::RateLimited(msg)) => {
                // never reached the book
                self.live.remove(&cl_id);
                warn!(%cl_id, %msg, "rate limited, intent dropped for this tick");
            }
            Err(e) => {
                // timeout or transport error: it may exist, resync decides
                if let Some(o) = self.live.get_mut(&cl_id) {
                    o.unknown_outcome = true;
                }
                self.needs_resync = true;
                warn!(%cl_id, error = %e, "placement outcome unknown");
            }
        }
        self.refresh_gauges();
        Ok(())
    }

    // --------------------------------------------------------------- cancel

    async fn cancel(&mut self, cl_id: &str) -> Result<bool, GatewayError> {
        let Some(o) = self.live.get(cl_id) else { return Ok(true) };
        let exchange_id = o.exchange_id.clone();
        let res = timed(
            "cancel",
            self.policy.call_timeout,
            self.gw.cancel_order(&self.symbol.name, cl_id, exchange_id.as_deref()),
        )
        .await;

        match res {
            Ok(outcome) => {
                if let Some(o) = self.live.get_mut(cl_id) {
                    advance(o, OrderState::Cancelled);
                }
                self.retire(cl_id);
                if outcome == CancelOutcome::Cancelled {
                    self.stats.orders_cancelled += 1;
                    ORDERS_CANCELLED.inc();
                }
                debug!(%cl_id, ?outcome, "cancel done");
                self.events.record(Event::Cancelled { ts_ns: now_ns(), cl_id: cl_id.to_string() });
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if let Some(o) = self.live.get_mut(cl_id) {
                    o.unknown_outcome = true;
                }
                self.needs_resync = true;
                warn!(%cl_id, error = %e, "cancel failed, order left for resync");
                Ok(false)
            }
        }
    }

    /// Cancels every live order. Safe to repeat; returns how many could not be confirmed.
    pub async fn cancel_all(&mut self) -> usize {
        let ids: Vec<String> = self.live.keys().cloned().collect();
        let mut residue = 0;
        for id in ids {
            match self.cancel(&id).await {
                Ok(true) => {}
                Ok(false) => residue += 1,
                Err(e) => {
                    warn!(cl_id = %id, error = %e, "cancel_all: fatal adapter error");
                    residue += 1;
                }
            }
        }
        self.refresh_gauges();
        if residue > 0 {
            warn!(residue, symbol = %self.symbol.name, "cancel_all left orders unconfirmed");
        } else {
            info!(symbol = %self.symbol.name, "cancel_all complete");
        }
        residue
    }

    // ---------------------------------------------------------------- ticks

    fn within_tolerance(&self, current: Decimal, target: Decimal) -> bool {
        if target.is_zero() {
            return current == target;
        }
        let bps = (current - target).abs() / target * Decimal::from(10_000);
        bps <= self.policy.reprice_tolerance_bps
    }

    /// Brings resting maker orders in line with this tick's maker intents.
    pub async fn sync_tick(&mut self, intents: &[OrderIntent], stop: &watch::Receiver<bool>) -> Result<(), GatewayError> {
        let now = Instant::now();
        let mut matched = vec![false; intents.len()];
        let mut to_cancel = Vec::new();

        let mut ids: Vec<&String> = self.live.keys().collect();
        ids.sort();
        for id in ids {
            let o = &self.live[id];
            if o.unknown_outcome {
                continue;
            }
            let keep = match o.intent.kind {
                IntentKind::Maker { layer } => {
                    let young = now.saturating_duration_since(o.placed_at) < self.policy.max_order_age;
                    let hit = intents.iter().enumerate().find(|(i, it)| {
                        !matched[*i]
                            && it.side == o.intent.side
                            && it.layer() == Some(layer)
                            && self.within_tolerance(o.intent.price, it.price)
                    });
                    match hit {
                        Some((i, _)) if young => {
                            matched[i] = true;
                            true
                        }
                        _ => false,
                    }
                }
                // taker / de-risk leftovers from an earlier tick never rest
                _ => o.placed_at >= self.tick_started,
            };
            if !keep {
                to_cancel.push(id.clone());
            }
        }

        for id in to_cancel {
            if *stop.borrow() {
                debug!("stop requested, sync cut short");
                self.refresh_gauges();
                return Ok(());
            }
            self.cancel(&id).await?;
        }

        for (i, intent) in intents.iter().enumerate() {
            if matched[i] {
                continue;
            }
            if *stop.borrow() {
                debug!("stop requested, sync cut short");
                break;
            }
            if self.live_count(intent.side) >= self.policy.max_orders {
                debug!(side = intent.side.as_str(), layer = ?intent.layer(), "side full, intent skipped");
                continue;
            }
            self.place(intent.clone()).await?;
        }
        self.refresh_gauges();
        Ok(())
    }

    /// Fires one IOC (de-risk or taker). It takes a slot first: if the side is
    /// full the deepest maker order on that side is cancelled to make room.
    pub async fn execute_ioc(&mut self, intent: OrderIntent, stop: &watch::Receiver<bool>) -> Result<(), GatewayError> {
        if *stop.borrow() {
            return Ok(());
        }
        if self.live_count(intent.side) >= self.policy.max_orders {
            let victim = self
                .live
                .values()
                .filter(|o| o.intent.side == intent.side && !o.unknown_outcome)
                .filter_map(|o| o.intent.layer().map(|l| (l, o.cl_id.clone())))
                .max_by_key(|(l, _)| *l)
                .map(|(_, id)| id);
            if let Some(id) = victim {
                self.cancel(&id).await?;
            }
        }
        if *stop.borrow() {
            return Ok(());
        }
        if self.live_count(intent.side) >= self.policy.max_orders {
            warn!(side = intent.side.as_str(), "no free slot for IOC, skipped this tick");
            return Ok(());
        }
        self.place(intent).await
    }

    // ----------------------------------------------------------- exec flow

    /// Applies one stream report. Returns the new fill quantity, if any.
    pub fn on_exec_report(&mut self, er: &ExecReport) -> Option<Fill> {
        log_exec(er);
        self.events.record(Event::Exec(er.clone()));

        let in_live = self.live.contains_key(&er.cl_id);
        let order = if in_live {
            self.live.get_mut(&er.cl_id)
        } else {
            self.closed.iter_mut().rev().find(|o| o.cl_id == er.cl_id)
        };
        let Some(o) = order else {
            UNKNOWN_EXECS.inc();
            if er.cum_filled > Decimal::ZERO {
                // a fill we cannot attribute: let position reconcile catch it
                self.needs_resync = true;
            }
            debug!(cl_id = %er.cl_id, status = er.status.label(), "report for untracked order");
            return None;
        };

        let delta = er.cum_filled - o.filled;
        let fill = if delta > Decimal::ZERO {
            o.filled = er.cum_filled;
            Some(Fill {
                cl_id: o.cl_id.clone(),
                side: o.intent.side,
                qty: delta,
                px: if er.last_px.is_zero() { o.intent.price } else { er.last_px },
                fee: er.fee,
                is_maker: er.is_maker,
                ts_ns: er.ts_ns,
            })
        } else {
            if matches!(er.status, ExecStatus::PartialFill | ExecStatus::Filled) {
                DUPLICATE_FILLS.inc();
            }
            None
        };

        let mut terminal = false;
        if in_live {
            o.unknown_outcome = false;
            let next = match &er.status {
                ExecStatus::Ack => OrderState::Open,
                ExecStatus::PartialFill => OrderState::PartiallyFilled,
                ExecStatus::Filled => OrderState::Filled,
                ExecStatus::Cancelled => OrderState::Cancelled,
                ExecStatus::Rejected(_) if o.state == OrderState::Pending => OrderState::Rejected,
                ExecStatus::Rejected(_) => OrderState::Cancelled,
            };
            if o.state == OrderState::Open && next == OrderState::Open {
                // plain ack after placement already confirmed
            } else {
                advance(o, next);
            }
            terminal = o.state.is_terminal();
            if matches!(er.status, ExecStatus::Rejected(_)) {
                self.stats.orders_rejected += 1;
            }
        }
        if terminal {
            self.retire(&er.cl_id);
            self.refresh_gauges();
        }
        if let Some(f) = &fill {
            self.stats.on_fill(f);
        }
        fill
    }

    // --------------------------------------------------------------- resync

    /// Exchange open orders win: missing ones are closed, unknown ones cancelled.
    pub async fn resync_orders(&mut self) -> Result<(), GatewayError> {
        let open = timed("open_orders", self.policy.call_timeout, self.gw.open_orders(&self.symbol.name)).await?;

        let ids: Vec<String> = self.live.keys().cloned().collect();
        for id in ids {
            match open.iter().find(|x| x.cl_id == id) {
                Some(x) => {
                    if let Some(o) = self.live.get_mut(&id) {
                        o.exchange_id = Some(x.exchange_id.clone());
                        o.unknown_outcome = false;
                        if o.state == OrderState::Pending {
                            advance(o, OrderState::Open);
                        }
                    }
                }
                None => {
                    if let Some(o) = self.live.get_mut(&id) {
                        debug!(cl_id = %id, state = o.state.as_str(), "not on exchange, closing");
                        advance(o, OrderState::Cancelled);
                    }
                    self.retire(&id);
                }
            }
        }

        let orphans: Vec<String> = open
            .iter()
            .filter(|x| !self.live.contains_key(&x.cl_id))
            .map(|x| x.cl_id.clone())
            .collect();
        for id in orphans {
            warn!(cl_id = %id, "orphan order on exchange, cancelling");
            let res = timed(
                "cancel",
                self.policy.call_timeout,
                self.gw.cancel_order(&self.symbol.name, &id, None),
            )
            .await;
            match res {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(cl_id = %id, error = %e, "orphan cancel failed"),
            }
        }

        self.needs_resync = false;
        self.refresh_gauges();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketType;
    use crate::feed::MarketDataCache;
    use crate::gateway::StreamSink;
    use crate::gateway_paper::{Fault, Op, PaperGateway};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Rig {
        gw: Arc<PaperGateway>,
        olm: OrderManager,
        rx: mpsc::Receiver<ExecReport>,
        stop_tx: watch::Sender<bool>,
        stop: watch::Receiver<bool>,
    }

    fn symbol() -> Symbol {
        Symbol {
            name: "SOLUSDT".into(),
            market: MarketType::Perpetual,
            base_asset: "SOL".into(),
            quote_asset: "USDT".into(),
            tick_size: dec!(0.01),
            lot_size: dec!(0.001),
        }
    }

    async fn rig(max_orders: usize) -> Rig {
        let gw = Arc::new(PaperGateway::new(dec!(0.01), dec!(0.001)));
        let cache = Arc::new(MarketDataCache::new(Duration::from_secs(2)));
        let (tx, rx) = mpsc::channel(256);
        gw.subscribe("SOLUSDT", StreamSink { cache, exec_tx: tx }).await.unwrap();
        gw.set_book("SOLUSDT", dec!(99.99), dec!(100.01));
        let policy = OrderPolicy {
            max_orders,
            reprice_tolerance_bps: dec!(2),
            max_order_age: Duration::from_secs(30),
            call_timeout: Duration::from_millis(200),
        };
        let olm = OrderManager::new(gw.clone(), symbol(), policy, EventSink::disabled());
        let (stop_tx, stop) = watch::channel(false);
        Rig { gw, olm, rx, stop_tx, stop }
    }

    fn drain(r: &mut Rig) -> Vec<Fill> {
        let mut fills = Vec::new();
        while let Ok(er) = r.rx.try_recv() {
            if let Some(f) = r.olm.on_exec_report(&er) {
                fills.push(f);
            }
        }
        fills
    }

    fn ladder(mid: Decimal, n: usize) -> Vec<OrderIntent> {
        let mut out = Vec::new();
        for k in 0..n {
            let off = dec!(0.1) * Decimal::from(k + 1);
            out.push(OrderIntent::maker(Side::Buy, mid - off, dec!(0.1), k));
            out.push(OrderIntent::maker(Side::Sell, mid + off, dec!(0.1), k));
        }
        out
    }

    #[tokio::test]
    async fn never_exceeds_max_orders_per_side() {
        let mut r = rig(2).await;
        r.olm.sync_tick(&ladder(dec!(100), 4), &r.stop).await.unwrap();
        assert_eq!(r.olm.live_count(Side::Buy), 2);
        assert_eq!(r.olm.live_count(Side::Sell), 2);
        assert_eq!(r.gw.resting_count("SOLUSDT"), 4);

        // same targets again: nothing churns
        drain(&mut r);
        r.olm.start_tick();
        r.olm.sync_tick(&ladder(dec!(100), 4), &r.stop).await.unwrap();
        assert_eq!(r.olm.live_count(Side::Buy), 2);
        assert_eq!(r.olm.stats().orders_cancelled, 0);
        assert_eq!(r.olm.stats().orders_placed, 4);
    }

    #[tokio::test]
    async fn moved_target_replaces_order() {
        let mut r = rig(1).await;
        r.olm.sync_tick(&ladder(dec!(100), 1), &r.stop).await.unwrap();
        drain(&mut r);
        // 5 bps away, beyond the 2 bps tolerance
        r.olm.sync_tick(&ladder(dec!(100.05), 1), &r.stop).await.unwrap();
        assert_eq!(r.olm.stats().orders_cancelled, 2);
        assert_eq!(r.olm.live_count(Side::Buy), 1);
        let bid = r.olm.live_orders().find(|o| o.intent.side == Side::Buy).unwrap();
        assert_eq!(bid.intent.price, dec!(99.95));

        // within tolerance: kept
        r.olm.sync_tick(&ladder(dec!(100.06), 1), &r.stop).await.unwrap();
        assert_eq!(r.olm.stats().orders_cancelled, 2);
    }

    #[tokio::test]
    async fn cancel_all_then_empty_sync_leaves_nothing_live() {
        let mut r = rig(3).await;
        r.olm.sync_tick(&ladder(dec!(100), 3), &r.stop).await.unwrap();
        assert_eq!(r.olm.cancel_all().await, 0);
        r.olm.sync_tick(&[], &r.stop).await.unwrap();
        assert_eq!(r.olm.live_count(Side::Buy) + r.olm.live_count(Side::Sell), 0);
        assert_eq!(r.gw.resting_count("SOLUSDT"), 0);
        // idempotent
        assert_eq!(r.olm.cancel_all().await, 0);
    }

    #[tokio::test]
    async fn duplicate_fill_reports_apply_once() {
        let mut r = rig(3).await;
        r.olm.sync_tick(&[OrderIntent::maker(Side::Buy, dec!(99.90), dec!(0.1), 0)], &r.stop).await.unwrap();
        drain(&mut r);
        r.gw.set_book("SOLUSDT", dec!(99.80), dec!(99.90));
        let mut reports = Vec::new();
        while let Ok(er) = r.rx.try_recv() {
            reports.push(er);
        }
        let filled = reports.iter().find(|e| e.status == ExecStatus::Filled).unwrap().clone();

        let mut total = Decimal::ZERO;
        for er in [filled.clone(), filled.clone(), filled] {
            if let Some(f) = r.olm.on_exec_report(&er) {
                total += f.qty;
            }
        }
        assert_eq!(total, dec!(0.1));
        assert_eq!(r.olm.live_count(Side::Buy), 0);
        assert_eq!(r.olm.stats().trades, 1);
    }

    #[tokio::test]
    async fn partial_then_duplicate_then_final() {
        let mut r = rig(3).await;
        r.olm.sync_tick(&[OrderIntent::maker(Side::Sell, dec!(100.50), dec!(0.3), 0)], &r.stop).await.unwrap();
        drain(&mut r);
        let cl_id = r.olm.live_orders().next().unwrap().cl_id.clone();
        let rep = |status, cum| ExecReport {
            cl_id: cl_id.clone(),
            symbol: "SOLUSDT".into(),
            status,
            cum_filled: cum,
            last_px: dec!(100.50),
            fee: Decimal::ZERO,
            is_maker: true,
            ts_ns: 0,
        };
        let a = r.olm.on_exec_report(&rep(ExecStatus::PartialFill, dec!(0.1))).unwrap();
        assert_eq!(a.qty, dec!(0.1));
        assert!(r.olm.on_exec_report(&rep(ExecStatus::PartialFill, dec!(0.1))).is_none());
        // out of order, older cumulative value
        assert!(r.olm.on_exec_report(&rep(ExecStatus::PartialFill, dec!(0.05))).is_none());
        let b = r.olm.on_exec_report(&rep(ExecStatus::Filled, dec!(0.3))).unwrap();
        assert_eq!(b.qty, dec!(0.2));
        assert_eq!(r.olm.live_count(Side::Sell), 0);
        // late duplicate after the order left the live set
        assert!(r.olm.on_exec_report(&rep(ExecStatus::Filled, dec!(0.3))).is_none());
    }

    #[tokio::test]
    async fn rejected_placement_is_not_retried_in_tick() {
        let mut r = rig(3).await;
        r.gw.inject(Op::Place, Fault::Reject("insufficient balance".into()));
        r.olm.sync_tick(&[OrderIntent::maker(Side::Buy, dec!(99.5), dec!(0.1), 0)], &r.stop).await.unwrap();
        assert_eq!(r.olm.live_count(Side::Buy), 0);
        assert_eq!(r.olm.stats().orders_rejected, 1);
        // intent persists next tick -> placed
        r.olm.sync_tick(&[OrderIntent::maker(Side::Buy, dec!(99.5), dec!(0.1), 0)], &r.stop).await.unwrap();
        assert_eq!(r.olm.live_count(Side::Buy), 1);
    }

    #[tokio::test]
    async fn already_terminal_cancel_counts_as_done() {
        let mut r = rig(3).await;
        r.olm.sync_tick(&[OrderIntent::maker(Side::Buy, dec!(99.90), dec!(0.1), 0)], &r.stop).await.unwrap();
        // fills on the exchange but the report has not been drained yet
        r.gw.set_book("SOLUSDT", dec!(99.80), dec!(99.90));
        assert_eq!(r.olm.cancel_all().await, 0);
        assert_eq!(r.olm.live_count(Side::Buy), 0);
        // the late fill is still attributed
        let fills = drain(&mut r);
        assert_eq!(fills.iter().map(|f| f.qty).sum::<Decimal>(), dec!(0.1));
    }

    #[tokio::test]
    async fn timed_out_placement_is_resolved_by_resync() {
        let mut r = rig(3).await;
        r.gw.inject(Op::Place, Fault::Delay(Duration::from_millis(500)));
        r.olm.sync_tick(&[OrderIntent::maker(Side::Sell, dec!(100.4), dec!(0.1), 0)], &r.stop).await.unwrap();
        assert!(r.olm.needs_resync());
        let o = r.olm.live_orders().next().unwrap();
        assert!(o.unknown_outcome);
        assert_eq!(o.state, OrderState::Pending);

        r.olm.resync_orders().await.unwrap();
        assert!(!r.olm.needs_resync());
        let o = r.olm.live_orders().next().unwrap();
        assert_eq!(o.state, OrderState::Open);
        assert!(!o.unknown_outcome);
    }

    #[tokio::test]
    async fn resync_cancels_orphans_and_closes_missing() {
        let mut r = rig(3).await;
        // orphan: placed behind the manager's back
        r.gw.place_order("SOLUSDT", "manual-1", Side::Buy, dec!(95), dec!(0.1), TimeInForce::Gtc).await.unwrap();
        r.olm.sync_tick(&[OrderIntent::maker(Side::Sell, dec!(100.4), dec!(0.1), 0)], &r.stop).await.unwrap();
        // the tracked order vanishes without a report
        r.gw.mute_reports(true);
        let id = r.olm.live_orders().next().unwrap().cl_id.clone();
        r.gw.cancel_order("SOLUSDT", &id, None).await.unwrap();

        r.olm.resync_orders().await.unwrap();
        assert_eq!(r.olm.live_count(Side::Sell), 0);
        assert_eq!(r.gw.resting_count("SOLUSDT"), 0);
    }

    #[tokio::test]
    async fn ioc_takes_priority_over_deepest_maker() {
        let mut r = rig(2).await;
        r.olm.sync_tick(&ladder(dec!(100), 2), &r.stop).await.unwrap();
        drain(&mut r);
        assert_eq!(r.olm.live_count(Side::Sell), 2);
        r.olm.start_tick();
        r.olm
            .execute_ioc(OrderIntent::ioc(Side::Sell, dec!(99.90), dec!(0.05), IntentKind::DeRisk), &r.stop)
            .await
            .unwrap();
        let fills = drain(&mut r);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, Side::Sell);
        assert!(!fills[0].is_maker);
        // layer 1 ask made room, layer 0 still resting
        let asks: Vec<_> = r.olm.live_orders().filter(|o| o.intent.side == Side::Sell).collect();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].intent.layer(), Some(0));
    }

    #[tokio::test]
    async fn fatal_error_propagates() {
        let mut r = rig(3).await;
        r.gw.inject(Op::Place, Fault::Auth);
        let err = r.olm.sync_tick(&ladder(dec!(100), 1), &r.stop).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn stop_flag_halts_sync_but_not_cancel_all() {
        let mut r = rig(3).await;
        r.olm.sync_tick(&ladder(dec!(100), 1), &r.stop).await.unwrap();
        assert_eq!(r.gw.resting_count("SOLUSDT"), 2);

        r.stop_tx.send(true).unwrap();
        // moved ladder: neither cancels nor places once stopping
        r.olm.sync_tick(&ladder(dec!(101), 3), &r.stop).await.unwrap();
        r.olm
            .execute_ioc(OrderIntent::ioc(Side::Sell, dec!(99.90), dec!(0.05), IntentKind::DeRisk), &r.stop)
            .await
            .unwrap();
        assert_eq!(r.olm.stats().orders_placed, 2);
        assert_eq!(r.olm.stats().orders_cancelled, 0);

        assert_eq!(r.olm.cancel_all().await, 0);
        assert_eq!(r.gw.resting_count("SOLUSDT"), 0);
    }
}
