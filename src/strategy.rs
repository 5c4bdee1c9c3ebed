// ===============================
// src/strategy.rs
// ===============================
//
// The tick worker. One Engine per symbol, driven at a fixed interval:
//
//   1) drain exec reports -> OrderManager -> PositionTracker
//   2) compare position with the exchange; full order re-sync on cadence,
//      after a timeout, or when the position diverged
//   3) market snapshot; stale data means no quoting this tick
//   4) risk controller; de-risk IOC goes out first whatever the mode
//   5) maker: layered GTC quotes via sync_tick
//      taker: IOC pair through the touch, nothing left resting
//   6) publish position
//
// Idle -> Running -> Draining (stop signal, duration, fatal error) -> Stopped
//
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, Mode, StrategyConfig};
use crate::domain::{now_ns, Event, ExecReport, IntentKind, OrderIntent, PositionState, Side, Symbol};
use crate::feed::MarketDataCache;
use crate::gateway::{timed, ExchangeAdapter, GatewayError};
use crate::metrics::{RESYNCS, TICKS};
use crate::orders::{OrderManager, OrderPolicy};
use crate::positions::PositionTracker;
use crate::posttrade::SessionStats;
use crate::quote::{compute_levels, taker_price, top_of_book, QuoteParams};
use crate::recorder::EventSink;
use crate::risk::{RiskController, RiskLimits};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fatal exchange error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{exchange} cannot run {mode} mode")]
    Unsupported { exchange: String, mode: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState { Idle, Running, Draining, Stopped }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Quoted,
    Taker,
    /// No fresh book: heartbeat only (risk still ran).
    Stale,
    /// Degenerate quote or stop requested mid-tick.
    Skipped,
    /// Position was overwritten from the exchange; maker quoting skipped.
    Resync,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Quoted => "quoted",
            TickOutcome::Taker => "taker",
            TickOutcome::Stale => "stale",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Resync => "resync",
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

pub struct Engine {
    cfg: StrategyConfig,
    symbol: Symbol,
    gw: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketDataCache>,
    exec_rx: mpsc::Receiver<ExecReport>,
    olm: OrderManager,
    tracker: PositionTracker,
    risk: RiskController,
    quote: QuoteParams,
    events: EventSink,
    state: RunState,
    ticks: u64,
}

impl Engine {
    pub fn new(
        cfg: StrategyConfig,
        symbol: Symbol,
        gw: Arc<dyn ExchangeAdapter>,
        cache: Arc<MarketDataCache>,
        exec_rx: mpsc::Receiver<ExecReport>,
        events: EventSink,
    ) -> Result<(Self, watch::Receiver<PositionState>), EngineError> {
        let caps = gw.capabilities();
        let supported = match cfg.mode {
            Mode::Maker => caps.maker,
            Mode::Taker => caps.ioc,
        };
        if !supported {
            return Err(EngineError::Unsupported { exchange: gw.name().to_string(), mode: cfg.mode.as_str() });
        }

        let olm = OrderManager::new(
            gw.clone(),
            symbol.clone(),
            OrderPolicy {
                max_orders: cfg.max_orders,
                reprice_tolerance_bps: cfg.reprice_tolerance_bps,
                max_order_age: cfg.max_order_age,
                call_timeout: cfg.call_timeout,
            },
            events.clone(),
        );
        let (tracker, pos_rx) =
            PositionTracker::new(&symbol.name, cfg.target_position, cfg.max_position, cfg.position_threshold);
        let risk = RiskController::new(RiskLimits::from_config(&cfg, symbol.lot_size));
        let quote = QuoteParams {
            spread_pct: cfg.spread_pct,
            inventory_skew: cfg.inventory_skew,
            max_position: cfg.max_position,
            layer_step: cfg.layer_step,
        };

        Ok((
            Self {
                cfg,
                symbol,
                gw,
                cache,
                exec_rx,
                olm,
                tracker,
                risk,
                quote,
                events,
                state: RunState::Idle,
                ticks: 0,
            },
            pos_rx,
        ))
    }

    pub fn state(&self) -> RunState { self.state }

    pub fn position(&self) -> &PositionState { self.tracker.state() }

    pub fn orders(&self) -> &OrderManager { &self.olm }

    /// Runs until the stop flag flips, the duration is up, or a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SessionStats, EngineError> {
        self.state = RunState::Running;
        let deadline = Instant::now() + self.cfg.duration;
        info!(
            symbol = %self.symbol.name,
            market = self.symbol.market.as_str(),
            mode = self.cfg.mode.as_str(),
            interval_s = self.cfg.interval.as_secs_f64(),
            duration_s = self.cfg.duration.as_secs_f64(),
            "strategy running"
        );

        let mut ticker = interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => {
                    info!("duration reached");
                    break Ok(());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || stop_requested(&shutdown) {
                        info!("stop signal received");
                        break Ok(());
                    }
                    continue;
                }
            }
            if stop_requested(&shutdown) {
                break Ok(());
            }
            match self.tick(&shutdown).await {
                Ok(outcome) => TICKS.with_label_values(&[outcome.as_str()]).inc(),
                Err(e) => {
                    error!(error = %e, "fatal error, shutting down");
                    break Err(e);
                }
            }
        };

        self.drain().await;
        result.map(|_| self.olm.stats().clone())
    }

    /// Cancels everything, applies the last reports, logs the session.
    pub async fn drain(&mut self) -> usize {
        self.state = RunState::Draining;
        let residue = self.olm.cancel_all().await;
        self.drain_exec();
        self.tracker.publish();
        self.tracker.log_summary();
        self.olm.stats().log_summary(self.tracker.state().realized_pnl);
        self.state = RunState::Stopped;
        info!(residue, "strategy stopped");
        residue
    }

    fn drain_exec(&mut self) {
        while let Ok(er) = self.exec_rx.try_recv() {
            if er.symbol != self.symbol.name {
                continue;
            }
            if let Some(fill) = self.olm.on_exec_report(&er) {
                let realized = self.tracker.on_fill(&fill);
                info!(
                    cl_id = %fill.cl_id,
                    side = fill.side.as_str(),
                    qty = %fill.qty,
                    px = %fill.px,
                    fee = %fill.fee,
                    maker = fill.is_maker,
                    realized = %realized.round_dp(8),
                    net = %self.tracker.net(),
                    total_realized = %self.tracker.state().realized_pnl.round_dp(8),
                    "fill"
                );
            }
        }
    }

    /// Position check every tick; returns true when the local value was replaced.
    async fn reconcile(&mut self) -> Result<bool, GatewayError> {
        let cadence = self.ticks % self.cfg.reconcile_every == 0;
        let forced = self.olm.needs_resync();

        let diverged = match timed("position", self.cfg.call_timeout, self.gw.position(&self.symbol.name)).await {
            Ok(auth) => self.tracker.reconcile(&auth, self.cfg.reconcile_tolerance, now_ns()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "position query failed, keeping local position");
                false
            }
        };

        if cadence || forced || diverged {
            let reason = if diverged { "divergence" } else if forced { "forced" } else { "cadence" };
            RESYNCS.with_label_values(&[reason]).inc();
            match self.olm.resync_orders().await {
                Ok(()) => debug!(reason, "orders re-synced"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "order re-sync failed, retry next tick");
                    self.olm.request_resync();
                }
            }
        }
        Ok(diverged)
    }

    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> Result<TickOutcome, EngineError> {
        self.ticks += 1;
        self.olm.start_tick();
        self.drain_exec();

        let resynced = self.reconcile().await?;
        if stop_requested(shutdown) {
            return Ok(TickOutcome::Skipped);
        }

        let read = self.cache.snapshot(&self.symbol.name);
        let fresh = read.fresh().cloned();
        if let Some(s) = &fresh {
            self.tracker.mark(s.mid);
            info!(
                tick = self.ticks,
                bid = %s.best_bid,
                ask = %s.best_ask,
                mid = %s.mid,
                spread_pct = %s.spread_pct().round_dp(4),
                "market"
            );
            self.events.record(Event::Md {
                ts_ns: s.ts_ns,
                symbol: s.symbol.clone(),
                bid: s.best_bid,
                ask: s.best_ask,
                mid: s.mid,
            });
        }

        // risk first, whatever the mode
        let decision = self.risk.evaluate(self.tracker.net());
        let mut derisked = Decimal::ZERO;
        if let Some((side, size)) = decision.derisk {
            let top = match top_of_book(&read) {
                Some(t) => Some(t),
                None => timed("order_book", self.cfg.call_timeout, self.gw.order_book(&self.symbol.name))
                    .await
                    .ok(),
            };
            match top {
                Some((bid, ask)) => {
                    let px = taker_price(side, bid, ask, self.cfg.taker_slippage_bps, &self.symbol);
                    warn!(
                        side = side.as_str(),
                        size = %size,
                        px = %px,
                        net = %self.tracker.net(),
                        excess = %decision.excess,
                        "de-risking"
                    );
                    if let Some(action) = decision.action() {
                        self.events.record(Event::Risk { ts_ns: now_ns(), action });
                    }
                    self.olm.execute_ioc(OrderIntent::ioc(side, px, size, IntentKind::DeRisk), shutdown).await?;
                    derisked = size;
                }
                None => warn!(side = side.as_str(), "de-risk needed but no price available"),
            }
        }
        if stop_requested(shutdown) {
            return Ok(TickOutcome::Skipped);
        }

        let Some(snap) = fresh else {
            warn!(symbol = %self.symbol.name, "market data stale, not quoting");
            self.publish();
            return Ok(TickOutcome::Stale);
        };
        if resynced {
            self.publish();
            return Ok(TickOutcome::Resync);
        }

        let outcome = match self.cfg.mode {
            Mode::Maker => {
                let net = self.tracker.net();
                let levels = match compute_levels(snap.mid, net, self.cfg.max_orders, &self.quote, &self.symbol) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, mid = %snap.mid, %net, "degenerate quote, tick skipped");
                        self.publish();
                        return Ok(TickOutcome::Skipped);
                    }
                };
                let mut intents = Vec::with_capacity(levels.len() * 2);
                for l in &levels {
                    if decision.suppress != Some(Side::Buy) {
                        intents.push(OrderIntent::maker(Side::Buy, l.bid, self.cfg.quantity, l.layer));
                    }
                    if decision.suppress != Some(Side::Sell) {
                        intents.push(OrderIntent::maker(Side::Sell, l.ask, self.cfg.quantity, l.layer));
                    }
                }
                if let Some(first) = levels.first() {
                    info!(
                        layers = levels.len(),
                        bid0 = %first.bid,
                        ask0 = %first.ask,
                        suppressed = ?decision.suppress,
                        "quotes"
                    );
                }
                self.events.record(Event::Quotes { ts_ns: now_ns(), levels });
                self.olm.sync_tick(&intents, shutdown).await?;
                TickOutcome::Quoted
            }
            Mode::Taker => {
                // leftovers from earlier ticks go first
                self.olm.sync_tick(&[], shutdown).await?;
                let deviation = self.tracker.net() - self.cfg.target_position;
                let sides: Vec<(Side, Decimal)> = if deviation.abs() > self.cfg.position_threshold {
                    let reducing = if deviation > Decimal::ZERO { Side::Sell } else { Side::Buy };
                    let left = (deviation.abs() - derisked).min(self.cfg.quantity);
                    vec![(reducing, left)]
                } else {
                    vec![(Side::Buy, self.cfg.quantity), (Side::Sell, self.cfg.quantity)]
                };
                for (side, qty) in sides {
                    if stop_requested(shutdown) {
                        break;
                    }
                    if decision.suppress == Some(side) || qty <= Decimal::ZERO {
                        continue;
                    }
                    let px = taker_price(side, snap.best_bid, snap.best_ask, self.cfg.taker_slippage_bps, &self.symbol);
                    info!(side = side.as_str(), qty = %qty, px = %px, "taker IOC");
                    self.olm.execute_ioc(OrderIntent::ioc(side, px, qty, IntentKind::Taker), shutdown).await?;
                }
                TickOutcome::Taker
            }
        };

        self.publish();
        Ok(outcome)
    }

    fn publish(&mut self) {
        self.tracker.publish();
        self.events.record(Event::Position { ts_ns: now_ns(), state: self.tracker.state().clone() });
        let s = self.tracker.state();
        info!(
            net = %s.net,
            target = %s.target,
            realized = %s.realized_pnl.round_dp(8),
            unrealized = %s.unrealized_pnl.round_dp(8),
            "position"
        );
    }
}
