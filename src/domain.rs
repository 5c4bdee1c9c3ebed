// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> Decimal { match self { Side::Buy => Decimal::ONE, Side::Sell => Decimal::NEGATIVE_ONE } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType { Spot, Perpetual }
impl MarketType {
    pub fn as_str(&self) -> &'static str { match self { MarketType::Spot => "spot", MarketType::Perpetual => "perp" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce { Gtc, Ioc }
impl TimeInForce {
    pub fn as_str(&self) -> &'static str { match self { TimeInForce::Gtc => "GTC", TimeInForce::Ioc => "IOC" } }
}

/// Resolved once at startup, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub market: MarketType,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
}

impl Symbol {
    pub fn floor_price(&self, px: Decimal) -> Decimal { floor_to_step(px, self.tick_size) }
    pub fn ceil_price(&self, px: Decimal) -> Decimal { ceil_to_step(px, self.tick_size) }
    pub fn floor_size(&self, qty: Decimal) -> Decimal { floor_to_step(qty, self.lot_size) }
}

pub fn floor_to_step(v: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO { return v; }
    ((v / step).floor() * step).normalize()
}

pub fn ceil_to_step(v: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO { return v; }
    ((v / step).ceil() * step).normalize()
}

/// Latest top of book for one symbol. Spread values are derived on read.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid: Decimal,
    pub updated_at: Instant,
    pub ts_ns: i128,
}

impl MarketSnapshot {
    pub fn spread(&self) -> Decimal { self.best_ask - self.best_bid }
    pub fn spread_pct(&self) -> Decimal {
        if self.mid.is_zero() { Decimal::ZERO } else { self.spread() / self.mid * Decimal::ONE_HUNDRED }
    }
}

/// Why an intent exists. Maker layers are diffed tick to tick; the others are fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    Maker { layer: usize },
    DeRisk,
    Taker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: TimeInForce,
    pub kind: IntentKind,
}

impl OrderIntent {
    pub fn maker(side: Side, price: Decimal, size: Decimal, layer: usize) -> Self {
        Self { side, price, size, tif: TimeInForce::Gtc, kind: IntentKind::Maker { layer } }
    }
    pub fn ioc(side: Side, price: Decimal, size: Decimal, kind: IntentKind) -> Self {
        Self { side, price, size, tif: TimeInForce::Ioc, kind }
    }
    pub fn layer(&self) -> Option<usize> {
        match self.kind { IntentKind::Maker { layer } => Some(layer), _ => None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState { Pending, Open, PartiallyFilled, Filled, Cancelled, Rejected }

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Rejected)
    }

    /// Counts against the per-side slot budget.
    pub fn is_live(&self) -> bool {
        matches!(self, OrderState::Pending | OrderState::Open | OrderState::PartiallyFilled)
    }

    /// Forward-only transitions; a terminal state never moves.
    pub fn can_transition(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Pending, Open) | (Pending, Rejected) => true,
            (Open, PartiallyFilled) | (Open, Filled) | (Open, Cancelled) => true,
            (PartiallyFilled, PartiallyFilled) | (PartiallyFilled, Filled) | (PartiallyFilled, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub cl_id: String,
    pub exchange_id: Option<String>,
    pub intent: OrderIntent,
    pub state: OrderState,
    pub filled: Decimal,
    pub placed_at: Instant,
    /// Placement or cancel timed out; outcome known only after a re-sync.
    pub unknown_outcome: bool,
}

// Exchange -> engine execution reports (stream side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReport {
    pub cl_id: String,
    pub symbol: String,
    pub status: ExecStatus,
    /// Cumulative filled size of the order, never a delta.
    pub cum_filled: Decimal,
    pub last_px: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
    pub ts_ns: i128,
}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecStatus { Ack, PartialFill, Filled, Cancelled, Rejected(String) }

impl ExecStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ExecStatus::Ack => "ack",
            ExecStatus::PartialFill => "partial",
            ExecStatus::Filled => "filled",
            ExecStatus::Cancelled => "cancelled",
            ExecStatus::Rejected(_) => "rejected",
        }
    }
}

/// A confirmed fill as handed to the position tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub cl_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub px: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
    /// Stamp of the report that carried it.
    pub ts_ns: i128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub net: Decimal,
    pub avg_entry: Decimal,
    pub target: Decimal,
    pub max_position: Decimal,
    pub threshold: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub last_mid: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteLevel { pub layer: usize, pub bid: Decimal, pub ask: Decimal }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAction {
    pub side: Side,
    pub size: Decimal,
    pub excess: Decimal,
    pub suppress: Option<Side>,
}

// Recorder events (JSONL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Md { ts_ns: i128, symbol: String, bid: Decimal, ask: Decimal, mid: Decimal },
    Quotes { ts_ns: i128, levels: Vec<QuoteLevel> },
    Placed { ts_ns: i128, cl_id: String, intent: OrderIntent },
    Cancelled { ts_ns: i128, cl_id: String },
    Exec(ExecReport),
    Risk { ts_ns: i128, action: RiskAction },
    Position { ts_ns: i128, state: PositionState },
    Note(String),
}

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn step_rounding() {
        assert_eq!(floor_to_step(dec!(239.3840592), dec!(0.001)), dec!(239.384));
        assert_eq!(ceil_to_step(dec!(239.4319408), dec!(0.001)), dec!(239.432));
        assert_eq!(floor_to_step(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn order_state_moves_forward_only() {
        use OrderState::*;
        assert!(Pending.can_transition(Open));
        assert!(Pending.can_transition(Rejected));
        assert!(Open.can_transition(PartiallyFilled));
        assert!(PartiallyFilled.can_transition(PartiallyFilled));
        assert!(PartiallyFilled.can_transition(Cancelled));
        assert!(!Pending.can_transition(Filled));
        assert!(!Open.can_transition(Pending));
        assert!(!Open.can_transition(Rejected));
        for terminal in [Filled, Cancelled, Rejected] {
            for next in [Pending, Open, PartiallyFilled, Filled, Cancelled, Rejected] {
                assert!(!terminal.can_transition(next));
            }
        }
    }
}
