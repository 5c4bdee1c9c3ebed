// ===============================
// src/posttrade.rs
// ===============================
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{ExecReport, ExecStatus, Fill, Side};

/// Per-exec-report log line.
pub fn log_exec(er: &ExecReport) {
    match &er.status {
        ExecStatus::Ack => debug!(cl_id = %er.cl_id, symbol = %er.symbol, "ACK"),
        ExecStatus::PartialFill => info!(cl_id = %er.cl_id, cum = %er.cum_filled, px = %er.last_px, maker = er.is_maker, "PARTIAL"),
        ExecStatus::Filled => info!(cl_id = %er.cl_id, cum = %er.cum_filled, px = %er.last_px, maker = er.is_maker, "FILLED"),
        ExecStatus::Cancelled => debug!(cl_id = %er.cl_id, cum = %er.cum_filled, "CANCELLED"),
        ExecStatus::Rejected(r) => warn!(cl_id = %er.cl_id, reason = %r, "REJECT"),
    }
}

/// Running session totals, logged once at shutdown.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub maker_buy_volume: Decimal,
    pub maker_sell_volume: Decimal,
    pub taker_buy_volume: Decimal,
    pub taker_sell_volume: Decimal,
    pub quote_volume: Decimal,
    pub fees: Decimal,
    pub trades: u64,
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
}

impl SessionStats {
    pub fn on_fill(&mut self, f: &Fill) {
        let bucket = match (f.is_maker, f.side) {
            (true, Side::Buy) => &mut self.maker_buy_volume,
            (true, Side::Sell) => &mut self.maker_sell_volume,
            (false, Side::Buy) => &mut self.taker_buy_volume,
            (false, Side::Sell) => &mut self.taker_sell_volume,
        };
        *bucket += f.qty;
        self.quote_volume += f.qty * f.px;
        self.fees += f.fee;
        self.trades += 1;
    }

    pub fn base_volume(&self) -> Decimal {
        self.maker_buy_volume + self.maker_sell_volume + self.taker_buy_volume + self.taker_sell_volume
    }

    pub fn log_summary(&self, realized_pnl: Decimal) {
        info!(
            trades = self.trades,
            maker_buy = %self.maker_buy_volume,
            maker_sell = %self.maker_sell_volume,
            taker_buy = %self.taker_buy_volume,
            taker_sell = %self.taker_sell_volume,
            quote_volume = %self.quote_volume.round_dp(4),
            fees = %self.fees.round_dp(8),
            placed = self.orders_placed,
            cancelled = self.orders_cancelled,
            rejected = self.orders_rejected,
            realized_pnl = %realized_pnl.round_dp(8),
            "session summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn volumes_split_by_liquidity_and_side() {
        let mut s = SessionStats::default();
        let f = |side, maker, qty, px| Fill { cl_id: "c".into(), side, qty, px, fee: dec!(0.01), is_maker: maker, ts_ns: 0 };
        s.on_fill(&f(Side::Buy, true, dec!(0.1), dec!(100)));
        s.on_fill(&f(Side::Sell, false, dec!(0.2), dec!(101)));
        assert_eq!(s.maker_buy_volume, dec!(0.1));
        assert_eq!(s.taker_sell_volume, dec!(0.2));
        assert_eq!(s.quote_volume, dec!(30.2));
        assert_eq!(s.fees, dec!(0.02));
        assert_eq!(s.trades, 2);
        assert_eq!(s.base_volume(), dec!(0.3));
    }
}
