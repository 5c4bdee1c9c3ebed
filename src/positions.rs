// ===============================
// src/positions.rs (PnL & inventory tracker)
// ===============================
//
// Weighted-average-cost accounting for one symbol:
// - same-direction fill   -> blend the average entry
// - opposite-direction    -> realize (px - avg) on the closed part
// - flatten / flip        -> basis resets (to 0, or to the flip price)
// Fees are always subtracted from realized PnL.
//
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{Fill, PositionState};
use crate::gateway::PositionInfo;
use crate::metrics::{set_decimal, FEES_PAID, PNL_REALIZED, PNL_UNREALIZED, POSITION_NET, POSITION_OVERWRITES};

/// Net and average entry after `fill`, plus the gross PnL it realized.
fn apply(net: Decimal, avg: Decimal, fill: &Fill) -> (Decimal, Decimal, Decimal) {
    let signed = fill.side.sign() * fill.qty;
    let next = net + signed;
    if net.is_zero() || net.is_sign_positive() == signed.is_sign_positive() {
        return (next, (avg * net.abs() + fill.px * fill.qty) / next.abs(), Decimal::ZERO);
    }
    let closed = fill.qty.min(net.abs());
    let dir = if net > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
    let realized = closed * (fill.px - avg) * dir;
    let next_avg = if next.is_zero() {
        Decimal::ZERO
    } else if next.is_sign_positive() != net.is_sign_positive() {
        // remainder opens the other way at the fill price
        fill.px
    } else {
        avg
    };
    (next, next_avg, realized)
}

/// Local book as it stood when the exchange value was adopted. Fills stamped
/// before that point are already inside the adopted net; they only move this
/// shadow so their PnL is still realized once.
#[derive(Debug, Clone)]
struct Adopted {
    as_of_ns: i128,
    net: Decimal,
    avg_entry: Decimal,
}

pub struct PositionTracker {
    state: PositionState,
    adopted: Option<Adopted>,
    snap_tx: watch::Sender<PositionState>,
}

impl PositionTracker {
    pub fn new(
        symbol: &str,
        target: Decimal,
        max_position: Decimal,
        threshold: Decimal,
    ) -> (Self, watch::Receiver<PositionState>) {
        let state = PositionState {
            symbol: symbol.to_string(),
            target,
            max_position,
            threshold,
            ..Default::default()
        };
        let (snap_tx, snap_rx) = watch::channel(state.clone());
        (Self { state, adopted: None, snap_tx }, snap_rx)
    }

    pub fn state(&self) -> &PositionState { &self.state }

    pub fn net(&self) -> Decimal { self.state.net }

    /// Applies one confirmed fill delta; returns the PnL it realized (after fee).
    pub fn on_fill(&mut self, fill: &Fill) -> Decimal {
        let gross = match self.adopted.as_mut() {
            Some(a) if fill.ts_ns <= a.as_of_ns => {
                let (net, avg, gross) = apply(a.net, a.avg_entry, fill);
                a.net = net;
                a.avg_entry = avg;
                debug!(cl_id = %fill.cl_id, qty = %fill.qty, "fill predates adopted position, pnl only");
                gross
            }
            _ => {
                let (net, avg, gross) = apply(self.state.net, self.state.avg_entry, fill);
                self.state.net = net;
                self.state.avg_entry = avg;
                gross
            }
        };

        let realized = gross - fill.fee;
        self.state.realized_pnl += realized;
        self.state.fees += fill.fee;
        self.refresh_unrealized();
        realized
    }

    /// Authoritative position wins when it is more than `tolerance` away.
    /// `as_of_ns` is taken once the query has returned: every report stamped
    /// at or before it is counted in `auth`. Returns true on overwrite.
    pub fn reconcile(&mut self, auth: &PositionInfo, tolerance: Decimal, as_of_ns: i128) -> bool {
        let drift = (self.state.net - auth.net).abs();
        if drift <= tolerance {
            return false;
        }
        warn!(
            symbol = %self.state.symbol,
            local = %self.state.net,
            exchange = %auth.net,
            %drift,
            "position divergence, adopting exchange value"
        );
        self.adopted = Some(Adopted { as_of_ns, net: self.state.net, avg_entry: self.state.avg_entry });
        self.state.net = auth.net;
        self.state.avg_entry = if auth.net.is_zero() { Decimal::ZERO } else { auth.entry_price };
        self.refresh_unrealized();
        POSITION_OVERWRITES.inc();
        true
    }

    pub fn mark(&mut self, mid: Decimal) {
        self.state.last_mid = mid;
        self.refresh_unrealized();
    }

    fn refresh_unrealized(&mut self) {
        let s = &mut self.state;
        s.unrealized_pnl = if s.net.is_zero() || s.last_mid.is_zero() {
            Decimal::ZERO
        } else {
            s.net * (s.last_mid - s.avg_entry)
        };
    }

    /// Pushes the current state to observers and metrics.
    pub fn publish(&self) {
        let s = &self.state;
        set_decimal(&POSITION_NET, s.net);
        set_decimal(&PNL_REALIZED, s.realized_pnl);
        set_decimal(&PNL_UNREALIZED, s.unrealized_pnl);
        set_decimal(&FEES_PAID, s.fees);
        self.snap_tx.send_replace(s.clone());
    }

    pub fn log_summary(&self) {
        let s = &self.state;
        info!(
            symbol = %s.symbol,
            net = %s.net,
            avg_entry = %s.avg_entry.round_dp(8),
            realized = %s.realized_pnl.round_dp(8),
            unrealized = %s.unrealized_pnl.round_dp(8),
            fees = %s.fees.round_dp(8),
            "position"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use rust_decimal_macros::dec;

    fn fill(side: Side, qty: Decimal, px: Decimal, fee: Decimal) -> Fill {
        Fill { cl_id: "x".into(), side, qty, px, fee, is_maker: true, ts_ns: 100 }
    }

    fn tracker() -> PositionTracker {
        PositionTracker::new("SOLUSDT", Decimal::ZERO, dec!(1), dec!(0.2)).0
    }

    #[test]
    fn average_cost_blends_then_realizes() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Buy, dec!(1), dec!(100), Decimal::ZERO));
        t.on_fill(&fill(Side::Buy, dec!(1), dec!(110), Decimal::ZERO));
        assert_eq!(t.state().avg_entry, dec!(105));

        let r = t.on_fill(&fill(Side::Sell, dec!(0.5), dec!(115), dec!(0.1)));
        // 0.5 * (115 - 105) - 0.1
        assert_eq!(r, dec!(4.9));
        assert_eq!(t.net(), dec!(1.5));
        assert_eq!(t.state().avg_entry, dec!(105));
        assert_eq!(t.state().fees, dec!(0.1));
    }

    #[test]
    fn flip_resets_basis_to_fill_price() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Sell, dec!(1), dec!(100), Decimal::ZERO));
        let r = t.on_fill(&fill(Side::Buy, dec!(3), dec!(90), Decimal::ZERO));
        assert_eq!(r, dec!(10));
        assert_eq!(t.net(), dec!(2));
        assert_eq!(t.state().avg_entry, dec!(90));

        t.on_fill(&fill(Side::Sell, dec!(2), dec!(91), Decimal::ZERO));
        assert!(t.net().is_zero());
        assert!(t.state().avg_entry.is_zero());
        assert_eq!(t.state().realized_pnl, dec!(12));
    }

    #[test]
    fn unrealized_marks_to_mid() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Buy, dec!(2), dec!(100), Decimal::ZERO));
        t.mark(dec!(101.5));
        assert_eq!(t.state().unrealized_pnl, dec!(3));
    }

    #[test]
    fn reconcile_overwrites_only_beyond_tolerance() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Buy, dec!(0.1), dec!(100), Decimal::ZERO));
        let close = PositionInfo { net: dec!(0.1005), entry_price: dec!(100) };
        assert!(!t.reconcile(&close, dec!(0.001), 200));
        assert_eq!(t.net(), dec!(0.1));

        let far = PositionInfo { net: dec!(0.3), entry_price: dec!(99) };
        assert!(t.reconcile(&far, dec!(0.001), 200));
        assert_eq!(t.net(), dec!(0.3));
        assert_eq!(t.state().avg_entry, dec!(99));
    }

    #[test]
    fn queued_fill_inside_adopted_position_only_realizes() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Buy, dec!(0.1), dec!(100), Decimal::ZERO));
        // exchange already saw the closing sell that is still queued locally
        assert!(t.reconcile(&PositionInfo::default(), dec!(0.001), 200));
        assert!(t.net().is_zero());

        let late = Fill { ts_ns: 150, ..fill(Side::Sell, dec!(0.1), dec!(101), Decimal::ZERO) };
        let r = t.on_fill(&late);
        assert_eq!(r, dec!(0.1));
        assert!(t.net().is_zero());
        assert!(t.state().avg_entry.is_zero());
        assert_eq!(t.state().realized_pnl, dec!(0.1));

        // anything after the adopted point moves the position again
        let next = Fill { ts_ns: 300, ..fill(Side::Buy, dec!(0.2), dec!(102), Decimal::ZERO) };
        t.on_fill(&next);
        assert_eq!(t.net(), dec!(0.2));
        assert_eq!(t.state().avg_entry, dec!(102));
    }

    #[test]
    fn short_cover_realizes_with_negative_direction() {
        let mut t = tracker();
        t.on_fill(&fill(Side::Sell, dec!(0.5), dec!(100), Decimal::ZERO));
        let r = t.on_fill(&fill(Side::Buy, dec!(0.2), dec!(98), dec!(0.01)));
        // 0.2 * (98 - 100) * -1 - 0.01
        assert_eq!(r, dec!(0.39));
        assert_eq!(t.net(), dec!(-0.3));
        assert_eq!(t.state().avg_entry, dec!(100));
    }

    #[tokio::test]
    async fn publish_reaches_watchers() {
        let (mut t, mut rx) = PositionTracker::new("SOLUSDT", Decimal::ZERO, dec!(1), dec!(0.2));
        t.on_fill(&fill(Side::Buy, dec!(0.4), dec!(50), Decimal::ZERO));
        t.publish();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().net, dec!(0.4));
    }
}
