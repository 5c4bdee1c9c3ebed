// ===============================
// src/risk.rs
// ===============================
use rust_decimal::Decimal;

use crate::config::StrategyConfig;
use crate::domain::{RiskAction, Side};
use crate::metrics::DERISK_ACTIONS;

/// Position policy. `target` is signed, the rest are magnitudes.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub target: Decimal,
    pub threshold: Decimal,
    pub max_position: Decimal,
    pub max_derisk_size: Decimal,
    pub lot_size: Decimal,
}

impl RiskLimits {
    pub fn from_config(cfg: &StrategyConfig, lot_size: Decimal) -> Self {
        Self {
            target: cfg.target_position,
            threshold: cfg.position_threshold,
            max_position: cfg.max_position,
            max_derisk_size: cfg.max_derisk_size,
            lot_size,
        }
    }
}

/// Output of one evaluation. Both parts are independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskDecision {
    /// Taker order that moves the position back toward target.
    pub derisk: Option<(Side, Decimal)>,
    pub excess: Decimal,
    /// Maker side that must not be quoted this tick.
    pub suppress: Option<Side>,
}

impl RiskDecision {
    pub fn action(&self) -> Option<RiskAction> {
        self.derisk.map(|(side, size)| RiskAction { side, size, excess: self.excess, suppress: self.suppress })
    }
}

pub struct RiskController {
    limits: RiskLimits,
}

impl RiskController {
    pub fn new(limits: RiskLimits) -> Self { Self { limits } }

    /// Runs before quoting every tick.
    ///
    /// excess = |net - target| - threshold. Above max position only the part
    /// beyond max is cut in one go; the threshold rule picks up the rest on
    /// later ticks.
    pub fn evaluate(&self, net: Decimal) -> RiskDecision {
        let l = &self.limits;
        let deviation = net - l.target;
        let excess = deviation.abs() - l.threshold;

        let suppress = if net.abs() >= l.max_position && !net.is_zero() {
            // a long book stops bidding, a short book stops offering
            Some(if net > Decimal::ZERO { Side::Buy } else { Side::Sell })
        } else {
            None
        };

        let mut derisk = None;
        if excess > Decimal::ZERO || net.abs() > l.max_position {
            let wanted = if net.abs() > l.max_position {
                net.abs() - l.max_position
            } else {
                excess
            };
            let size = crate::domain::floor_to_step(
                wanted.min(deviation.abs()).min(l.max_derisk_size),
                l.lot_size,
            );
            if size > Decimal::ZERO && !deviation.is_zero() {
                let side = if deviation > Decimal::ZERO { Side::Sell } else { Side::Buy };
                DERISK_ACTIONS.with_label_values(&[side.as_str()]).inc();
                derisk = Some((side, size));
            }
        }

        RiskDecision { derisk, excess, suppress }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn controller(target: Decimal) -> RiskController {
        RiskController::new(RiskLimits {
            target,
            threshold: dec!(0.2),
            max_position: dec!(0.4),
            max_derisk_size: dec!(1),
            lot_size: dec!(0.001),
        })
    }

    #[test]
    fn above_threshold_sells_the_excess() {
        let d = controller(Decimal::ZERO).evaluate(dec!(0.25));
        assert_eq!(d.derisk, Some((Side::Sell, dec!(0.05))));
        assert_eq!(d.suppress, None);
    }

    #[test]
    fn beyond_max_cuts_overflow_and_suppresses_same_side() {
        let d = controller(Decimal::ZERO).evaluate(dec!(0.5));
        assert_eq!(d.derisk, Some((Side::Sell, dec!(0.1))));
        assert_eq!(d.suppress, Some(Side::Buy));

        let d = controller(Decimal::ZERO).evaluate(dec!(-0.5));
        assert_eq!(d.derisk, Some((Side::Buy, dec!(0.1))));
        assert_eq!(d.suppress, Some(Side::Sell));
    }

    #[test]
    fn exactly_at_max_suppresses_and_reduces_by_threshold_rule() {
        let d = controller(Decimal::ZERO).evaluate(dec!(0.4));
        assert_eq!(d.suppress, Some(Side::Buy));
        assert_eq!(d.derisk, Some((Side::Sell, dec!(0.2))));
    }

    #[test]
    fn inside_band_does_nothing() {
        let d = controller(Decimal::ZERO).evaluate(dec!(0.15));
        assert_eq!(d.derisk, None);
        assert_eq!(d.suppress, None);
        assert!(d.action().is_none());
    }

    #[test]
    fn deviation_is_measured_from_target() {
        // target short 0.3: flat is 0.3 too long, sell the 0.1 excess
        let d = controller(dec!(-0.3)).evaluate(Decimal::ZERO);
        assert_eq!(d.derisk, Some((Side::Sell, dec!(0.1))));

        // target long 0.3: flat is 0.3 too short, buy 0.1
        let d = controller(dec!(0.3)).evaluate(Decimal::ZERO);
        assert_eq!(d.derisk, Some((Side::Buy, dec!(0.1))));
    }

    #[test]
    fn single_order_is_capped() {
        let c = RiskController::new(RiskLimits {
            target: Decimal::ZERO,
            threshold: dec!(0.2),
            max_position: dec!(0.4),
            max_derisk_size: dec!(0.03),
            lot_size: dec!(0.001),
        });
        assert_eq!(c.evaluate(dec!(0.25)).derisk, Some((Side::Sell, dec!(0.03))));
    }

    #[test]
    fn sub_lot_excess_is_skipped() {
        let d = controller(Decimal::ZERO).evaluate(dec!(0.2004));
        assert_eq!(d.derisk, None);
    }
}
