// ===============================
// src/quote.rs
// ===============================
//
// Quote engine: pure price math, no I/O.
//
//   half_0   = mid * spread% / 2
//   half_k   = half_0 * (1 + k * layer_step)
//   offset   = mid * skew * clamp(net / max_position, -1, 1)
//   bid_k    = floor_tick(mid - offset - half_k)
//   ask_k    = ceil_tick (mid - offset + half_k)
//
// Long inventory (net > 0) pushes both sides down so our asks get lifted
// first; short inventory pushes them up.
//
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{QuoteLevel, Side, Symbol};
use crate::feed::BookRead;

#[derive(Debug, Clone)]
pub struct QuoteParams {
    pub spread_pct: Decimal,
    pub inventory_skew: Decimal,
    pub max_position: Decimal,
    pub layer_step: Decimal,
}

#[derive(Debug, Error, PartialEq)]
pub enum QuoteError {
    #[error("mid price must be positive, got {0}")]
    BadMid(Decimal),
    #[error("degenerate quote on layer {layer}: bid {bid} >= ask {ask} or non-positive")]
    Degenerate { layer: usize, bid: Decimal, ask: Decimal },
}

pub fn skew_offset(mid: Decimal, net: Decimal, p: &QuoteParams) -> Decimal {
    if p.inventory_skew.is_zero() || p.max_position <= Decimal::ZERO || net.is_zero() {
        return Decimal::ZERO;
    }
    let ratio = (net / p.max_position).clamp(Decimal::NEGATIVE_ONE, Decimal::ONE);
    mid * p.inventory_skew * ratio
}

pub fn half_spread(mid: Decimal, p: &QuoteParams, layer: usize) -> Decimal {
    let base = mid * p.spread_pct / Decimal::ONE_HUNDRED / Decimal::TWO;
    base * (Decimal::ONE + Decimal::from(layer) * p.layer_step)
}

/// One bid/ask pair for `layer`, rounded away from the mid.
pub fn quote_layer(
    mid: Decimal,
    net: Decimal,
    layer: usize,
    p: &QuoteParams,
    sym: &Symbol,
) -> Result<QuoteLevel, QuoteError> {
    if mid <= Decimal::ZERO {
        return Err(QuoteError::BadMid(mid));
    }
    let center = mid - skew_offset(mid, net, p);
    let half = half_spread(mid, p, layer);
    let bid = sym.floor_price(center - half);
    let ask = sym.ceil_price(center + half);
    if bid <= Decimal::ZERO || bid >= ask {
        return Err(QuoteError::Degenerate { layer, bid, ask });
    }
    Ok(QuoteLevel { layer, bid, ask })
}

/// All layers, bids strictly descending and asks strictly ascending.
pub fn compute_levels(
    mid: Decimal,
    net: Decimal,
    layers: usize,
    p: &QuoteParams,
    sym: &Symbol,
) -> Result<Vec<QuoteLevel>, QuoteError> {
    let mut out: Vec<QuoteLevel> = Vec::with_capacity(layers);
    for k in 0..layers {
        let mut lvl = quote_layer(mid, net, k, p, sym)?;
        // coarse ticks can collapse neighbouring layers onto one price
        if let Some(prev) = out.last() {
            if lvl.bid >= prev.bid {
                lvl.bid = prev.bid - sym.tick_size;
            }
            if lvl.ask <= prev.ask {
                lvl.ask = prev.ask + sym.tick_size;
            }
            if lvl.bid <= Decimal::ZERO {
                return Err(QuoteError::Degenerate { layer: k, bid: lvl.bid, ask: lvl.ask });
            }
        }
        out.push(lvl);
    }
    Ok(out)
}

/// Aggressive IOC prices through the top of book.
pub fn taker_price(side: Side, best_bid: Decimal, best_ask: Decimal, slippage_bps: Decimal, sym: &Symbol) -> Decimal {
    let s = slippage_bps / Decimal::from(10_000);
    match side {
        Side::Buy => sym.ceil_price(best_ask * (Decimal::ONE + s)),
        Side::Sell => sym.floor_price(best_bid * (Decimal::ONE - s)),
    }
}

/// Best bid/ask to price a taker order with, fresh or last known.
pub fn top_of_book(read: &BookRead) -> Option<(Decimal, Decimal)> {
    read.last_known().map(|s| (s.best_bid, s.best_ask))
}
