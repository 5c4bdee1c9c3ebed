// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : mm_bot_rust — async market-making engine in Rust
Module  : <module_name>.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Quotes layered two-sided limit orders (or IOC pairs) around the mid,
          tracks every order through its lifecycle, keeps inventory inside
          risk bounds with de-risk trades, runs against a paper exchange or
          Binance spot/perp, exposes Prometheus metrics, and records JSONL
          events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;
#[cfg(test)]
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::domain::MarketType;

/// Venue selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExchangeKind {
    Paper,
    Binance,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Paper => "paper",
            ExchangeKind::Binance => "binance",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MarketArg {
    Spot,
    Perp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Maker,
    Taker,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Maker => "maker",
            Mode::Taker => "taker",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("{0} must not be negative")]
    Negative(&'static str),
    #[error("|target position| {target} must stay below max position {max}")]
    TargetBeyondMax { target: Decimal, max: Decimal },
    #[error("invalid decimal for {field}: {value}")]
    BadDecimal { field: &'static str, value: f64 },
}

/// Command line; every flag can also come from the environment (.env is read first).
#[derive(Parser, Debug, Clone)]
#[command(name = "mm_bot_rust", about = "Layered market maker for spot and perpetual markets")]
pub struct Cli {
    #[arg(long, env = "EXCHANGE", value_enum, default_value = "paper")]
    pub exchange: ExchangeKind,
    #[arg(long = "market-type", env = "MARKET_TYPE", value_enum, default_value = "perp")]
    pub market_type: MarketArg,
    #[arg(long, env = "SYMBOL", default_value = "SOLUSDT")]
    pub symbol: String,
    /// Quoted spread in percent of mid (0.02 = 0.02%)
    #[arg(long, env = "SPREAD", default_value_t = 0.2)]
    pub spread: f64,
    #[arg(long, env = "QUANTITY", default_value_t = 0.1)]
    pub quantity: f64,
    #[arg(long = "max-orders", env = "MAX_ORDERS", default_value_t = 3)]
    pub max_orders: usize,
    /// Seconds between strategy ticks
    #[arg(long, env = "INTERVAL", default_value_t = 60.0)]
    pub interval: f64,
    /// Total run time in seconds
    #[arg(long, env = "DURATION", default_value_t = 3600.0)]
    pub duration: f64,
    #[arg(long = "target-position", env = "TARGET_POSITION", default_value_t = 0.0, allow_hyphen_values = true)]
    pub target_position: f64,
    #[arg(long = "max-position", env = "MAX_POSITION", default_value_t = 1.0)]
    pub max_position: f64,
    #[arg(long = "position-threshold", env = "POSITION_THRESHOLD", default_value_t = 0.1)]
    pub position_threshold: f64,
    /// 0..1, fraction of mid shifted per unit of (net / max position)
    #[arg(long = "inventory-skew", env = "INVENTORY_SKEW", default_value_t = 0.0)]
    pub inventory_skew: f64,
    #[arg(long, env = "MODE", value_enum, default_value = "maker")]
    pub mode: Mode,

    // ---- tuning ----
    /// Extra half-spread per layer, as a multiple of the base half-spread (default 1/(max_orders-1))
    #[arg(long = "layer-step", env = "LAYER_STEP")]
    pub layer_step: Option<f64>,
    /// Resting orders within this distance (bps of target) are kept instead of replaced
    #[arg(long = "reprice-tolerance-bps", env = "REPRICE_TOLERANCE_BPS", default_value_t = 2.0)]
    pub reprice_tolerance_bps: f64,
    /// Seconds after which a resting order is always replaced (default 5 × interval)
    #[arg(long = "max-order-age", env = "MAX_ORDER_AGE")]
    pub max_order_age: Option<f64>,
    /// Seconds without a book update before market data counts as stale (default 2 × interval)
    #[arg(long = "stale-after", env = "STALE_AFTER")]
    pub stale_after: Option<f64>,
    #[arg(long = "call-timeout-ms", env = "CALL_TIMEOUT_MS")]
    pub call_timeout_ms: Option<u64>,
    #[arg(long = "reconcile-every", env = "RECONCILE_EVERY", default_value_t = 5)]
    pub reconcile_every: u64,
    #[arg(long = "reconcile-tolerance", env = "RECONCILE_TOLERANCE")]
    pub reconcile_tolerance: Option<f64>,
    /// Cap for a single de-risking order (default: max position)
    #[arg(long = "max-derisk-size", env = "MAX_DERISK_SIZE")]
    pub max_derisk_size: Option<f64>,
    /// Taker slippage in bps (default: spread% × 100)
    #[arg(long = "taker-slippage-bps", env = "TAKER_SLIPPAGE_BPS")]
    pub taker_slippage_bps: Option<f64>,

    // ---- process shell ----
    #[arg(long = "record-file", env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long = "metrics-port", env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
    /// Use exchange test endpoints
    #[arg(long, env = "TESTNET", default_value_t = false)]
    pub testnet: bool,
}

/// Immutable for the whole run.
#[derive(Clone, Debug)]
pub struct StrategyConfig {
    pub symbol: String,
    pub market: MarketType,
    pub spread_pct: Decimal,
    pub quantity: Decimal,
    pub max_orders: usize,
    pub interval: Duration,
    pub duration: Duration,
    pub target_position: Decimal,
    pub max_position: Decimal,
    pub position_threshold: Decimal,
    pub inventory_skew: Decimal,
    pub mode: Mode,

    pub layer_step: Decimal,
    pub reprice_tolerance_bps: Decimal,
    pub max_order_age: Duration,
    pub stale_after: Duration,
    pub call_timeout: Duration,
    pub reconcile_every: u64,
    pub reconcile_tolerance: Decimal,
    pub max_derisk_size: Decimal,
    pub taker_slippage_bps: Decimal,
}

#[derive(Clone, Debug)]
pub struct RunArgs {
    pub exchange: ExchangeKind,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub testnet: bool,
}

fn dec_of(field: &'static str, v: f64) -> Result<Decimal, ConfigError> {
    Decimal::try_from(v).map_err(|_| ConfigError::BadDecimal { field, value: v })
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

impl StrategyConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let spread_pct = dec_of("spread", cli.spread)?;
        let quantity = dec_of("quantity", cli.quantity)?;
        let max_position = dec_of("max-position", cli.max_position)?;
        let position_threshold = dec_of("position-threshold", cli.position_threshold)?;
        let target_position = dec_of("target-position", cli.target_position)?;

        if spread_pct <= Decimal::ZERO { return Err(ConfigError::NotPositive("spread")); }
        if quantity <= Decimal::ZERO { return Err(ConfigError::NotPositive("quantity")); }
        if cli.max_orders == 0 { return Err(ConfigError::NotPositive("max-orders")); }
        if cli.interval <= 0.0 { return Err(ConfigError::NotPositive("interval")); }
        if cli.duration <= 0.0 { return Err(ConfigError::NotPositive("duration")); }
        if max_position <= Decimal::ZERO { return Err(ConfigError::NotPositive("max-position")); }
        if position_threshold < Decimal::ZERO { return Err(ConfigError::Negative("position-threshold")); }
        if target_position.abs() >= max_position {
            return Err(ConfigError::TargetBeyondMax { target: target_position, max: max_position });
        }

        let inventory_skew = dec_of("inventory-skew", cli.inventory_skew)?.clamp(Decimal::ZERO, Decimal::ONE);
        let layer_step = match cli.layer_step {
            Some(v) => dec_of("layer-step", v)?.max(Decimal::ZERO),
            None if cli.max_orders > 1 => Decimal::ONE / Decimal::from(cli.max_orders - 1),
            None => Decimal::ONE,
        };
        let interval = secs(cli.interval);
        let stale_after = cli.stale_after.map(secs).unwrap_or(interval * 2);
        let max_order_age = cli.max_order_age.map(secs).unwrap_or(interval * 5);
        let call_timeout = cli
            .call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| (interval / 2).min(Duration::from_secs(5)));
        let reconcile_tolerance = match cli.reconcile_tolerance {
            Some(v) => dec_of("reconcile-tolerance", v)?,
            None => quantity / Decimal::from(100),
        };
        let max_derisk_size = match cli.max_derisk_size {
            Some(v) => dec_of("max-derisk-size", v)?,
            None => max_position,
        };
        if max_derisk_size <= Decimal::ZERO { return Err(ConfigError::NotPositive("max-derisk-size")); }
        let taker_slippage_bps = match cli.taker_slippage_bps {
            Some(v) => dec_of("taker-slippage-bps", v)?,
            None => spread_pct * Decimal::ONE_HUNDRED,
        };

        Ok(Self {
            symbol: cli.symbol.trim().to_ascii_uppercase(),
            market: match cli.market_type {
                MarketArg::Spot => MarketType::Spot,
                MarketArg::Perp => MarketType::Perpetual,
            },
            spread_pct,
            quantity,
            max_orders: cli.max_orders,
            interval,
            duration: secs(cli.duration),
            target_position,
            max_position,
            position_threshold,
            inventory_skew,
            mode: cli.mode,
            layer_step,
            reprice_tolerance_bps: dec_of("reprice-tolerance-bps", cli.reprice_tolerance_bps)?.max(Decimal::ZERO),
            max_order_age,
            stale_after,
            call_timeout,
            reconcile_every: cli.reconcile_every.max(1),
            reconcile_tolerance: reconcile_tolerance.max(Decimal::ZERO),
            max_derisk_size,
            taker_slippage_bps: taker_slippage_bps.max(Decimal::ZERO),
        })
    }

    /// Defaults used by unit tests: 0.2% spread, 3 layers, 1s interval.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            symbol: "SOLUSDT".into(),
            market: MarketType::Perpetual,
            spread_pct: dec!(0.2),
            quantity: dec!(0.1),
            max_orders: 3,
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(60),
            target_position: Decimal::ZERO,
            max_position: dec!(0.4),
            position_threshold: dec!(0.2),
            inventory_skew: Decimal::ZERO,
            mode: Mode::Maker,
            layer_step: dec!(0.5),
            reprice_tolerance_bps: dec!(2),
            max_order_age: Duration::from_secs(30),
            stale_after: Duration::from_secs(2),
            call_timeout: Duration::from_millis(500),
            reconcile_every: 5,
            reconcile_tolerance: dec!(0.001),
            max_derisk_size: dec!(0.4),
            taker_slippage_bps: dec!(20),
        }
    }
}

pub fn load() -> Result<(StrategyConfig, RunArgs), ConfigError> {
    // read .env before clap resolves env-backed flags
    let _ = dotenv();
    let cli = Cli::parse();
    let cfg = StrategyConfig::from_cli(&cli)?;
    let args = RunArgs {
        exchange: cli.exchange,
        record_file: cli.record_file,
        metrics_port: cli.metrics_port,
        testnet: cli.testnet,
    };
    Ok((cfg, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let mut argv = vec!["mm_bot_rust"];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv)
    }

    #[test]
    fn derived_defaults_follow_interval_and_spread() {
        let cli = parse(&["--spread", "0.03", "--interval", "10", "--max-orders", "3"]);
        let cfg = StrategyConfig::from_cli(&cli).unwrap();
        assert_eq!(cfg.stale_after, Duration::from_secs(20));
        assert_eq!(cfg.max_order_age, Duration::from_secs(50));
        assert_eq!(cfg.call_timeout, Duration::from_secs(5));
        assert_eq!(cfg.layer_step, dec!(0.5));
        assert_eq!(cfg.taker_slippage_bps, dec!(3));
    }

    #[test]
    fn skew_is_clamped_and_symbol_normalized() {
        let cli = parse(&["--inventory-skew", "3.5", "--symbol", " solusdt "]);
        let cfg = StrategyConfig::from_cli(&cli).unwrap();
        assert_eq!(cfg.inventory_skew, Decimal::ONE);
        assert_eq!(cfg.symbol, "SOLUSDT");
    }

    #[test]
    fn rejects_bad_policy() {
        let cli = parse(&["--spread", "0"]);
        assert!(matches!(StrategyConfig::from_cli(&cli), Err(ConfigError::NotPositive("spread"))));

        let cli = parse(&["--target-position", "2", "--max-position", "1"]);
        assert!(matches!(StrategyConfig::from_cli(&cli), Err(ConfigError::TargetBeyondMax { .. })));

        let cli = parse(&["--max-orders", "0"]);
        assert!(StrategyConfig::from_cli(&cli).is_err());
    }
}
