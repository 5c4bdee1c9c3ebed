// ===============================
// src/main.rs
// ===============================
/*
 # paper run, 30s, metrics on :9898
 cargo run -- --exchange paper --symbol SOLUSDT --spread 0.2 --quantity 0.1 --duration 30

 # what is running
curl -s localhost:9898/metrics | grep '^config_info'

# tick outcomes, de-risk trades, position
curl -s localhost:9898/metrics | egrep '^(ticks_total|derisk_actions_total|position_net)'

*/
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
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod quote;
mod risk;
mod positions;
mod orders;
mod posttrade;
mod strategy;
mod gateway;          // ExchangeAdapter contract
mod gateway_paper;    // in-process exchange (mock feed, instant matching)
mod binance;          // signing, endpoints, user-stream decoding
mod gateway_binance;  // Binance spot + USDⓈ-M perp (REST + WS)

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ExchangeKind;
use crate::domain::{Event, ExecReport};
use crate::feed::MarketDataCache;
use crate::gateway::{ExchangeAdapter, StreamSink};
use crate::gateway_binance::BinanceGateway;
use crate::gateway_paper::PaperGateway;
use crate::recorder::EventSink;
use crate::strategy::Engine;

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let (cfg, args) = match config::load() {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    // ---- Stop signal ----
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c, draining");
            let _ = stop_tx.send(true);
        }
    });

    // ---- Metrics ----
    metrics::init();
    {
        let port = args.metrics_port;
        let rx = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port, rx).await {
                warn!(error = %e, port, "metrics server stopped");
            }
        });
    }
    metrics::CONFIG_INFO
        .with_label_values(&[args.exchange.as_str(), cfg.market.as_str(), &cfg.symbol, cfg.mode.as_str()])
        .set(1);

    info!(
        exchange = args.exchange.as_str(),
        market = cfg.market.as_str(),
        symbol = %cfg.symbol,
        mode = cfg.mode.as_str(),
        spread_pct = %cfg.spread_pct,
        quantity = %cfg.quantity,
        max_orders = cfg.max_orders,
        target = %cfg.target_position,
        max_position = %cfg.max_position,
        threshold = %cfg.position_threshold,
        skew = %cfg.inventory_skew,
        testnet = args.testnet,
        "startup config"
    );

    // ---- Exchange ----
    let gw: Arc<dyn ExchangeAdapter> = match args.exchange {
        ExchangeKind::Paper => {
            let paper = Arc::new(PaperGateway::new(dec!(0.01), dec!(0.001)));
            tokio::spawn(feed::run_mock(paper.clone(), cfg.symbol.clone(), dec!(100), dec!(0.01)));
            paper
        }
        ExchangeKind::Binance => match BinanceGateway::from_env(cfg.market, args.testnet) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                error!(error = %e, "binance adapter unavailable");
                return ExitCode::from(2);
            }
        },
    };

    let symbol = match gw.symbol_info(&cfg.symbol, cfg.market).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, symbol = %cfg.symbol, "symbol lookup failed");
            return ExitCode::FAILURE;
        }
    };
    info!(
        symbol = %symbol.name,
        tick = %symbol.tick_size,
        lot = %symbol.lot_size,
        base = %symbol.base_asset,
        quote = %symbol.quote_asset,
        "symbol resolved"
    );

    // ---- Streams ----
    let cache = Arc::new(MarketDataCache::new(cfg.stale_after));
    let (exec_tx, exec_rx) = mpsc::channel::<ExecReport>(4096);
    if let Err(e) = gw.subscribe(&symbol.name, StreamSink { cache: cache.clone(), exec_tx }).await {
        error!(error = %e, "subscribe failed");
        return ExitCode::FAILURE;
    }

    // ---- Recorder (optional) ----
    let (events, recorder_task) = match args.record_file.clone() {
        Some(path) => {
            let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
            let task = tokio::spawn(recorder::run(rec_rx, path));
            (EventSink::new(rec_tx), Some(task))
        }
        None => (EventSink::disabled(), None),
    };

    // ---- Engine ----
    let (engine, _pos_rx) = match Engine::new(cfg, symbol, gw, cache, exec_rx, events) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "engine setup failed");
            return ExitCode::from(2);
        }
    };

    let code = match engine.run(stop_rx).await {
        Ok(stats) => {
            info!(trades = stats.trades, volume = %stats.base_volume(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "stopped on fatal error");
            ExitCode::FAILURE
        }
    };

    // the engine dropped its sinks; let the recorder flush
    if let Some(task) = recorder_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
    code
}
