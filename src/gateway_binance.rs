// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance spot (/api/v3) and USDⓈ-M perpetual (/fapi) behind ExchangeAdapter.
// REST for orders/queries (HMAC-SHA256 signed), bookTicker + user-data
// stream over WebSocket. Fills only ever arrive through the stream.
//
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{
    encode_query, error_code, is_unknown_order, map_error, parse_decimal, parse_symbol_filters, parse_user_event,
    sign_query, timestamp_ms, Endpoints, UserEvent,
};
use crate::domain::{ExecReport, MarketType, Side, Symbol, TimeInForce};
use crate::feed::{backoff_delay, run_binance};
use crate::gateway::{
    Balance, CancelOutcome, Capabilities, ExchangeAdapter, GatewayError, OpenOrder, PlaceAck, PositionInfo,
    StreamSink,
};
use crate::metrics::{EXECS, LISTEN_KEEPALIVE, WS_CONNECTED, WS_RECONNECTS};

const KEEPALIVE_EVERY: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct BinanceGateway {
    http: reqwest::Client,
    market: MarketType,
    ep: Endpoints,
    api_key: String,
    api_secret: String,
    recv_window: u64,
    /// symbol -> base asset, filled by symbol_info (spot position lookups)
    base_assets: Arc<Mutex<HashMap<String, String>>>,
}

impl BinanceGateway {
    /// Credentials from BINANCE_API_KEY / BINANCE_API_SECRET; endpoints may be
    /// overridden with BINANCE_REST_URL / BINANCE_WS_URL.
    pub fn from_env(market: MarketType, testnet: bool) -> Result<Self, GatewayError> {
        let api_key = std::env::var("BINANCE_API_KEY").map_err(|_| GatewayError::Auth("BINANCE_API_KEY missing".into()))?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").map_err(|_| GatewayError::Auth("BINANCE_API_SECRET missing".into()))?;
        let recv_window = std::env::var("BINANCE_RECV_WINDOW")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(5000);

        let mut ep = Endpoints::for_market(market, testnet);
        if let Ok(rest) = std::env::var("BINANCE_REST_URL") {
            ep.rest = rest;
        }
        if let Ok(ws) = std::env::var("BINANCE_WS_URL") {
            ep.ws = ws;
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Fatal(format!("http client: {e}")))?;

        info!(market = market.as_str(), rest = %ep.rest, ws = %ep.ws, testnet, "binance adapter ready");
        Ok(Self {
            http,
            market,
            ep,
            api_key,
            api_secret,
            recv_window,
            base_assets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn send(&self, method: Method, url: String) -> Result<Value, GatewayError> {
        let rsp = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("http: {e}")))?;
        let status = rsp.status();
        let body = rsp.text().await.map_err(|e| GatewayError::Transient(format!("http body: {e}")))?;
        if !status.is_success() {
            return Err(map_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn public(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError> {
        let url = format!("{}{}?{}", self.ep.rest, path, encode_query(params));
        self.send(Method::GET, url).await
    }

    async fn signed(&self, method: Method, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError> {
        let mut all = params.to_vec();
        all.push(("timestamp", timestamp_ms().to_string()));
        all.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_query(&all);
        let sig = sign_query(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.ep.rest, path, query, sig);
        self.send(method, url).await
    }

    async fn create_listen_key(&self) -> Result<String, GatewayError> {
        let url = format!("{}{}", self.ep.rest, self.ep.listen_key);
        let v = self.send(Method::POST, url).await?;
        v.get("listenKey")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Decode("no listenKey".into()))
    }

    async fn keepalive(&self, listen_key: &str) -> Result<(), GatewayError> {
        let url = match self.market {
            MarketType::Spot => format!("{}{}?listenKey={}", self.ep.rest, self.ep.listen_key, listen_key),
            MarketType::Perpetual => format!("{}{}", self.ep.rest, self.ep.listen_key),
        };
        self.send(Method::PUT, url).await.map(|_| ())
    }

    /// Account stream: reconnects with backoff, renews the listenKey when it
    /// expires, stops once the engine side of the channel is gone.
    async fn user_stream_loop(self, exec_tx: mpsc::Sender<ExecReport>) {
        let mut attempt: u32 = 0;
        while !exec_tx.is_closed() {
            let listen_key = match self.create_listen_key().await {
                Ok(k) => k,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "listenKey rejected, user stream stopped");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "create listenKey failed");
                    WS_RECONNECTS.with_label_values(&["user"]).inc();
                    sleep(backoff_delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };
            let ws_url = format!("{}/{}", self.ep.ws.trim_end_matches('/'), listen_key);
            let url = match Url::parse(&ws_url) {
                Ok(u) => u,
                Err(e) => {
                    error!(?e, "bad user stream url");
                    return;
                }
            };

            match connect_async(url).await {
                Ok((mut ws, _)) => {
                    info!("user data stream connected");
                    WS_CONNECTED.with_label_values(&["user"]).set(1);
                    attempt = 0;
                    let mut keepalive = interval(KEEPALIVE_EVERY);
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    keepalive.tick().await;

                    loop {
                        tokio::select! {
                            _ = keepalive.tick() => {
                                match self.keepalive(&listen_key).await {
                                    Ok(()) => LISTEN_KEEPALIVE.with_label_values(&["ok"]).inc(),
                                    Err(e) => {
                                        LISTEN_KEEPALIVE.with_label_values(&["error"]).inc();
                                        warn!(error = %e, "listenKey keepalive failed");
                                    }
                                }
                            }
                            frame = ws.next() => {
                                let Some(frame) = frame else { break };
                                match frame {
                                    Ok(Message::Text(txt)) => match parse_user_event(&txt) {
                                        Ok(UserEvent::Order(er)) => {
                                            EXECS.with_label_values(&[er.status.label()]).inc();
                                            if exec_tx.try_send(er).is_err() {
                                                // the next re-sync recovers whatever was dropped
                                                warn!("exec queue full or closed, report dropped");
                                            }
                                        }
                                        Ok(UserEvent::ListenKeyExpired) => {
                                            warn!("listenKey expired, renewing");
                                            break;
                                        }
                                        Ok(UserEvent::Other) => {}
                                        Err(e) => debug!(error = %e, "unparsed user event"),
                                    },
                                    Ok(Message::Ping(p)) => {
                                        let _ = ws.send(Message::Pong(p)).await;
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        error!(?e, "user stream read error");
                                        break;
                                    }
                                }
                            }
                        }
                        if exec_tx.is_closed() {
                            break;
                        }
                    }
                    WS_CONNECTED.with_label_values(&["user"]).set(0);
                    info!("user data stream disconnected");
                }
                Err(e) => error!(?e, "connect user data stream failed"),
            }

            WS_RECONNECTS.with_label_values(&["user"]).inc();
            sleep(backoff_delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    fn base_asset(&self, symbol: &str) -> Option<String> {
        self.base_assets.lock().ok().and_then(|m| m.get(symbol).cloned())
    }
}

fn field_dec(v: &Value, key: &str) -> Decimal {
    v.get(key).and_then(parse_decimal).unwrap_or(Decimal::ZERO)
}

fn field_str(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_open_order(v: &Value) -> Option<OpenOrder> {
    let side = match v.get("side")?.as_str()? {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };
    Some(OpenOrder {
        cl_id: field_str(v, "clientOrderId"),
        exchange_id: field_str(v, "orderId"),
        side,
        price: field_dec(v, "price"),
        size: field_dec(v, "origQty"),
        filled: field_dec(v, "executedQty"),
    })
}

#[async_trait]
impl ExchangeAdapter for BinanceGateway {
    fn name(&self) -> &str { "binance" }

    fn capabilities(&self) -> Capabilities { Capabilities { maker: true, ioc: true } }

    async fn symbol_info(&self, symbol: &str, market: MarketType) -> Result<Symbol, GatewayError> {
        // the futures endpoint takes no filter and lists every contract
        let params = match self.market {
            MarketType::Spot => vec![("symbol", symbol.to_string())],
            MarketType::Perpetual => vec![],
        };
        let v = self.public(self.ep.exchange_info, &params).await?;
        let (tick_size, lot_size, base_asset, quote_asset) = parse_symbol_filters(&v, symbol)
            .ok_or_else(|| GatewayError::Fatal(format!("{symbol} not listed or missing filters")))?;
        if let Ok(mut m) = self.base_assets.lock() {
            m.insert(symbol.to_string(), base_asset.clone());
        }
        Ok(Symbol { name: symbol.to_string(), market, base_asset, quote_asset, tick_size, lot_size })
    }

    async fn order_book(&self, symbol: &str) -> Result<(Decimal, Decimal), GatewayError> {
        let v = self.public(self.ep.book_ticker, &[("symbol", symbol.to_string())]).await?;
        let bid = field_dec(&v, "bidPrice");
        let ask = field_dec(&v, "askPrice");
        if bid <= Decimal::ZERO || ask <= bid {
            return Err(GatewayError::Transient(format!("unusable book {bid}/{ask}")));
        }
        Ok((bid, ask))
    }

    async fn subscribe(&self, symbol: &str, sink: StreamSink) -> Result<(), GatewayError> {
        tokio::spawn(run_binance(sink.cache.clone(), symbol.to_string(), self.ep.ws.clone()));
        tokio::spawn(self.clone().user_stream_loop(sink.exec_tx));
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
        let side_s = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side_s.to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", tif.as_str().to_string()),
            ("quantity", size.normalize().to_string()),
            ("price", price.normalize().to_string()),
            ("newClientOrderId", cl_id.to_string()),
        ];
        if self.market == MarketType::Spot {
            params.push(("newOrderRespType", "ACK".to_string()));
        }
        let v = self.signed(Method::POST, self.ep.order, &params).await?;
        Ok(PlaceAck { exchange_id: field_str(&v, "orderId") })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        cl_id: &str,
        exchange_id: Option<&str>,
    ) -> Result<CancelOutcome, GatewayError> {
        let mut params = vec![("symbol", symbol.to_string())];
        match exchange_id {
            Some(id) if !id.is_empty() => params.push(("orderId", id.to_string())),
            _ => params.push(("origClientOrderId", cl_id.to_string())),
        }
        match self.signed(Method::DELETE, self.ep.order, &params).await {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(GatewayError::Rejected(body)) if error_code_in(&body).map_or(false, is_unknown_order) => {
                Ok(CancelOutcome::AlreadyTerminal)
            }
            Err(e) => Err(e),
        }
    }

    async fn position(&self, symbol: &str) -> Result<PositionInfo, GatewayError> {
        match self.ep.position {
            Some(path) => {
                let v = self.signed(Method::GET, path, &[("symbol", symbol.to_string())]).await?;
                let rows = v.as_array().ok_or_else(|| GatewayError::Decode("positionRisk not an array".into()))?;
                let mut out = PositionInfo::default();
                for r in rows.iter().filter(|r| r.get("symbol").and_then(|x| x.as_str()) == Some(symbol)) {
                    let amt = field_dec(r, "positionAmt");
                    if !amt.is_zero() {
                        out.net += amt;
                        out.entry_price = field_dec(r, "entryPrice");
                    }
                }
                Ok(out)
            }
            None => {
                // spot inventory is the base asset balance
                let base = self
                    .base_asset(symbol)
                    .ok_or_else(|| GatewayError::Fatal(format!("{symbol} position before symbol_info")))?;
                let net = self
                    .balances()
                    .await?
                    .into_iter()
                    .find(|b| b.asset == base)
                    .map(|b| b.free + b.locked)
                    .unwrap_or(Decimal::ZERO);
                Ok(PositionInfo { net, entry_price: Decimal::ZERO })
            }
        }
    }

    async fn balances(&self) -> Result<Vec<Balance>, GatewayError> {
        let v = self.signed(Method::GET, self.ep.account, &[]).await?;
        let rows = match self.market {
            MarketType::Spot => v.get("balances").and_then(|b| b.as_array()).cloned(),
            MarketType::Perpetual => v.as_array().cloned(),
        }
        .ok_or_else(|| GatewayError::Decode("balances missing".into()))?;

        Ok(rows
            .iter()
            .map(|r| match self.market {
                MarketType::Spot => Balance {
                    asset: field_str(r, "asset"),
                    free: field_dec(r, "free"),
                    locked: field_dec(r, "locked"),
                },
                MarketType::Perpetual => {
                    let total = field_dec(r, "balance");
                    let free = field_dec(r, "availableBalance");
                    Balance { asset: field_str(r, "asset"), free, locked: (total - free).max(Decimal::ZERO) }
                }
            })
            .filter(|b| !(b.free.is_zero() && b.locked.is_zero()))
            .collect())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        let v = self.signed(Method::GET, self.ep.open_orders, &[("symbol", symbol.to_string())]).await?;
        let rows = v.as_array().ok_or_else(|| GatewayError::Decode("openOrders not an array".into()))?;
        Ok(rows.iter().filter_map(parse_open_order).collect())
    }
}

/// `map_error` folds the body into the message; pull the code back out.
fn error_code_in(text: &str) -> Option<i64> {
    let code = text.split("code ").nth(1)?.split(':').next()?.trim();
    code.parse::<i64>().ok().or_else(|| error_code(text))
}
