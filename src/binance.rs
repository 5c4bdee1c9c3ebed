// ===============================
// src/binance.rs
// ===============================
//
// Wire-level pieces shared by the Binance adapter: endpoints per market,
// query signing, error-code mapping and user-data stream decoding.
//
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::{now_ns, ExecReport, ExecStatus, MarketType};
use crate::gateway::GatewayError;

pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Auth(format!("bad api secret: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// REST paths and stream bases for one market.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub rest: String,
    pub ws: String,
    pub order: &'static str,
    pub open_orders: &'static str,
    pub exchange_info: &'static str,
    pub book_ticker: &'static str,
    pub listen_key: &'static str,
    pub account: &'static str,
    pub position: Option<&'static str>,
}

impl Endpoints {
    pub fn for_market(market: MarketType, testnet: bool) -> Self {
        match market {
            MarketType::Spot => Self {
                rest: if testnet { "https://testnet.binance.vision" } else { "https://api.binance.com" }.into(),
                ws: if testnet { "wss://testnet.binance.vision/ws" } else { "wss://stream.binance.com:9443/ws" }.into(),
                order: "/api/v3/order",
                open_orders: "/api/v3/openOrders",
                exchange_info: "/api/v3/exchangeInfo",
                book_ticker: "/api/v3/ticker/bookTicker",
                listen_key: "/api/v3/userDataStream",
                account: "/api/v3/account",
                position: None,
            },
            MarketType::Perpetual => Self {
                rest: if testnet { "https://testnet.binancefuture.com" } else { "https://fapi.binance.com" }.into(),
                ws: if testnet { "wss://stream.binancefuture.com/ws" } else { "wss://fstream.binance.com/ws" }.into(),
                order: "/fapi/v1/order",
                open_orders: "/fapi/v1/openOrders",
                exchange_info: "/fapi/v1/exchangeInfo",
                book_ticker: "/fapi/v1/ticker/bookTicker",
                listen_key: "/fapi/v1/listenKey",
                account: "/fapi/v2/balance",
                position: Some("/fapi/v2/positionRisk"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    msg: String,
}

/// -2011 / -2013: cancel of an order the exchange no longer knows.
pub fn is_unknown_order(code: i64) -> bool {
    matches!(code, -2011 | -2013)
}

/// Error code from a failed response body, if it carries one.
pub fn error_code(body: &str) -> Option<i64> {
    serde_json::from_str::<ApiError>(body).ok().map(|e| e.code)
}

pub fn map_error(status: u16, body: &str) -> GatewayError {
    let (code, msg) = match serde_json::from_str::<ApiError>(body) {
        Ok(e) => (e.code, e.msg),
        Err(_) => (0, body.chars().take(200).collect()),
    };
    let text = format!("http {status} code {code}: {msg}");
    match (status, code) {
        (429 | 418, _) | (_, -1003 | -1015) => GatewayError::RateLimited(text),
        (401, _) | (_, -1022 | -2014 | -2015 | -2008) => GatewayError::Auth(text),
        // clock skew and server-side hiccups clear up on their own
        (_, -1000 | -1001 | -1007 | -1021) => GatewayError::Transient(text),
        (s, _) if s >= 500 => GatewayError::Transient(text),
        _ => GatewayError::Rejected(text),
    }
}

pub fn parse_decimal(v: &serde_json::Value) -> Option<Decimal> {
    match v {
        serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
        serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    }
}

/// tick size, lot size, base asset, quote asset from an exchangeInfo body.
pub fn parse_symbol_filters(v: &serde_json::Value, symbol: &str) -> Option<(Decimal, Decimal, String, String)> {
    let entry = v.get("symbols")?.as_array()?.iter().find(|s| s.get("symbol").and_then(|x| x.as_str()) == Some(symbol))?;
    let mut tick = None;
    let mut lot = None;
    for f in entry.get("filters")?.as_array()? {
        match f.get("filterType").and_then(|x| x.as_str()) {
            Some("PRICE_FILTER") => tick = f.get("tickSize").and_then(parse_decimal),
            Some("LOT_SIZE") => lot = f.get("stepSize").and_then(parse_decimal),
            _ => {}
        }
    }
    let base = entry.get("baseAsset")?.as_str()?.to_string();
    let quote = entry.get("quoteAsset")?.as_str()?.to_string();
    Some((tick?.normalize(), lot?.normalize(), base, quote))
}

// ---- user-data stream ----

/// Spot `executionReport` (flat) and futures `ORDER_TRADE_UPDATE` (nested in `o`).
#[derive(Debug, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_id: String,
    /// Spot only: original client id when `c` belongs to a cancel request.
    #[serde(rename = "C", default)]
    pub orig_client_id: Option<String>,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "z", default)]
    pub cum_filled: Option<String>,
    #[serde(rename = "L", default)]
    pub last_px: Option<String>,
    #[serde(rename = "n", default)]
    pub commission: Option<String>,
    #[serde(rename = "m", default)]
    pub is_maker: bool,
    #[serde(rename = "r", default)]
    pub reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    o: Option<OrderUpdate>,
}

#[derive(Debug)]
pub enum UserEvent {
    Order(ExecReport),
    ListenKeyExpired,
    Other,
}

fn dec_or_zero(s: &Option<String>) -> Decimal {
    s.as_deref().and_then(|x| x.parse::<Decimal>().ok()).unwrap_or(Decimal::ZERO)
}

impl OrderUpdate {
    pub fn into_report(self) -> Option<ExecReport> {
        let status = match self.status.as_str() {
            "NEW" => ExecStatus::Ack,
            "PARTIALLY_FILLED" => ExecStatus::PartialFill,
            "FILLED" => ExecStatus::Filled,
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => ExecStatus::Cancelled,
            "REJECTED" => ExecStatus::Rejected(self.reject_reason.clone().unwrap_or_else(|| "REJECTED".into())),
            _ => return None,
        };
        let cl_id = match (&status, self.orig_client_id.as_deref()) {
            (ExecStatus::Cancelled, Some(orig)) if !orig.is_empty() => orig.to_string(),
            _ => self.client_id.clone(),
        };
        Some(ExecReport {
            cl_id,
            symbol: self.symbol.clone(),
            status,
            cum_filled: dec_or_zero(&self.cum_filled),
            last_px: dec_or_zero(&self.last_px),
            fee: dec_or_zero(&self.commission),
            is_maker: self.is_maker,
            ts_ns: now_ns(),
        })
    }
}

pub fn parse_user_event(txt: &str) -> Result<UserEvent, GatewayError> {
    let v: serde_json::Value = serde_json::from_str(txt).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let kind = v.get("e").and_then(|x| x.as_str()).unwrap_or_default();
    let order = match kind {
        "executionReport" => serde_json::from_value::<OrderUpdate>(v),
        "ORDER_TRADE_UPDATE" => match serde_json::from_value::<Envelope>(v) {
            Ok(Envelope { o: Some(o), .. }) => Ok(o),
            Ok(Envelope { e, .. }) => return Err(GatewayError::Decode(format!("{e:?} without order body"))),
            Err(err) => Err(err),
        },
        "listenKeyExpired" => return Ok(UserEvent::ListenKeyExpired),
        _ => return Ok(UserEvent::Other),
    }
    .map_err(|e| GatewayError::Decode(e.to_string()))?;
    Ok(order.into_report().map(UserEvent::Order).unwrap_or(UserEvent::Other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_matches_published_example() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_values_are_encoded() {
        let q = encode_query(&[("symbol", "SOLUSDT".into()), ("newClientOrderId", "MM-1/2".into())]);
        assert_eq!(q, "symbol=SOLUSDT&newClientOrderId=MM-1%2F2");
    }

    #[test]
    fn error_codes_classify() {
        assert!(matches!(map_error(429, r#"{"code":-1003,"msg":"too many"}"#), GatewayError::RateLimited(_)));
        assert!(map_error(401, r#"{"code":-2015,"msg":"invalid key"}"#).is_fatal());
        assert!(matches!(map_error(400, r#"{"code":-1021,"msg":"timestamp"}"#), GatewayError::Transient(_)));
        assert!(matches!(map_error(400, r#"{"code":-2010,"msg":"insufficient"}"#), GatewayError::Rejected(_)));
        assert!(matches!(map_error(502, "bad gateway"), GatewayError::Transient(_)));
        assert_eq!(error_code(r#"{"code":-2011,"msg":"Unknown order sent."}"#), Some(-2011));
        assert!(is_unknown_order(-2011));
    }

    #[test]
    fn exchange_info_filters() {
        let body = serde_json::json!({
            "symbols": [{
                "symbol": "SOLUSDT", "baseAsset": "SOL", "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.00100000"}
                ]
            }]
        });
        let (tick, lot, base, quote) = parse_symbol_filters(&body, "SOLUSDT").unwrap();
        assert_eq!(tick, dec!(0.01));
        assert_eq!(lot, dec!(0.001));
        assert_eq!((base.as_str(), quote.as_str()), ("SOL", "USDT"));
        assert!(parse_symbol_filters(&body, "BTCUSDT").is_none());
    }

    #[test]
    fn spot_execution_report() {
        let txt = r#"{"e":"executionReport","E":1,"s":"SOLUSDT","c":"MM-1-1","C":"","X":"PARTIALLY_FILLED","x":"TRADE",
            "z":"0.040","L":"100.01","n":"0.002","m":true,"r":"NONE"}"#;
        match parse_user_event(txt).unwrap() {
            UserEvent::Order(er) => {
                assert_eq!(er.cl_id, "MM-1-1");
                assert_eq!(er.status, ExecStatus::PartialFill);
                assert_eq!(er.cum_filled, dec!(0.04));
                assert_eq!(er.last_px, dec!(100.01));
                assert!(er.is_maker);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spot_cancel_uses_original_client_id() {
        let txt = r#"{"e":"executionReport","s":"SOLUSDT","c":"web_cancel","C":"MM-1-7","X":"CANCELED","z":"0"}"#;
        let UserEvent::Order(er) = parse_user_event(txt).unwrap() else { panic!("no order") };
        assert_eq!(er.cl_id, "MM-1-7");
        assert_eq!(er.status, ExecStatus::Cancelled);
    }

    #[test]
    fn futures_order_trade_update() {
        let txt = r#"{"e":"ORDER_TRADE_UPDATE","E":2,"T":2,"o":{"s":"SOLUSDT","c":"MM-9-3","X":"FILLED","x":"TRADE",
            "z":"0.1","L":"99.5","n":"0.004975","N":"USDT","m":false}}"#;
        let UserEvent::Order(er) = parse_user_event(txt).unwrap() else { panic!("no order") };
        assert_eq!(er.status, ExecStatus::Filled);
        assert_eq!(er.fee, dec!(0.004975));
        assert!(!er.is_maker);
    }

    #[test]
    fn other_events_pass_through() {
        assert!(matches!(parse_user_event(r#"{"e":"listenKeyExpired"}"#).unwrap(), UserEvent::ListenKeyExpired));
        assert!(matches!(parse_user_event(r#"{"e":"ACCOUNT_UPDATE"}"#).unwrap(), UserEvent::Other));
        assert!(parse_user_event("not json").is_err());
    }
}
