//! Binance spot REST order placement
//!
//! Signed endpoints take the query string plus an HMAC-SHA256 `signature`
//! parameter and the key in the `X-MBX-APIKEY` header.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::placer::{Fill, OrderPlacer};
use crate::error::ExchangeError;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5_000;

pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    api_secret: String,
}

impl BinanceRestClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self, ExchangeError> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(api_key)
                .map_err(|e| ExchangeError::Malformed(format!("api key header: {e}")))?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn signed_query(&self, params: &str) -> Result<String, ExchangeError> {
        let query = format!(
            "{}{}timestamp={}&recvWindow={}",
            params,
            if params.is_empty() { "" } else { "&" },
            Utc::now().timestamp_millis(),
            RECV_WINDOW_MS
        );
        let signature = sign(&self.api_secret, &query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))
    }
}

/// Hex HMAC-SHA256 of `payload`
pub fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Malformed(format!("hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Decimal quantity without float noise or trailing zeros
pub fn format_quantity(size: f64) -> String {
    let s = format!("{:.8}", size);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn number_field(value: &serde_json::Value, key: &str) -> Result<f64, ExchangeError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| ExchangeError::Malformed(format!("missing or invalid {key}")))
}

/// Fill of a MARKET order response (`newOrderRespType` RESULT or FULL)
pub fn parse_order_response(value: &serde_json::Value) -> Result<Fill, ExchangeError> {
    let status = value
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    if status != "FILLED" {
        return Err(ExchangeError::Rejected {
            status: 200,
            body: format!("order status {status}"),
        });
    }

    let executed = number_field(value, "executedQty")?;
    let quote = number_field(value, "cummulativeQuoteQty")?;
    if executed <= 0.0 {
        return Err(ExchangeError::Malformed("zero executed quantity".to_string()));
    }
    Ok(Fill {
        price: quote / executed,
        size: executed,
    })
}

/// Free balance of `asset` in an `/api/v3/account` response
pub fn parse_balance(value: &serde_json::Value, asset: &str) -> Result<f64, ExchangeError> {
    let balances = value
        .get("balances")
        .and_then(|b| b.as_array())
        .ok_or_else(|| ExchangeError::Malformed("missing balances".to_string()))?;
    match balances
        .iter()
        .find(|b| b.get("asset").and_then(|a| a.as_str()) == Some(asset))
    {
        Some(entry) => number_field(entry, "free"),
        None => Ok(0.0),
    }
}

#[async_trait]
impl OrderPlacer for BinanceRestClient {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
    ) -> Result<Fill, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&newOrderRespType=RESULT",
            symbol.to_uppercase(),
            side.as_str(),
            format_quantity(size)
        );
        let query = self.signed_query(&params)?;
        debug!(symbol, side = side.as_str(), size, "Placing market order");

        let resp = self
            .client
            .post(format!("{}/api/v3/order?{}", self.base_url, query))
            .send()
            .await?;
        let body = Self::read_json(resp).await?;
        parse_order_response(&body)
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let query = self.signed_query("")?;
        let resp = self
            .client
            .get(format!("{}/api/v3/account?{}", self.base_url, query))
            .send()
            .await?;
        let body = Self::read_json(resp).await?;
        parse_balance(&body, asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_matches_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(0.5), "0.5");
        assert_eq!(format_quantity(2.0), "2");
        assert_eq!(format_quantity(0.000_123_4), "0.0001234");
        assert_eq!(format_quantity(0.0), "0");
    }

    #[test]
    fn test_parse_filled_order() {
        let body = json!({
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "executedQty": "0.50000000",
            "cummulativeQuoteQty": "25000.00000000"
        });
        let fill = parse_order_response(&body).unwrap();
        assert_eq!(fill.size, 0.5);
        assert_eq!(fill.price, 50_000.0);
    }

    #[test]
    fn test_unfilled_order_is_rejected() {
        let body = json!({
            "status": "EXPIRED",
            "executedQty": "0.0",
            "cummulativeQuoteQty": "0.0"
        });
        assert!(matches!(
            parse_order_response(&body),
            Err(ExchangeError::Rejected { .. })
        ));
    }

    #[test]
    fn test_parse_balance() {
        let body = json!({
            "balances": [
                {"asset": "BTC", "free": "0.25", "locked": "0.0"},
                {"asset": "USDT", "free": "1234.5", "locked": "10.0"}
            ]
        });
        assert_eq!(parse_balance(&body, "USDT").unwrap(), 1234.5);
        assert_eq!(parse_balance(&body, "ETH").unwrap(), 0.0);
        assert!(parse_balance(&json!({}), "USDT").is_err());
    }

    #[test]
    fn test_missing_credentials() {
        assert!(matches!(
            BinanceRestClient::new("https://api.binance.com", "", "secret"),
            Err(ExchangeError::MissingCredentials)
        ));
    }
}
