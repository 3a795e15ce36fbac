// =============================================================================
// UsdtmClient — REST client for USDT-M perpetuals (Binance / Bybit / MEXC)
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests use
// HMAC-SHA256 with a recvWindow of 5 000 ms to tolerate minor clock drift.
//
// Venue quirks handled here and nowhere else:
//   - kline interval naming ("5m" vs "5" vs "Min5")
//   - client order id parameter ("newClientOrderId" / "orderLinkId" /
//     "clientOrderId")
//   - stop-market order-type fallback chain; when every variant fails the
//     SL order id stays None and the monitor enforces SL by price
//   - signing transport (query-string signature vs signed headers)
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::Direction;

use super::rate_limit::RateLimitPacer;
use super::{BracketIds, Exchange, MarketConstraints, Ohlcv, OrderStatus, Ticker, Venue};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// REST client for USDT-M linear perpetual futures.
pub struct UsdtmClient {
    venue: Venue,
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    pacer: RateLimitPacer,
}

impl UsdtmClient {
    /// Build a client for `venue`. `timeout_ms` applies to every request;
    /// `rate_limit` enables the request pacer (on by default in config).
    pub fn new(
        venue: Venue,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        testnet: bool,
        timeout_ms: u64,
        rate_limit: bool,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let secret = secret.into();

        let base_url = match (venue, testnet) {
            (Venue::Binance, false) => "https://fapi.binance.com",
            (Venue::Binance, true) => "https://testnet.binancefuture.com",
            (Venue::Bybit, false) => "https://api.bybit.com",
            (Venue::Bybit, true) => "https://api-testnet.bybit.com",
            // MEXC has no public futures testnet; testnet falls through to prod.
            (Venue::Mexc, _) => "https://contract.mexc.com",
        }
        .to_string();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if venue == Venue::Binance {
            if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
                default_headers.insert("X-MBX-APIKEY", val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_millis(timeout_ms.max(1000)))
            .build()
            .context("failed to build reqwest client")?;

        debug!(venue = %venue, base_url = %base_url, "UsdtmClient initialised");

        Ok(Self {
            venue,
            api_key,
            secret,
            base_url,
            client,
            pacer: RateLimitPacer::new(venue, rate_limit),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Binance style: timestamp + recvWindow + signature appended to the query.
    fn binance_signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Bybit v5 style: signature over `timestamp + api_key + recv_window +
    /// payload`, delivered via headers.
    fn bybit_auth_headers(&self, payload: &str) -> Vec<(&'static str, String)> {
        let ts = Self::timestamp_ms().to_string();
        let prehash = format!("{ts}{}{RECV_WINDOW}{payload}", self.api_key);
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", ts),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", self.sign(&prehash)),
        ]
    }

    /// MEXC contract style: signature over `access_key + timestamp + payload`,
    /// delivered via headers.
    fn mexc_auth_headers(&self, payload: &str) -> Vec<(&'static str, String)> {
        let ts = Self::timestamp_ms().to_string();
        let prehash = format!("{}{ts}{payload}", self.api_key);
        vec![
            ("ApiKey", self.api_key.clone()),
            ("Request-Time", ts),
            ("Signature", self.sign(&prehash)),
        ]
    }

    // -------------------------------------------------------------------------
    // HTTP helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        self.pacer.pace().await;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        self.pacer.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("GET {url}: invalid JSON response"))?;
        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }
        Ok(body)
    }

    async fn get_json_with_headers(
        &self,
        url: &str,
        headers: Vec<(&'static str, String)>,
    ) -> Result<serde_json::Value> {
        self.pacer.pace().await;
        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.with_context(|| format!("GET {url} failed"))?;
        self.pacer.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("GET {url}: invalid JSON response"))?;
        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }
        Ok(body)
    }

    async fn post_json(
        &self,
        url: &str,
        headers: Vec<(&'static str, String)>,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.pacer.pace().await;
        let mut req = self.client.post(url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.with_context(|| format!("POST {url} failed"))?;
        self.pacer.update_from_headers(resp.headers());
        let status = resp.status();
        let out: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("POST {url}: invalid JSON response"))?;
        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", url, status, out);
        }
        Ok(out)
    }

    async fn delete_json(&self, url: &str) -> Result<serde_json::Value> {
        self.pacer.pace().await;
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .with_context(|| format!("DELETE {url} failed"))?;
        self.pacer.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("DELETE {url}: invalid JSON response"))?;
        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Symbol / parameter mapping
    // -------------------------------------------------------------------------

    /// Resolve a user symbol like `BTCUSDT` to the venue market symbol.
    pub fn resolve_symbol(&self, user_symbol: &str) -> String {
        let s = user_symbol.trim().to_uppercase().replace('/', "");
        match self.venue {
            Venue::Binance | Venue::Bybit => s,
            // MEXC contract symbols are underscore separated: BTC_USDT.
            Venue::Mexc => {
                if let Some(base) = s.strip_suffix("USDT") {
                    format!("{base}_USDT")
                } else {
                    s
                }
            }
        }
    }

    /// Normalize a venue market symbol back into the compact user form.
    fn user_symbol(&self, market_symbol: &str) -> String {
        market_symbol.trim().to_uppercase().replace(['/', '_'], "")
    }

    /// Venue-specific kline interval token for a timeframe like "5m".
    fn interval_param(&self, tf: &str) -> String {
        let tf = tf.trim().to_lowercase();
        match self.venue {
            Venue::Binance => tf,
            Venue::Bybit => match tf.as_str() {
                "1m" => "1".into(),
                "5m" => "5".into(),
                "15m" => "15".into(),
                "30m" => "30".into(),
                "1h" => "60".into(),
                "4h" => "240".into(),
                "1d" => "D".into(),
                other => other.trim_end_matches('m').to_string(),
            },
            Venue::Mexc => match tf.as_str() {
                "1m" => "Min1".into(),
                "5m" => "Min5".into(),
                "15m" => "Min15".into(),
                "30m" => "Min30".into(),
                "1h" => "Min60".into(),
                "4h" => "Hour4".into(),
                "1d" => "Day1".into(),
                _ => "Min5".into(),
            },
        }
    }

    /// Client order id parameter name differs per venue.
    fn client_id_param(&self) -> &'static str {
        match self.venue {
            Venue::Binance => "newClientOrderId",
            Venue::Bybit => "orderLinkId",
            Venue::Mexc => "clientOrderId",
        }
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn json_f64(val: &serde_json::Value) -> Option<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().ok()
        } else {
            val.as_f64()
        }
    }

    // -------------------------------------------------------------------------
    // Venue order primitives
    // -------------------------------------------------------------------------

    /// Submit one order on Binance USDT-M. `extra` carries venue params such
    /// as stopPrice / reduceOnly / client id.
    async fn binance_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        qty: f64,
        price: Option<f64>,
        extra: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let mut params = format!(
            "symbol={symbol}&side={}&type={order_type}&quantity={qty}",
            side.to_uppercase()
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        for (k, v) in extra {
            params.push_str(&format!("&{k}={v}"));
        }
        let qs = self.binance_signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        self.post_json(&url, vec![], None).await
    }

    async fn bybit_order(&self, body: serde_json::Value) -> Result<serde_json::Value> {
        let payload = serde_json::to_string(&body).unwrap_or_default();
        let headers = self.bybit_auth_headers(&payload);
        let url = format!("{}/v5/order/create", self.base_url);
        let out = self.post_json(&url, headers, Some(&body)).await?;
        let ret = out.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret != 0 {
            anyhow::bail!("bybit order rejected: {}", out);
        }
        Ok(out)
    }

    async fn mexc_order(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let payload = serde_json::to_string(&body).unwrap_or_default();
        let headers = self.mexc_auth_headers(&payload);
        let url = format!("{}{}", self.base_url, path);
        let out = self.post_json(&url, headers, Some(&body)).await?;
        if !out.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            anyhow::bail!("mexc order rejected: {}", out);
        }
        Ok(out)
    }

    /// Best-effort silent setter: POST a signed Binance endpoint and swallow
    /// every failure (venues reject the call when the mode is already set).
    async fn binance_silent_post(&self, path: &str, params: &str) {
        let qs = self.binance_signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        if let Err(e) = self.post_json(&url, vec![], None).await {
            debug!(venue = %self.venue, path, error = %e, "best-effort setter ignored");
        }
    }

    async fn bybit_silent_post(&self, path: &str, body: serde_json::Value) {
        let payload = serde_json::to_string(&body).unwrap_or_default();
        let headers = self.bybit_auth_headers(&payload);
        let url = format!("{}{}", self.base_url, path);
        if let Err(e) = self.post_json(&url, headers, Some(&body)).await {
            debug!(venue = %self.venue, path, error = %e, "best-effort setter ignored");
        }
    }
}

#[async_trait::async_trait]
impl Exchange for UsdtmClient {
    fn exchange_id(&self) -> &str {
        self.venue.id()
    }

    #[instrument(skip(self), name = "exchange::list_symbols")]
    async fn list_active_usdtm_symbols(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        match self.venue {
            Venue::Binance => {
                let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
                let body = self.get_json(&url).await?;
                for m in body["symbols"].as_array().into_iter().flatten() {
                    let status = m["status"].as_str().unwrap_or("");
                    let contract = m["contractType"].as_str().unwrap_or("");
                    let quote = m["quoteAsset"].as_str().unwrap_or("");
                    let margin = m["marginAsset"].as_str().unwrap_or("");
                    if status == "TRADING"
                        && contract == "PERPETUAL"
                        && quote == "USDT"
                        && margin == "USDT"
                    {
                        if let Some(sym) = m["symbol"].as_str() {
                            out.push(self.user_symbol(sym));
                        }
                    }
                }
            }
            Venue::Bybit => {
                let url = format!(
                    "{}/v5/market/instruments-info?category=linear&limit=1000",
                    self.base_url
                );
                let body = self.get_json(&url).await?;
                for m in body["result"]["list"].as_array().into_iter().flatten() {
                    let status = m["status"].as_str().unwrap_or("");
                    let quote = m["quoteCoin"].as_str().unwrap_or("");
                    let settle = m["settleCoin"].as_str().unwrap_or("");
                    let contract = m["contractType"].as_str().unwrap_or("");
                    if status == "Trading"
                        && quote == "USDT"
                        && settle == "USDT"
                        && contract == "LinearPerpetual"
                    {
                        if let Some(sym) = m["symbol"].as_str() {
                            out.push(self.user_symbol(sym));
                        }
                    }
                }
            }
            Venue::Mexc => {
                let url = format!("{}/api/v1/contract/detail", self.base_url);
                let body = self.get_json(&url).await?;
                for m in body["data"].as_array().into_iter().flatten() {
                    let state = m["state"].as_i64().unwrap_or(-1);
                    let quote = m["quoteCoin"].as_str().unwrap_or("");
                    let settle = m["settleCoin"].as_str().unwrap_or("");
                    if state == 0 && quote == "USDT" && settle == "USDT" {
                        if let Some(sym) = m["symbol"].as_str() {
                            out.push(self.user_symbol(sym));
                        }
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        debug!(venue = %self.venue, count = out.len(), "active USDT-M symbols listed");
        Ok(out)
    }

    #[instrument(skip(self, symbols), name = "exchange::fetch_tickers")]
    async fn fetch_tickers(&self, symbols: &[String]) -> Result<HashMap<String, Ticker>> {
        let wanted: std::collections::HashSet<String> =
            symbols.iter().map(|s| s.to_uppercase()).collect();
        let mut res: HashMap<String, Ticker> = HashMap::new();

        match self.venue {
            Venue::Binance => {
                // Two bulk endpoints: 24hr stats (last/quoteVolume) and the
                // book ticker (bid/ask); merged by symbol.
                let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
                let body = self.get_json(&url).await?;
                for t in body.as_array().into_iter().flatten() {
                    let sym = self.user_symbol(t["symbol"].as_str().unwrap_or(""));
                    if !wanted.is_empty() && !wanted.contains(&sym) {
                        continue;
                    }
                    res.insert(
                        sym,
                        Ticker {
                            last: Self::json_f64(&t["lastPrice"]),
                            bid: None,
                            ask: None,
                            quote_volume: Self::json_f64(&t["quoteVolume"]),
                        },
                    );
                }
                let url = format!("{}/fapi/v1/ticker/bookTicker", self.base_url);
                if let Ok(body) = self.get_json(&url).await {
                    for t in body.as_array().into_iter().flatten() {
                        let sym = self.user_symbol(t["symbol"].as_str().unwrap_or(""));
                        if let Some(entry) = res.get_mut(&sym) {
                            entry.bid = Self::json_f64(&t["bidPrice"]);
                            entry.ask = Self::json_f64(&t["askPrice"]);
                        }
                    }
                }
            }
            Venue::Bybit => {
                let url = format!("{}/v5/market/tickers?category=linear", self.base_url);
                let body = self.get_json(&url).await?;
                for t in body["result"]["list"].as_array().into_iter().flatten() {
                    let sym = self.user_symbol(t["symbol"].as_str().unwrap_or(""));
                    if !wanted.is_empty() && !wanted.contains(&sym) {
                        continue;
                    }
                    res.insert(
                        sym,
                        Ticker {
                            last: Self::json_f64(&t["lastPrice"]),
                            bid: Self::json_f64(&t["bid1Price"]),
                            ask: Self::json_f64(&t["ask1Price"]),
                            quote_volume: Self::json_f64(&t["turnover24h"]),
                        },
                    );
                }
            }
            Venue::Mexc => {
                let url = format!("{}/api/v1/contract/ticker", self.base_url);
                let body = self.get_json(&url).await?;
                for t in body["data"].as_array().into_iter().flatten() {
                    let sym = self.user_symbol(t["symbol"].as_str().unwrap_or(""));
                    if !wanted.is_empty() && !wanted.contains(&sym) {
                        continue;
                    }
                    res.insert(
                        sym,
                        Ticker {
                            last: Self::json_f64(&t["lastPrice"]),
                            bid: Self::json_f64(&t["bid1"]),
                            ask: Self::json_f64(&t["ask1"]),
                            quote_volume: Self::json_f64(&t["amount24"]),
                        },
                    );
                }
            }
        }
        debug!(venue = %self.venue, count = res.len(), "tickers fetched");
        Ok(res)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let one = [symbol.to_string()];
        let map = self.fetch_tickers(&one).await?;
        map.get(&symbol.to_uppercase())
            .cloned()
            .with_context(|| format!("ticker unavailable for {symbol}"))
    }

    #[instrument(skip(self), name = "exchange::fetch_ohlcv")]
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since_ms: Option<i64>,
    ) -> Result<Vec<Ohlcv>> {
        let sym = self.resolve_symbol(symbol);
        let interval = self.interval_param(timeframe);
        let mut candles: Vec<Ohlcv> = Vec::new();

        match self.venue {
            Venue::Binance => {
                let mut url = format!(
                    "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
                    self.base_url, sym, interval, limit
                );
                if let Some(s) = since_ms {
                    url.push_str(&format!("&startTime={s}"));
                }
                let body = self.get_json(&url).await?;
                for row in body.as_array().into_iter().flatten() {
                    let arr = match row.as_array() {
                        Some(a) if a.len() >= 6 => a,
                        _ => {
                            warn!("skipping malformed kline entry");
                            continue;
                        }
                    };
                    candles.push(Ohlcv {
                        ts_ms: arr[0].as_i64().unwrap_or(0),
                        open: Self::json_f64(&arr[1]).unwrap_or(0.0),
                        high: Self::json_f64(&arr[2]).unwrap_or(0.0),
                        low: Self::json_f64(&arr[3]).unwrap_or(0.0),
                        close: Self::json_f64(&arr[4]).unwrap_or(0.0),
                        volume: Self::json_f64(&arr[5]).unwrap_or(0.0),
                    });
                }
            }
            Venue::Bybit => {
                let mut url = format!(
                    "{}/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
                    self.base_url, sym, interval, limit
                );
                if let Some(s) = since_ms {
                    url.push_str(&format!("&start={s}"));
                }
                let body = self.get_json(&url).await?;
                for row in body["result"]["list"].as_array().into_iter().flatten() {
                    let arr = match row.as_array() {
                        Some(a) if a.len() >= 6 => a,
                        _ => continue,
                    };
                    candles.push(Ohlcv {
                        ts_ms: Self::json_f64(&arr[0]).unwrap_or(0.0) as i64,
                        open: Self::json_f64(&arr[1]).unwrap_or(0.0),
                        high: Self::json_f64(&arr[2]).unwrap_or(0.0),
                        low: Self::json_f64(&arr[3]).unwrap_or(0.0),
                        close: Self::json_f64(&arr[4]).unwrap_or(0.0),
                        volume: Self::json_f64(&arr[5]).unwrap_or(0.0),
                    });
                }
                // Bybit returns newest-first.
                candles.reverse();
            }
            Venue::Mexc => {
                let mut url = format!(
                    "{}/api/v1/contract/kline/{}?interval={}",
                    self.base_url, sym, interval
                );
                if let Some(s) = since_ms {
                    url.push_str(&format!("&start={}", s / 1000));
                }
                let body = self.get_json(&url).await?;
                // Columnar response: parallel arrays under data.
                let d = &body["data"];
                let times = d["time"].as_array().cloned().unwrap_or_default();
                let empty: Vec<serde_json::Value> = Vec::new();
                let opens = d["open"].as_array().unwrap_or(&empty);
                let highs = d["high"].as_array().unwrap_or(&empty);
                let lows = d["low"].as_array().unwrap_or(&empty);
                let closes = d["close"].as_array().unwrap_or(&empty);
                let vols = d["vol"].as_array().unwrap_or(&empty);
                for (i, ts) in times.iter().enumerate() {
                    candles.push(Ohlcv {
                        ts_ms: Self::json_f64(ts).unwrap_or(0.0) as i64 * 1000,
                        open: opens.get(i).and_then(Self::json_f64).unwrap_or(0.0),
                        high: highs.get(i).and_then(Self::json_f64).unwrap_or(0.0),
                        low: lows.get(i).and_then(Self::json_f64).unwrap_or(0.0),
                        close: closes.get(i).and_then(Self::json_f64).unwrap_or(0.0),
                        volume: vols.get(i).and_then(Self::json_f64).unwrap_or(0.0),
                    });
                }
                candles.truncate(limit as usize);
            }
        }
        debug!(venue = %self.venue, symbol, timeframe, count = candles.len(), "ohlcv fetched");
        Ok(candles)
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> f64 {
        let sym = self.resolve_symbol(symbol);
        let rate = match self.venue {
            Venue::Binance => {
                let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, sym);
                self.get_json(&url)
                    .await
                    .ok()
                    .and_then(|b| Self::json_f64(&b["lastFundingRate"]))
            }
            Venue::Bybit => {
                let url = format!(
                    "{}/v5/market/tickers?category=linear&symbol={}",
                    self.base_url, sym
                );
                self.get_json(&url).await.ok().and_then(|b| {
                    b["result"]["list"]
                        .as_array()
                        .and_then(|l| l.first())
                        .and_then(|t| Self::json_f64(&t["fundingRate"]))
                })
            }
            Venue::Mexc => {
                let url = format!("{}/api/v1/contract/funding_rate/{}", self.base_url, sym);
                self.get_json(&url)
                    .await
                    .ok()
                    .and_then(|b| Self::json_f64(&b["data"]["fundingRate"]))
            }
        };
        rate.unwrap_or(0.0)
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Option<f64> {
        let sym = self.resolve_symbol(symbol);
        match self.venue {
            Venue::Binance => {
                let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, sym);
                self.get_json(&url)
                    .await
                    .ok()
                    .and_then(|b| Self::json_f64(&b["openInterest"]))
            }
            Venue::Bybit => {
                let url = format!(
                    "{}/v5/market/open-interest?category=linear&symbol={}&intervalTime=5min&limit=1",
                    self.base_url, sym
                );
                self.get_json(&url).await.ok().and_then(|b| {
                    b["result"]["list"]
                        .as_array()
                        .and_then(|l| l.first())
                        .and_then(|t| Self::json_f64(&t["openInterest"]))
                })
            }
            Venue::Mexc => {
                let url = format!("{}/api/v1/contract/ticker?symbol={}", self.base_url, sym);
                self.get_json(&url)
                    .await
                    .ok()
                    .and_then(|b| Self::json_f64(&b["data"]["holdVol"]))
            }
        }
    }

    #[instrument(skip(self), name = "exchange::fetch_balance")]
    async fn fetch_usdt_balance(&self) -> Result<(f64, f64)> {
        match self.venue {
            Venue::Binance => {
                let qs = self.binance_signed_query("");
                let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);
                let body = self.get_json(&url).await?;
                for b in body.as_array().into_iter().flatten() {
                    if b["asset"].as_str() == Some("USDT") {
                        let equity = Self::json_f64(&b["balance"]).unwrap_or(0.0);
                        let free = Self::json_f64(&b["availableBalance"]).unwrap_or(0.0);
                        return Ok((equity, free));
                    }
                }
                warn!("USDT not found in futures balance — returning zeros");
                Ok((0.0, 0.0))
            }
            Venue::Bybit => {
                let query = "accountType=UNIFIED&coin=USDT";
                let headers = self.bybit_auth_headers(query);
                let url = format!("{}/v5/account/wallet-balance?{}", self.base_url, query);
                let body = self.get_json_with_headers(&url, headers).await?;
                let coin = body["result"]["list"]
                    .as_array()
                    .and_then(|l| l.first())
                    .and_then(|a| a["coin"].as_array())
                    .and_then(|c| c.iter().find(|x| x["coin"].as_str() == Some("USDT")))
                    .cloned()
                    .unwrap_or_default();
                let equity = Self::json_f64(&coin["equity"]).unwrap_or(0.0);
                let free = Self::json_f64(&coin["availableToWithdraw"]).unwrap_or(equity);
                Ok((equity, free))
            }
            Venue::Mexc => {
                let headers = self.mexc_auth_headers("");
                let url = format!("{}/api/v1/private/account/asset/USDT", self.base_url);
                let body = self.get_json_with_headers(&url, headers).await?;
                let equity = Self::json_f64(&body["data"]["equity"]).unwrap_or(0.0);
                let free = Self::json_f64(&body["data"]["availableBalance"]).unwrap_or(0.0);
                Ok((equity, free))
            }
        }
    }

    async fn market_constraints(&self, symbol: &str) -> Result<MarketConstraints> {
        let sym = self.resolve_symbol(symbol);
        let mut mc = MarketConstraints::default();
        match self.venue {
            Venue::Binance => {
                let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, sym);
                let body = self.get_json(&url).await?;
                let info = body["symbols"]
                    .as_array()
                    .and_then(|a| a.first())
                    .cloned()
                    .unwrap_or_default();
                for f in info["filters"].as_array().into_iter().flatten() {
                    match f["filterType"].as_str().unwrap_or("") {
                        "LOT_SIZE" => {
                            mc.min_qty = Self::json_f64(&f["minQty"]);
                            mc.qty_step = Self::json_f64(&f["stepSize"]);
                        }
                        "MIN_NOTIONAL" => {
                            if let Some(n) = Self::json_f64(&f["notional"]) {
                                mc.min_notional_usdt = n;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Venue::Bybit => {
                let url = format!(
                    "{}/v5/market/instruments-info?category=linear&symbol={}",
                    self.base_url, sym
                );
                let body = self.get_json(&url).await?;
                if let Some(info) = body["result"]["list"].as_array().and_then(|l| l.first()) {
                    let lot = &info["lotSizeFilter"];
                    mc.min_qty = Self::json_f64(&lot["minOrderQty"]);
                    mc.qty_step = Self::json_f64(&lot["qtyStep"]);
                    if let Some(n) = Self::json_f64(&lot["minNotionalValue"]) {
                        mc.min_notional_usdt = n;
                    }
                }
            }
            Venue::Mexc => {
                let url = format!("{}/api/v1/contract/detail?symbol={}", self.base_url, sym);
                let body = self.get_json(&url).await?;
                let d = &body["data"];
                mc.min_qty = Self::json_f64(&d["minVol"]);
                mc.qty_step = Self::json_f64(&d["volUnit"]);
            }
        }
        Ok(mc)
    }

    async fn set_oneway_mode(&self, symbol: &str) {
        match self.venue {
            Venue::Binance => {
                self.binance_silent_post("/fapi/v1/positionSide/dual", "dualSidePosition=false")
                    .await;
            }
            Venue::Bybit => {
                let body = serde_json::json!({
                    "category": "linear",
                    "symbol": self.resolve_symbol(symbol),
                    "mode": 0,
                });
                self.bybit_silent_post("/v5/position/switch-mode", body).await;
            }
            // MEXC accounts are one-way per position object; nothing to set.
            Venue::Mexc => {}
        }
    }

    async fn set_isolated_margin(&self, symbol: &str) {
        match self.venue {
            Venue::Binance => {
                let params = format!(
                    "symbol={}&marginType=ISOLATED",
                    self.resolve_symbol(symbol)
                );
                self.binance_silent_post("/fapi/v1/marginType", &params).await;
            }
            Venue::Bybit => {
                let body = serde_json::json!({
                    "category": "linear",
                    "symbol": self.resolve_symbol(symbol),
                    "tradeMode": 1,
                });
                self.bybit_silent_post("/v5/position/switch-isolated", body).await;
            }
            Venue::Mexc => {}
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) {
        if leverage == 0 {
            return;
        }
        match self.venue {
            Venue::Binance => {
                let params = format!(
                    "symbol={}&leverage={}",
                    self.resolve_symbol(symbol),
                    leverage
                );
                self.binance_silent_post("/fapi/v1/leverage", &params).await;
            }
            Venue::Bybit => {
                let body = serde_json::json!({
                    "category": "linear",
                    "symbol": self.resolve_symbol(symbol),
                    "buyLeverage": leverage.to_string(),
                    "sellLeverage": leverage.to_string(),
                });
                self.bybit_silent_post("/v5/position/set-leverage", body).await;
            }
            Venue::Mexc => {
                let body = serde_json::json!({
                    "symbol": self.resolve_symbol(symbol),
                    "leverage": leverage,
                });
                let payload = serde_json::to_string(&body).unwrap_or_default();
                let headers = self.mexc_auth_headers(&payload);
                let url = format!("{}/api/v1/private/position/change_leverage", self.base_url);
                if let Err(e) = self.post_json(&url, headers, Some(&body)).await {
                    debug!(error = %e, "mexc leverage setter ignored");
                }
            }
        }
    }

    #[instrument(skip(self), name = "exchange::place_brackets")]
    async fn place_entry_and_brackets(
        &self,
        symbol: &str,
        direction: Direction,
        qty: f64,
        tp_price: f64,
        sl_price: f64,
        client_order_id: &str,
    ) -> Result<BracketIds> {
        let sym = self.resolve_symbol(symbol);
        let side = direction.entry_side();
        let exit_side = direction.exit_side();
        let mut ids = BracketIds::default();

        match self.venue {
            Venue::Binance => {
                // Entry: market.
                let extra = [(self.client_id_param(), client_order_id.to_string())];
                let entry = self
                    .binance_order(&sym, side, "MARKET", qty, None, &extra)
                    .await?;
                ids.entry_order_id = entry["orderId"].as_i64().map(|v| v.to_string());
                ids.entry_avg_price = Self::json_f64(&entry["avgPrice"]).filter(|p| *p > 0.0);
                ids.entry_timestamp_ms = entry["updateTime"].as_i64();

                // TP: limit reduce-only.
                let tp_extra = [
                    ("reduceOnly", "true".to_string()),
                    (self.client_id_param(), format!("{client_order_id}-TP")),
                ];
                match self
                    .binance_order(&sym, exit_side, "LIMIT", qty, Some(tp_price), &tp_extra)
                    .await
                {
                    Ok(tp) => ids.tp_order_id = tp["orderId"].as_i64().map(|v| v.to_string()),
                    Err(e) => warn!(symbol, error = %e, "TP order failed"),
                }

                // SL: stop-market reduce-only, trying type variants in order.
                for order_type in ["STOP_MARKET", "STOP"] {
                    let sl_extra = [
                        ("reduceOnly", "true".to_string()),
                        ("stopPrice", sl_price.to_string()),
                        (self.client_id_param(), format!("{client_order_id}-SL")),
                    ];
                    match self
                        .binance_order(&sym, exit_side, order_type, qty, None, &sl_extra)
                        .await
                    {
                        Ok(sl) => {
                            ids.sl_order_id = sl["orderId"].as_i64().map(|v| v.to_string());
                            break;
                        }
                        Err(e) => {
                            debug!(symbol, order_type, error = %e, "SL variant rejected");
                        }
                    }
                }
            }
            Venue::Bybit => {
                let bybit_side = if side == "buy" { "Buy" } else { "Sell" };
                let bybit_exit = if exit_side == "buy" { "Buy" } else { "Sell" };

                let entry = self
                    .bybit_order(serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "side": bybit_side,
                        "orderType": "Market",
                        "qty": qty.to_string(),
                        self.client_id_param(): client_order_id,
                    }))
                    .await?;
                ids.entry_order_id = entry["result"]["orderId"].as_str().map(String::from);

                match self
                    .bybit_order(serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "side": bybit_exit,
                        "orderType": "Limit",
                        "qty": qty.to_string(),
                        "price": tp_price.to_string(),
                        "reduceOnly": true,
                        self.client_id_param(): format!("{client_order_id}-TP"),
                    }))
                    .await
                {
                    Ok(tp) => ids.tp_order_id = tp["result"]["orderId"].as_str().map(String::from),
                    Err(e) => warn!(symbol, error = %e, "TP order failed"),
                }

                match self
                    .bybit_order(serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "side": bybit_exit,
                        "orderType": "Market",
                        "qty": qty.to_string(),
                        "reduceOnly": true,
                        "triggerPrice": sl_price.to_string(),
                        "triggerDirection": if direction == Direction::Long { 2 } else { 1 },
                        self.client_id_param(): format!("{client_order_id}-SL"),
                    }))
                    .await
                {
                    Ok(sl) => ids.sl_order_id = sl["result"]["orderId"].as_str().map(String::from),
                    Err(e) => debug!(symbol, error = %e, "SL conditional rejected"),
                }
            }
            Venue::Mexc => {
                // Side codes: 1 open long, 3 open short, 4 close long, 2 close short.
                let open_side = if direction == Direction::Long { 1 } else { 3 };
                let close_side = if direction == Direction::Long { 4 } else { 2 };

                let entry = self
                    .mexc_order(
                        "/api/v1/private/order/submit",
                        serde_json::json!({
                            "symbol": sym,
                            "side": open_side,
                            "type": 5,
                            "openType": 1,
                            "vol": qty,
                            self.client_id_param(): client_order_id,
                        }),
                    )
                    .await?;
                ids.entry_order_id = entry["data"]
                    .as_str()
                    .map(String::from)
                    .or_else(|| entry["data"].as_i64().map(|v| v.to_string()));

                match self
                    .mexc_order(
                        "/api/v1/private/order/submit",
                        serde_json::json!({
                            "symbol": sym,
                            "side": close_side,
                            "type": 1,
                            "openType": 1,
                            "vol": qty,
                            "price": tp_price,
                            self.client_id_param(): format!("{client_order_id}-TP"),
                        }),
                    )
                    .await
                {
                    Ok(tp) => {
                        ids.tp_order_id = tp["data"]
                            .as_str()
                            .map(String::from)
                            .or_else(|| tp["data"].as_i64().map(|v| v.to_string()));
                    }
                    Err(e) => warn!(symbol, error = %e, "TP order failed"),
                }

                match self
                    .mexc_order(
                        "/api/v1/private/planorder/place",
                        serde_json::json!({
                            "symbol": sym,
                            "side": close_side,
                            "orderType": 5,
                            "openType": 1,
                            "vol": qty,
                            "triggerPrice": sl_price,
                            "triggerType": 1,
                            "executeCycle": 1,
                            "trend": if direction == Direction::Long { 2 } else { 1 },
                        }),
                    )
                    .await
                {
                    Ok(sl) => {
                        ids.sl_order_id = sl["data"]
                            .as_str()
                            .map(String::from)
                            .or_else(|| sl["data"].as_i64().map(|v| v.to_string()));
                    }
                    Err(e) => debug!(symbol, error = %e, "SL plan order rejected"),
                }
            }
        }

        if ids.sl_order_id.is_none() {
            warn!(
                symbol,
                "SL order not supported or rejected — monitor must enforce SL by price"
            );
        }
        Ok(ids)
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Option<OrderStatus> {
        if order_id.is_empty() {
            return None;
        }
        let sym = self.resolve_symbol(symbol);
        match self.venue {
            Venue::Binance => {
                let params = format!("symbol={sym}&orderId={order_id}");
                let qs = self.binance_signed_query(&params);
                let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
                let body = self.get_json(&url).await.ok()?;
                Some(OrderStatus {
                    order_id: order_id.to_string(),
                    status: body["status"].as_str().unwrap_or("").to_lowercase(),
                    avg_price: Self::json_f64(&body["avgPrice"]).filter(|p| *p > 0.0),
                })
            }
            Venue::Bybit => {
                let query = format!("category=linear&symbol={sym}&orderId={order_id}");
                let headers = self.bybit_auth_headers(&query);
                let url = format!("{}/v5/order/realtime?{}", self.base_url, query);
                let body = self.get_json_with_headers(&url, headers).await.ok()?;
                let o = body["result"]["list"].as_array()?.first()?.clone();
                Some(OrderStatus {
                    order_id: order_id.to_string(),
                    status: o["orderStatus"].as_str().unwrap_or("").to_lowercase(),
                    avg_price: Self::json_f64(&o["avgPrice"]).filter(|p| *p > 0.0),
                })
            }
            Venue::Mexc => {
                let headers = self.mexc_auth_headers("");
                let url = format!("{}/api/v1/private/order/get/{}", self.base_url, order_id);
                let body = self.get_json_with_headers(&url, headers).await.ok()?;
                let d = &body["data"];
                // MEXC order state 3 = filled, 4 = canceled.
                let state = d["state"].as_i64().unwrap_or(0);
                let status = match state {
                    3 => "filled",
                    4 => "canceled",
                    _ => "new",
                };
                Some(OrderStatus {
                    order_id: order_id.to_string(),
                    status: status.to_string(),
                    avg_price: Self::json_f64(&d["dealAvgPrice"]).filter(|p| *p > 0.0),
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool {
        if order_id.is_empty() {
            return false;
        }
        let sym = self.resolve_symbol(symbol);
        let res = match self.venue {
            Venue::Binance => {
                let params = format!("symbol={sym}&orderId={order_id}");
                let qs = self.binance_signed_query(&params);
                let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
                self.delete_json(&url).await.map(|_| ())
            }
            Venue::Bybit => {
                let body = serde_json::json!({
                    "category": "linear",
                    "symbol": sym,
                    "orderId": order_id,
                });
                let payload = serde_json::to_string(&body).unwrap_or_default();
                let headers = self.bybit_auth_headers(&payload);
                let url = format!("{}/v5/order/cancel", self.base_url);
                self.post_json(&url, headers, Some(&body)).await.map(|_| ())
            }
            Venue::Mexc => {
                let body = serde_json::json!([order_id]);
                let payload = serde_json::to_string(&body).unwrap_or_default();
                let headers = self.mexc_auth_headers(&payload);
                let url = format!("{}/api/v1/private/order/cancel", self.base_url);
                self.post_json(&url, headers, Some(&body)).await.map(|_| ())
            }
        };
        match res {
            Ok(()) => {
                debug!(venue = %self.venue, symbol, order_id, "order cancelled");
                true
            }
            Err(e) => {
                debug!(venue = %self.venue, symbol, order_id, error = %e, "cancel failed");
                false
            }
        }
    }

    async fn fetch_position_qty(&self, symbol: &str) -> f64 {
        let sym = self.resolve_symbol(symbol);
        match self.venue {
            Venue::Binance => {
                let params = format!("symbol={sym}");
                let qs = self.binance_signed_query(&params);
                let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
                let body = match self.get_json(&url).await {
                    Ok(b) => b,
                    Err(_) => return 0.0,
                };
                body.as_array()
                    .and_then(|a| a.first())
                    .and_then(|p| Self::json_f64(&p["positionAmt"]))
                    .unwrap_or(0.0)
            }
            Venue::Bybit => {
                let query = format!("category=linear&symbol={sym}");
                let headers = self.bybit_auth_headers(&query);
                let url = format!("{}/v5/position/list?{}", self.base_url, query);
                let body = match self.get_json_with_headers(&url, headers).await {
                    Ok(b) => b,
                    Err(_) => return 0.0,
                };
                let p = match body["result"]["list"].as_array().and_then(|l| l.first()) {
                    Some(p) => p.clone(),
                    None => return 0.0,
                };
                let size = Self::json_f64(&p["size"]).unwrap_or(0.0);
                if p["side"].as_str() == Some("Sell") {
                    -size.abs()
                } else {
                    size
                }
            }
            Venue::Mexc => {
                let headers = self.mexc_auth_headers("");
                let url = format!(
                    "{}/api/v1/private/position/open_positions?symbol={}",
                    self.base_url, sym
                );
                let body = match self.get_json_with_headers(&url, headers).await {
                    Ok(b) => b,
                    Err(_) => return 0.0,
                };
                let p = match body["data"].as_array().and_then(|l| l.first()) {
                    Some(p) => p.clone(),
                    None => return 0.0,
                };
                let vol = Self::json_f64(&p["holdVol"]).unwrap_or(0.0);
                // positionType 1 = long, 2 = short.
                if p["positionType"].as_i64() == Some(2) {
                    -vol.abs()
                } else {
                    vol
                }
            }
        }
    }
}

impl std::fmt::Debug for UsdtmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsdtmClient")
            .field("venue", &self.venue)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(venue: Venue) -> UsdtmClient {
        UsdtmClient::new(venue, "key", "secret", false, 30_000, false).unwrap()
    }

    #[test]
    fn symbol_resolution_per_venue() {
        assert_eq!(client(Venue::Binance).resolve_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(client(Venue::Bybit).resolve_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(client(Venue::Mexc).resolve_symbol("BTCUSDT"), "BTC_USDT");
        assert_eq!(client(Venue::Mexc).user_symbol("BTC_USDT"), "BTCUSDT");
    }

    #[test]
    fn interval_mapping_per_venue() {
        assert_eq!(client(Venue::Binance).interval_param("5m"), "5m");
        assert_eq!(client(Venue::Bybit).interval_param("5m"), "5");
        assert_eq!(client(Venue::Bybit).interval_param("1h"), "60");
        assert_eq!(client(Venue::Bybit).interval_param("1d"), "D");
        assert_eq!(client(Venue::Mexc).interval_param("5m"), "Min5");
        assert_eq!(client(Venue::Mexc).interval_param("4h"), "Hour4");
    }

    #[test]
    fn client_id_param_per_venue() {
        assert_eq!(client(Venue::Binance).client_id_param(), "newClientOrderId");
        assert_eq!(client(Venue::Bybit).client_id_param(), "orderLinkId");
        assert_eq!(client(Venue::Mexc).client_id_param(), "clientOrderId");
    }

    #[test]
    fn signature_is_stable_hex() {
        let c = client(Venue::Binance);
        let sig = c.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(sig, c.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let c = UsdtmClient::new(Venue::Binance, "AKIA", "S3CRET", false, 30_000, false).unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("AKIA"));
        assert!(!dbg.contains("S3CRET"));
        assert!(dbg.contains("<redacted>"));
    }
}
