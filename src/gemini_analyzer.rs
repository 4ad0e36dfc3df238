use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::config::{
    DAILY_LOSS_LIMIT_PCT, DECISION_MAX_ATTEMPTS, DECISION_MAX_TOKENS, DECISION_TEMPERATURE,
    FIXED_RISK_AMOUNT, MAX_DRAWDOWN_PCT, MAX_TRADES_PER_DAY, MIN_RR_RATIO,
};
use crate::data_collector::MarketSnapshot;
use crate::types::{Decision, Side, TradeSignal};

// ── Error types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("empty response")]
    EmptyResponse,
    #[error("no JSON object in response: {0}")]
    Unparseable(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid action '{0}'")]
    InvalidAction(String),
    #[error("invalid trade: {0}")]
    InvalidTrade(String),
}

impl DecisionError {
    /// An unknown action is a model answer, not a transport hiccup.
    fn is_retryable(&self) -> bool {
        !matches!(self, DecisionError::InvalidAction(_))
    }
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, snapshot: &MarketSnapshot) -> Result<Decision, DecisionError>;
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct GeminiAnalyzer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_attempts: u32,
}

impl GeminiAnalyzer {
    pub fn new(api_key: String, model: String, base_url: &str) -> Result<Self, DecisionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DecisionError::Http(format!("HTTP client build failed: {}", e)))?;
        Ok(GeminiAnalyzer {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model,
            max_attempts: DECISION_MAX_ATTEMPTS,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, DecisionError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": DECISION_TEMPERATURE,
            "max_tokens": DECISION_MAX_TOKENS,
        });

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DecisionError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| DecisionError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(DecisionError::Http(format!("HTTP {}: {}", status, truncate(&text, 300))));
        }

        let v: Value = serde_json::from_str(&text)
            .map_err(|e| DecisionError::Http(format!("bad response body: {}", e)))?;
        match v["choices"][0]["message"]["content"].as_str() {
            Some(c) if !c.trim().is_empty() => Ok(c.to_string()),
            _ => Err(DecisionError::EmptyResponse),
        }
    }

    async fn attempt(&self, snapshot: &MarketSnapshot, user: &str) -> Result<Decision, DecisionError> {
        let content = self.complete(&system_prompt(), user).await?;
        let obj = extract_json(&content)
            .ok_or_else(|| DecisionError::Unparseable(truncate(&content, 300)))?;
        parse_decision(&snapshot.symbol, &obj)
    }
}

#[async_trait]
impl DecisionProvider for GeminiAnalyzer {
    async fn decide(&self, snapshot: &MarketSnapshot) -> Result<Decision, DecisionError> {
        log::info!("Calling {} for {} analysis...", self.model, snapshot.symbol);
        let user = user_prompt(snapshot);

        let mut attempt = 1;
        loop {
            match self.attempt(snapshot, &user).await {
                Ok(decision) => {
                    log_decision(&decision);
                    return Ok(decision);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    log::warn!("Decision attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("Decision failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

fn log_decision(decision: &Decision) {
    match decision {
        Decision::Hold { confidence, reasoning } => {
            log::info!("Decision: HOLD | confidence={}/10 | {}", confidence, truncate(reasoning, 100));
        }
        Decision::Trade(s) => log::info!(
            "Decision: {} {} | confidence={}/10 | entry={} SL={} TP1={} TP2={} RR={} | {}",
            s.side,
            s.symbol,
            s.confidence,
            s.entry_price,
            s.stop_loss,
            s.take_profit_1,
            s.take_profit_2,
            s.risk_reward_ratio,
            truncate(&s.reasoning, 100)
        ),
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── Prompts ───────────────────────────────────────────────────────────────────

pub fn system_prompt() -> String {
    format!(
        r#"You are a professional crypto futures trader running a ${account:.0} funded account.
Weigh macro context, trend structure, momentum and positioning together. Return ONLY a JSON trading decision.

ACCOUNT RULES:
- Risk per trade: ${risk:.0} | Daily loss limit: {daily:.2}% | Max drawdown: {dd:.1}%
- Minimum R:R {rr}:1 | Max {trades} trades per day

ANALYSIS FRAMEWORK:
1. Macro: BTC leads. Bearish BTC (negative 24h, low in range) biases SHORT, bullish BTC biases LONG.
2. Trend: EMA50/EMA200 alignment on daily and 4h. ADX > 25 trending, ADX < 20 ranging.
3. Positioning: more than 65% of accounts on one side is a contrarian signal. Rising positive funding means crowded longs.
4. VWAP: price above VWAP favours buyers, price stretched 1% or more above it is a poor long entry.
5. CVD: rising CVD confirms buying. CVD falling while price rises is a bearish divergence.
6. Levels: daily pivots (PP, R1-R3, S1-S3) are reaction zones.
7. Timing: 1h pullback in trend direction, 15m MACD histogram turning, volume ratio above 1.2.

CONFIDENCE SCALE:
- 1-6: no setup, partial setup or conflicting signals. Use HOLD.
- 7: three or four confluences aligned.
- 8: five or more confluences.
- 9: everything aligned plus an extreme contrarian positioning signal.
- 10: textbook, almost never happens.

STOP LOSS: beyond the nearest structure (swing, pivot) plus a 0.1-0.2 ATR buffer.
TAKE PROFIT: use the pre-calculated candidates in tp_levels. TP1 is the nearest level with R:R >= {rr}, TP2 the next one. Never closer than 1 ATR from entry.

RESPOND WITH ONLY THIS JSON, reasoning under 60 words:
{{"confidence":7,"action":"SELL","entry_price":170.50,"stop_loss":172.00,"take_profit_1":167.00,"take_profit_2":164.00,"risk_reward_ratio":2.3,"reasoning":"short reason"}}
Allowed actions: BUY, SELL, HOLD."#,
        account = crate::config::ACCOUNT_SIZE,
        risk = FIXED_RISK_AMOUNT,
        daily = DAILY_LOSS_LIMIT_PCT * 100.0,
        dd = MAX_DRAWDOWN_PCT * 100.0,
        rr = MIN_RR_RATIO,
        trades = MAX_TRADES_PER_DAY,
    )
}

pub fn user_prompt(snapshot: &MarketSnapshot) -> String {
    format!(
        "=== {} ANALYSIS ===\n\
         Market snapshot. Sections with status \"unavailable\" could not be fetched this cycle.\n\n\
         {}\n\n\
         Pick take_profit_1 and take_profit_2 from tp_levels.\n\
         Respond with ONLY the JSON object. No markdown, no explanation outside JSON.",
        snapshot.symbol,
        snapshot.to_prompt_json()
    )
}

// ── Response parsing ──────────────────────────────────────────────────────────

fn action_object_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{[^{}]*"action"\s*:\s*"[^"]*"[^{}]*\}"#).ok())
        .as_ref()
}

fn complete_pair_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(\w+)"\s*:\s*(?:"(?:[^"\\]|\\.)*"|-?[\d.]+(?:[eE][+-]?\d+)?|null|true|false)"#).ok()
    })
    .as_ref()
}

fn strip_fences(content: &str) -> &str {
    let inner = if let Some((_, rest)) = content.split_once("```json") {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some((_, rest)) = content.split_once("```") {
        rest.split("```").next().unwrap_or(rest)
    } else {
        content
    };
    inner.trim()
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(m)) => Some(m),
        _ => None,
    }
}

/// Recovers a JSON object from a model reply: direct parse, then the first
/// flat object carrying `action`, then a rebuild from the complete key/value
/// pairs before a truncation point.
pub fn extract_json(content: &str) -> Option<Map<String, Value>> {
    let cleaned = strip_fences(content);

    if let Some(m) = parse_object(cleaned) {
        return Some(m);
    }

    if let Some(m) = action_object_re()
        .and_then(|re| re.find(content))
        .and_then(|found| parse_object(found.as_str()))
    {
        return Some(m);
    }

    let pair_re = complete_pair_re()?;
    for candidate in [cleaned, content] {
        let Some(start) = candidate.find('{') else { continue };
        let text = &candidate[start..];
        // A pair cut off mid-number still matches; only trust pairs that a
        // separator or closing brace follows.
        let Some(last) = pair_re
            .find_iter(text)
            .filter(|m| text[m.end()..].trim_start().starts_with([',', '}']))
            .last()
        else {
            continue;
        };
        let rebuilt = format!("{}}}", text[..last.end()].trim_end().trim_end_matches(','));
        if let Some(m) = parse_object(&rebuilt) {
            if m.contains_key("action") {
                return Some(m);
            }
        }
    }
    None
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_price(obj: &Map<String, Value>, key: &'static str) -> Result<f64, DecisionError> {
    match number(obj, key) {
        Some(p) if p > 0.0 && p.is_finite() => Ok(p),
        Some(p) => Err(DecisionError::InvalidTrade(format!("{} must be positive, got {}", key, p))),
        None => Err(DecisionError::InvalidTrade(format!("{} missing", key))),
    }
}

/// Turns an extracted payload into a [`Decision`].
pub fn parse_decision(symbol: &str, obj: &Map<String, Value>) -> Result<Decision, DecisionError> {
    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .ok_or(DecisionError::MissingField("action"))?
        .trim()
        .to_uppercase();
    let raw_confidence = number(obj, "confidence").ok_or(DecisionError::MissingField("confidence"))?;
    if !(0.0..=10.0).contains(&raw_confidence) {
        return Err(DecisionError::InvalidTrade(format!(
            "confidence {} outside 0-10",
            raw_confidence
        )));
    }
    // Truncated, so a fractional score never rounds up past the minimum.
    let confidence = raw_confidence.floor() as u8;
    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("No reasoning provided")
        .to_string();

    let side = match action.as_str() {
        "HOLD" => return Ok(Decision::Hold { confidence, reasoning }),
        "BUY" => Side::Long,
        "SELL" => Side::Short,
        _ => return Err(DecisionError::InvalidAction(action)),
    };

    if confidence < 1 {
        return Err(DecisionError::InvalidTrade("trade with confidence 0".into()));
    }

    Ok(Decision::Trade(TradeSignal {
        symbol: symbol.to_string(),
        side,
        confidence,
        entry_price: required_price(obj, "entry_price")?,
        stop_loss: required_price(obj, "stop_loss")?,
        take_profit_1: required_price(obj, "take_profit_1")?,
        take_profit_2: number(obj, "take_profit_2").filter(|v| *v > 0.0).unwrap_or(0.0),
        risk_reward_ratio: number(obj, "risk_reward_ratio").filter(|v| *v > 0.0).unwrap_or(0.0),
        reasoning,
        atr: 0.0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::RiskLimits;
    use crate::data_collector::Availability;
    use crate::risk_validator::RiskValidator;

    const FULL: &str = r#"{"confidence":8,"action":"BUY","entry_price":170.5,"stop_loss":168.0,"take_profit_1":175.0,"take_profit_2":180.0,"risk_reward_ratio":1.8,"reasoning":"trend + vwap"}"#;

    fn obj(text: &str) -> Map<String, Value> {
        parse_object(text).unwrap()
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "SOLUSDT".into(),
            indicators: BTreeMap::new(),
            pivot_points: Availability::Unavailable,
            tp_levels: Availability::Unavailable,
            orderbook: Availability::Unavailable,
            funding_rate: Availability::Available(0.0001),
            funding_history: Availability::Unavailable,
            ticker: Availability::Unavailable,
            long_short_ratio: Availability::Unavailable,
            btc_context: Availability::Unavailable,
            fear_greed: Availability::Unavailable,
        }
    }

    #[test]
    fn extract_direct_and_fenced() {
        assert_eq!(extract_json(FULL).unwrap()["action"], "BUY");
        let fenced = format!("Here you go:\n```json\n{}\n```\n", FULL);
        assert_eq!(extract_json(&fenced).unwrap()["confidence"], 8);
        let bare_fence = format!("```\n{}\n```", FULL);
        assert!(extract_json(&bare_fence).is_some());
    }

    #[test]
    fn extract_embedded_object() {
        let text = format!("My analysis says {} and that is final.", FULL);
        let m = extract_json(&text).unwrap();
        assert_eq!(m["take_profit_1"], 175.0);
    }

    #[test]
    fn extract_truncated_reply() {
        let text = r#"{"confidence":7,"action":"SELL","entry_price":170.5,"stop_loss":172.0,"take_profit_1":167.0,"reasoning":"crowded lo"#;
        let m = extract_json(text).unwrap();
        assert_eq!(m["action"], "SELL");
        assert_eq!(m["take_profit_1"], 167.0);
        assert!(!m.contains_key("reasoning"));

        let cut_number = r#"{"action":"BUY","confidence":8,"entry_price":170.5,"stop_loss":16"#;
        let m = extract_json(cut_number).unwrap();
        assert!(!m.contains_key("stop_loss"));
        assert_eq!(m["entry_price"], 170.5);
    }

    #[test]
    fn extract_garbage() {
        assert!(extract_json("I cannot help with that").is_none());
        // Truncated before the action key: nothing usable.
        assert!(extract_json(r#"{"confidence":7,"entry_pr"#).is_none());
    }

    #[test]
    fn parse_trade() {
        let d = parse_decision("SOLUSDT", &obj(FULL)).unwrap();
        match d {
            Decision::Trade(s) => {
                assert_eq!(s.symbol, "SOLUSDT");
                assert_eq!(s.side, Side::Long);
                assert_eq!(s.confidence, 8);
                assert_eq!(s.stop_loss, 168.0);
                assert_eq!(s.take_profit_2, 180.0);
                assert_eq!(s.reasoning, "trend + vwap");
                assert_eq!(s.atr, 0.0);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn parse_hold_and_lowercase_action() {
        let d = parse_decision("SOLUSDT", &obj(r#"{"action":"hold","confidence":4}"#)).unwrap();
        assert_eq!(
            d,
            Decision::Hold { confidence: 4, reasoning: "No reasoning provided".into() }
        );
    }

    #[test]
    fn parse_optional_fields_default() {
        let text = r#"{"action":"SELL","confidence":"7","entry_price":"170","stop_loss":172,"take_profit_1":166}"#;
        match parse_decision("SOLUSDT", &obj(text)).unwrap() {
            Decision::Trade(s) => {
                assert_eq!(s.side, Side::Short);
                assert_eq!(s.entry_price, 170.0);
                assert_eq!(s.take_profit_2, 0.0);
                assert_eq!(s.risk_reward_ratio, 0.0);
                assert_eq!(s.effective_rr(), 2.0);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn fractional_confidence_never_rounds_up_past_the_minimum() {
        let risk = RiskValidator::new(RiskLimits::HARDCODED);
        let confidence_of = |raw: &str| {
            let text = FULL.replace(r#""confidence":8"#, &format!(r#""confidence":{}"#, raw));
            match parse_decision("SOLUSDT", &obj(&text)).unwrap() {
                Decision::Trade(s) => s,
                other => panic!("expected trade, got {:?}", other),
            }
        };

        for raw in ["6.5", "6.99"] {
            let s = confidence_of(raw);
            assert_eq!(s.confidence, 6);
            assert!(risk.check_confidence(&s).is_err(), "confidence {} passed the gate", raw);
        }
        let s = confidence_of("7.0");
        assert_eq!(s.confidence, 7);
        assert!(risk.check_confidence(&s).is_ok());
    }

    #[test]
    fn missing_action_or_confidence_is_an_error() {
        assert_eq!(
            parse_decision("SOLUSDT", &obj(r#"{"confidence":9}"#)),
            Err(DecisionError::MissingField("action"))
        );
        assert_eq!(
            parse_decision("SOLUSDT", &obj(r#"{"action":"HOLD"}"#)),
            Err(DecisionError::MissingField("confidence"))
        );
    }

    #[test]
    fn invalid_action_and_trade() {
        assert_eq!(
            parse_decision("SOLUSDT", &obj(r#"{"action":"CLOSE","confidence":8}"#)),
            Err(DecisionError::InvalidAction("CLOSE".into()))
        );
        let no_sl = r#"{"action":"BUY","confidence":8,"entry_price":170,"take_profit_1":175}"#;
        assert!(matches!(
            parse_decision("SOLUSDT", &obj(no_sl)),
            Err(DecisionError::InvalidTrade(_))
        ));
        let zero_tp = r#"{"action":"BUY","confidence":8,"entry_price":170,"stop_loss":168,"take_profit_1":0}"#;
        assert!(matches!(
            parse_decision("SOLUSDT", &obj(zero_tp)),
            Err(DecisionError::InvalidTrade(_))
        ));
        assert!(matches!(
            parse_decision("SOLUSDT", &obj(r#"{"action":"HOLD","confidence":42}"#)),
            Err(DecisionError::InvalidTrade(_))
        ));
    }

    #[test]
    fn prompts_carry_snapshot_and_rules() {
        let system = system_prompt();
        assert!(system.contains("\"action\":\"SELL\""));
        assert!(system.contains("Max 2 trades per day"));
        let user = user_prompt(&snapshot());
        assert!(user.contains("SOLUSDT ANALYSIS"));
        assert!(user.contains("\"status\": \"unavailable\""));
    }

    // ── Scripted chat-completions endpoint ────────────────────────────────────

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    /// Serves one reply per connection; the last reply repeats.
    async fn serve(replies: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let i = counter.fetch_add(1, Ordering::SeqCst);
                let content = replies[i.min(replies.len() - 1)].clone();
                read_request(&mut stream).await;
                let body = json!({ "choices": [{ "message": { "content": content } }] }).to_string();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(resp.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        (format!("http://{}/v1/", addr), hits)
    }

    #[tokio::test]
    async fn decide_retries_until_parseable() {
        let (url, hits) = serve(vec!["sorry".into(), r#"{"confidence":6}"#.into(), FULL.into()]).await;
        let analyzer = GeminiAnalyzer::new("key".into(), "test-model".into(), &url).unwrap();
        let d = analyzer.decide(&snapshot()).await.unwrap();
        assert!(matches!(d, Decision::Trade(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn decide_gives_up_after_bounded_attempts() {
        let (url, hits) = serve(vec!["no json here".into()]).await;
        let analyzer = GeminiAnalyzer::new("key".into(), "test-model".into(), &url).unwrap();
        let err = analyzer.decide(&snapshot()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Unparseable(_)));
        assert_eq!(hits.load(Ordering::SeqCst), DECISION_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn invalid_action_is_not_retried() {
        let (url, hits) = serve(vec![r#"{"action":"PANIC","confidence":9}"#.into()]).await;
        let analyzer = GeminiAnalyzer::new("key".into(), "test-model".into(), &url).unwrap();
        let err = analyzer.decide(&snapshot()).await.unwrap_err();
        assert_eq!(err, DecisionError::InvalidAction("PANIC".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
