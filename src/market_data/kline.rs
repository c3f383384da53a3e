// =============================================================================
// Kline decoding — Binance kline payload -> Tick
// =============================================================================

use serde_json::Value;

use crate::error::CacheError;
use crate::types::{SeriesKey, Tick};

/// Build the single-stream kline endpoint for `key` under `base_url`.
///
/// `base_url` is the raw-stream root, e.g. `wss://stream.binance.com:9443/ws`.
pub fn kline_url(base_url: &str, key: &SeriesKey) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key.stream_name())
}

/// Decode one kline message for the stream subscribed as `expected`.
///
/// Accepts both the single-stream payload and the combined-stream envelope:
/// ```json
/// { "e": "kline", "s": "ETHUSDT", "k": { "t": 1700000000000, "o": "1.0", ... } }
/// { "stream": "ethusdt@kline_1m", "data": { "e": "kline", ... } }
/// ```
/// Symbol and interval inside the payload are optional, but when present they
/// must match `expected`.
pub fn decode_kline(text: &str, expected: &SeriesKey) -> Result<Tick, CacheError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| CacheError::Decode(format!("invalid JSON: {e}")))?;

    let data = root.get("data").unwrap_or(&root);
    let k = data
        .get("k")
        .ok_or_else(|| CacheError::Decode("missing field k".into()))?;

    if let Some(symbol) = k.get("s").or_else(|| data.get("s")).and_then(Value::as_str) {
        if !symbol.eq_ignore_ascii_case(&expected.symbol) {
            return Err(CacheError::Decode(format!(
                "symbol mismatch: expected {}, got {symbol}",
                expected.symbol
            )));
        }
    }
    if let Some(interval) = k.get("i").and_then(Value::as_str) {
        if interval != expected.interval.as_str() {
            return Err(CacheError::Decode(format!(
                "interval mismatch: expected {}, got {interval}",
                expected.interval
            )));
        }
    }

    let open_time = k
        .get("t")
        .and_then(Value::as_i64)
        .ok_or_else(|| CacheError::Decode("missing field k.t".into()))?;

    let open = parse_price(k, "o")?;
    let high = parse_price(k, "h")?;
    let low = parse_price(k, "l")?;
    let close = parse_price(k, "c")?;
    let closed = k.get("x").and_then(Value::as_bool);

    Tick::new(expected.clone(), open_time, open, high, low, close, closed)
}

/// Binance sends prices as JSON strings; numbers are accepted too.
fn parse_price(k: &Value, field: &str) -> Result<f64, CacheError> {
    let v = match k.get(field) {
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|_| CacheError::Decode(format!("k.{field} is not a number: {s}")))?,
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| CacheError::Decode(format!("k.{field} is not a valid f64")))?,
        Some(_) => return Err(CacheError::Decode(format!("k.{field} has unexpected JSON type"))),
        None => return Err(CacheError::Decode(format!("missing field k.{field}"))),
    };

    if !v.is_finite() {
        return Err(CacheError::Decode(format!("k.{field} is not finite")));
    }
    Ok(v)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interval;

    fn eth_1m() -> SeriesKey {
        SeriesKey::new("ethusdt", Interval::M1)
    }

    const SINGLE: &str = r#"{
        "e": "kline",
        "E": 1700000001234,
        "s": "ETHUSDT",
        "k": {
            "t": 1700000000000,
            "T": 1700000059999,
            "s": "ETHUSDT",
            "i": "1m",
            "o": "2000.10",
            "h": "2005.00",
            "l": "1999.50",
            "c": "2003.25",
            "v": "123.456",
            "n": 1500,
            "x": false
        }
    }"#;

    #[test]
    fn decodes_single_stream_payload() {
        let tick = decode_kline(SINGLE, &eth_1m()).expect("should decode");
        assert_eq!(tick.key, eth_1m());
        assert_eq!(tick.timestamp, 1_700_000_000_000);
        assert!((tick.open - 2000.10).abs() < 1e-9);
        assert!((tick.close - 2003.25).abs() < 1e-9);
        assert_eq!(tick.closed, Some(false));
    }

    #[test]
    fn decodes_combined_envelope_with_numeric_prices() {
        let json = r#"{
            "stream": "ethusdt@kline_1m",
            "data": { "e": "kline", "s": "ETHUSDT",
                      "k": { "t": 60000, "i": "1m", "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "x": true } }
        }"#;
        let tick = decode_kline(json, &eth_1m()).unwrap();
        assert_eq!(tick.timestamp, 60_000);
        assert!(tick.is_final());
    }

    #[test]
    fn missing_close_flag_is_none() {
        let json = r#"{ "k": { "t": 1, "o": "1", "h": "1", "l": "1", "c": "1" } }"#;
        let tick = decode_kline(json, &eth_1m()).unwrap();
        assert_eq!(tick.closed, None);
    }

    #[test]
    fn rejects_missing_fields() {
        let no_close = r#"{ "k": { "t": 1, "o": "1", "h": "1", "l": "1" } }"#;
        assert!(matches!(decode_kline(no_close, &eth_1m()), Err(CacheError::Decode(_))));

        let no_time = r#"{ "k": { "o": "1", "h": "1", "l": "1", "c": "1" } }"#;
        assert!(decode_kline(no_time, &eth_1m()).is_err());

        let ack = r#"{ "result": null, "id": 1 }"#;
        assert!(decode_kline(ack, &eth_1m()).is_err());

        assert!(decode_kline("not json", &eth_1m()).is_err());
    }

    #[test]
    fn rejects_non_finite_and_bad_bounds() {
        let nan = r#"{ "k": { "t": 1, "o": "NaN", "h": "1", "l": "1", "c": "1" } }"#;
        assert!(decode_kline(nan, &eth_1m()).is_err());

        let inverted = r#"{ "k": { "t": 1, "o": "1", "h": "0.5", "l": "2", "c": "1" } }"#;
        assert!(decode_kline(inverted, &eth_1m()).is_err());
    }

    #[test]
    fn rejects_other_streams() {
        let btc = SINGLE.replace("ETHUSDT", "BTCUSDT");
        assert!(decode_kline(&btc, &eth_1m()).is_err());

        let five = SeriesKey::new("ethusdt", Interval::M5);
        assert!(decode_kline(SINGLE, &five).is_err());
    }

    #[test]
    fn url_uses_stream_name() {
        let url = kline_url("wss://stream.binance.com:9443/ws/", &eth_1m());
        assert_eq!(url, "wss://stream.binance.com:9443/ws/ethusdt@kline_1m");
    }
}
