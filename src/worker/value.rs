//! Numeric value extraction from value-source responses.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Object fields tried in order when no key route is given.
const WELL_KNOWN_FIELDS: [&str; 6] = ["value", "price", "usd", "rate", "result", "data"];

/// Pull a number out of a JSON response body.
///
/// Tried in order: the key route, the first non-zero well-known field, a
/// bare JSON number, a JSON string holding a float.
pub fn extract_value(body: &str, key_route: Option<&str>) -> Result<f64> {
    let unparseable = || Error::UnparseableValue(truncate(body, 200));
    let json: Value = serde_json::from_str(body.trim()).map_err(|_| unparseable())?;

    if let Some(route) = key_route.map(str::trim).filter(|r| !r.is_empty()) {
        if let Some(v) = value_at_route(&json, route) {
            return Ok(v);
        }
        debug!(route, "key route did not resolve, falling back");
    }

    match &json {
        Value::Object(map) => WELL_KNOWN_FIELDS
            .iter()
            .filter_map(|field| map.get(*field).and_then(Value::as_f64))
            .find(|v| *v != 0.0)
            .ok_or_else(unparseable),
        Value::Number(n) => n.as_f64().ok_or_else(unparseable),
        Value::String(s) => s.trim().parse().map_err(|_| unparseable()),
        _ => Err(unparseable()),
    }
}

/// Follow a dot path such as `data.0.price`; numeric segments index arrays.
/// The leaf may be a number or a numeric string.
pub fn value_at_route(json: &Value, route: &str) -> Option<f64> {
    let mut current = json;
    for segment in route.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

/// HTTP client for `api` and `oracle` value sources.
#[derive(Clone)]
pub struct ValueFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ValueFetcher {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, retry })
    }

    /// GET `url` with transport retry and extract a number from the body.
    pub async fn fetch(
        &self,
        url: &str,
        key_route: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        let body = self
            .retry
            .execute(cancel, || async {
                let resp = self.client.get(url).send().await?.error_for_status()?;
                Ok(resp.text().await?)
            })
            .await?;
        extract_value(&body, key_route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_route_wins() {
        let body = r#"{"value": 1, "market": {"quotes": [{"usd": "42.5"}]}}"#;
        assert_eq!(extract_value(body, Some("market.quotes.0.usd")).unwrap(), 42.5);
    }

    #[test]
    fn bad_route_falls_back_to_well_known_fields() {
        let body = r#"{"price": 3.25}"#;
        assert_eq!(extract_value(body, Some("nope.x")).unwrap(), 3.25);
    }

    #[test]
    fn first_non_zero_well_known_field() {
        let body = r#"{"value": 0, "price": 0, "usd": 1800.5, "rate": 2}"#;
        assert_eq!(extract_value(body, None).unwrap(), 1800.5);
    }

    #[test]
    fn bare_number_and_numeric_string() {
        assert_eq!(extract_value("150", None).unwrap(), 150.0);
        assert_eq!(extract_value(r#""99.5""#, None).unwrap(), 99.5);
    }

    #[test]
    fn unrecognized_shapes_fail() {
        assert!(matches!(
            extract_value(r#"{"temperature": 20}"#, None),
            Err(Error::UnparseableValue(_))
        ));
        assert!(matches!(extract_value("[1,2]", None), Err(Error::UnparseableValue(_))));
        assert!(matches!(extract_value("<html>", None), Err(Error::UnparseableValue(_))));
        assert!(matches!(
            extract_value(r#""not a number""#, None),
            Err(Error::UnparseableValue(_))
        ));
    }

    #[test]
    fn route_indexes_arrays() {
        let json: Value = serde_json::from_str(r#"{"data": [{"v": 1}, {"v": 2}]}"#).unwrap();
        assert_eq!(value_at_route(&json, "data.1.v"), Some(2.0));
        assert_eq!(value_at_route(&json, "data.5.v"), None);
        assert_eq!(value_at_route(&json, "data.x"), None);
    }
}
