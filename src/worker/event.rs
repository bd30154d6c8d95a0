//! Event worker: scan new blocks for contract logs matching an event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha3::{Digest, Keccak256};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{Monitor, PollOutcome, TriggerNotification, WorkerContext, record_check};
use crate::error::{Error, Result};
use crate::model::{EventSpec, TriggerDetail};
use crate::retry::RetryPolicy;

/// `eth_getLogs` filter for one block range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogFilter {
    pub address: String,
    pub topic0: String,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>>;
}

/// Minimal Ethereum JSON-RPC client over reqwest.
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
            retry,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let cancel = tokio_util::sync::CancellationToken::new();
        self.retry
            .execute(&cancel, || async {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": self.next_id.fetch_add(1, Ordering::Relaxed),
                    "method": method,
                    "params": params,
                });
                let resp: RpcResponse<T> = self
                    .http
                    .post(&self.url)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                if let Some(err) = resp.error {
                    return Err(Error::Rpc(format!("{method}: {} ({})", err.message, err.code)));
                }
                resp.result
                    .ok_or_else(|| Error::Rpc(format!("{method}: empty result")))
            })
            .await
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn block_number(&self) -> Result<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        self.call(
            "eth_getLogs",
            json!([{
                "fromBlock": format!("0x{:x}", filter.from_block),
                "toBlock": format!("0x{:x}", filter.to_block),
                "address": filter.address,
                "topics": [filter.topic0],
            }]),
        )
        .await
    }
}

pub fn parse_hex_u64(hex: &str) -> Result<u64> {
    let digits = hex.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16).map_err(|_| Error::Rpc(format!("bad hex quantity: {hex}")))
}

/// keccak256 of an event signature, as a `0x`-prefixed topic.
pub fn event_topic(signature: &str) -> String {
    let compact: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
    let digest = Keccak256::digest(compact.as_bytes());
    let mut out = String::with_capacity(66);
    out.push_str("0x");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decimal rendering of a hex word, for comparing indexed integers.
fn hex_to_decimal(hex: &str) -> Option<String> {
    let digits = hex.trim_start_matches("0x");
    // Little-endian base-10 digits.
    let mut dec: Vec<u8> = vec![0];
    for c in digits.chars() {
        let mut carry = c.to_digit(16)?;
        for d in dec.iter_mut() {
            let v = u32::from(*d) * 16 + carry;
            *d = (v % 10) as u8;
            carry = v / 10;
        }
        while carry > 0 {
            dec.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    while dec.len() > 1 && dec.last() == Some(&0) {
        dec.pop();
    }
    Some(dec.iter().rev().map(|d| char::from(b'0' + d)).collect())
}

fn is_hex_address(value: &str) -> bool {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    digits.len() == 40 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Fuzzy match of a filter value against a log's indexed topics and data.
///
/// Topic 0 (the event signature) is never matched.
pub fn log_matches_filter(log: &RpcLog, filter_value: &str) -> bool {
    let needle = filter_value.to_lowercase();
    for topic in log.topics.iter().skip(1) {
        let topic = topic.to_lowercase();
        if topic.contains(&needle) {
            return true;
        }
        if hex_to_decimal(&topic).as_deref() == Some(filter_value) {
            return true;
        }
    }

    let data = log.data.trim_start_matches("0x").to_lowercase();
    if data.contains(&needle) {
        return true;
    }

    if is_hex_address(filter_value) {
        let padded = format!("0x{:0>64}", needle.trim_start_matches("0x"));
        if log.topics.iter().skip(1).any(|t| t.to_lowercase() == padded) {
            return true;
        }
    }
    false
}

pub struct EventMonitor {
    spec: EventSpec,
    topic0: String,
    client: Arc<dyn ChainClient>,
    max_block_range: u64,
    interval: Interval,
}

impl EventMonitor {
    pub fn new(
        spec: EventSpec,
        client: Arc<dyn ChainClient>,
        poll_interval: Duration,
        max_block_range: u64,
    ) -> Self {
        let topic0 = event_topic(&spec.trigger_event);
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            spec,
            topic0,
            client,
            max_block_range: max_block_range.max(1),
            interval,
        }
    }

    async fn logs_between(&self, from: u64, to: u64) -> Result<Vec<RpcLog>> {
        let mut logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = (start + self.max_block_range - 1).min(to);
            let filter = LogFilter {
                address: self.spec.trigger_contract_address.clone(),
                topic0: self.topic0.clone(),
                from_block: start,
                to_block: end,
            };
            logs.extend(self.client.get_logs(&filter).await?);
            start = end + 1;
        }
        Ok(logs)
    }
}

#[async_trait]
impl Monitor for EventMonitor {
    fn source(&self) -> &'static str {
        "event"
    }

    async fn wait(&mut self, _ctx: &WorkerContext) -> Result<()> {
        self.interval.tick().await;
        Ok(())
    }

    async fn check(&mut self, ctx: &WorkerContext) -> Result<PollOutcome> {
        let head = self.client.block_number().await?;
        let last_block = ctx.state.read().await.last_block;

        let Some(last) = last_block else {
            // Only events after the worker started count.
            ctx.state.write().await.last_block = Some(head);
            info!(job_id = %ctx.job.job_id, head, "event worker starting at head");
            return Ok(PollOutcome::Continue);
        };
        if head <= last {
            return Ok(PollOutcome::Continue);
        }

        let logs = self.logs_between(last + 1, head).await?;
        {
            let mut state = ctx.state.write().await;
            state.last_block = Some(head);
            state.last_check = Some(Utc::now());
        }
        debug!(job_id = %ctx.job.job_id, from = last + 1, to = head, found = logs.len(), "scanned blocks");

        let filter = self
            .spec
            .event_filter_parameter_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .and(self.spec.filter_value());

        let mut outcome = PollOutcome::Continue;
        let mut matched = false;
        for log in &logs {
            if let Some(value) = filter {
                if !log_matches_filter(log, value) {
                    debug!(job_id = %ctx.job.job_id, tx = %log.transaction_hash, "event filtered out");
                    continue;
                }
            }
            matched = true;
            outcome = ctx
                .fire(TriggerNotification {
                    job_id: ctx.job.job_id,
                    triggered_at: Utc::now(),
                    detail: TriggerDetail::Event {
                        tx_hash: log.transaction_hash.clone(),
                        chain_id: self.spec.trigger_chain_id.clone(),
                        contract_address: self.spec.trigger_contract_address.clone(),
                        event_name: self.spec.trigger_event.clone(),
                    },
                })
                .await;
            if outcome == PollOutcome::SatisfiedStop {
                break;
            }
        }
        record_check("event", matched);
        if !matched {
            ctx.record_unsatisfied().await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(topics: &[&str], data: &str) -> RpcLog {
        RpcLog {
            transaction_hash: "0xabc".into(),
            block_number: Some("0x10".into()),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: data.into(),
        }
    }

    #[test]
    fn transfer_topic_is_keccak_of_signature() {
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn hex_words_render_as_decimal() {
        assert_eq!(hex_to_decimal("0x00ff").as_deref(), Some("255"));
        assert_eq!(hex_to_decimal("0x0").as_deref(), Some("0"));
        assert_eq!(
            hex_to_decimal("0xffffffffffffffffffff").as_deref(),
            Some("1208925819614629174706175")
        );
        assert_eq!(hex_to_decimal("0xzz"), None);
    }

    #[test]
    fn filter_skips_signature_topic() {
        let sig = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
        let l = log(&[sig], "0x");
        assert!(!log_matches_filter(&l, "ddf252"));
    }

    #[test]
    fn filter_matches_indexed_integer_and_data() {
        let topic = format!("0x{:0>64}", "2a");
        let l = log(&["0xsig", &topic], "0x00000000000000000000000000000000000000000000000000000000deadbeef");
        assert!(log_matches_filter(&l, "42"));
        assert!(log_matches_filter(&l, "DEADBEEF"));
        assert!(!log_matches_filter(&l, "43"));
    }

    #[test]
    fn filter_matches_padded_address() {
        let addr = "0x49a81A591afdDEF973e6e49aaEa7d76943ef234C";
        let topic = "0x00000000000000000000000049a81a591afddef973e6e49aaea7d76943ef234c";
        assert!(log_matches_filter(&log(&["0xsig", topic], "0x"), addr));
        assert!(!log_matches_filter(
            &log(&["0xsig", topic], "0x"),
            "0x0000000000000000000000000000000000000001"
        ));
    }

    #[test]
    fn hex_quantities_parse() {
        assert_eq!(parse_hex_u64("0x1b4").unwrap(), 436);
        assert!(parse_hex_u64("nope").is_err());
    }
}
