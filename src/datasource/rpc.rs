//! Ethereum JSON-RPC client implementing both chain-access traits.
//!
//! Each call is a single attempt; errors are classified through
//! [`DataSourceError::is_transient`] and retried by the sync layer.

use super::{ChainReader, DataSourceError, LogFilter, LogSource};
use crate::domain::primitives::{address_to_word, word_to_address};
use crate::domain::{Address, RawEventRecord, B256, U256};
use crate::engine::decoder::topics;
use alloy_primitives::keccak256;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Getters tried, in order, to learn the revision behind an `Upgraded` log.
const REVISION_GETTERS: [&str; 3] = [
    "ATOKEN_REVISION()",
    "DEBT_TOKEN_REVISION()",
    "POOL_REVISION()",
];

#[derive(Debug)]
pub struct JsonRpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, DataSourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DataSourceError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == 429 {
            return Err(DataSourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(DataSourceError::HttpError {
                status: status.as_u16(),
                message: if status.is_server_error() {
                    "Server error".to_string()
                } else {
                    "Client error".to_string()
                },
            });
        }

        let mut body = response
            .json::<Value>()
            .await
            .map_err(|e| DataSourceError::ParseError(e.to_string()))?;

        if let Some(error) = body.get("error") {
            return Err(DataSourceError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        body.get_mut("result")
            .map(Value::take)
            .ok_or_else(|| DataSourceError::ParseError(format!("{}: missing result", method)))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>, block: u64) -> Result<Vec<u8>, DataSourceError> {
        let result = self
            .request(
                "eth_call",
                json!([
                    { "to": to.to_string(), "data": format!("0x{}", hex::encode(data)) },
                    quantity(block),
                ]),
            )
            .await?;
        parse_bytes(&result)
    }

    async fn call_address_getter(
        &self,
        signature: &str,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        let mut data = selector(signature).to_vec();
        data.extend_from_slice(address_to_word(&user).as_slice());
        let output = self.eth_call(token, data, block).await?;
        parse_word(&output)
    }

    /// Put the new revision into the data of an `Upgraded` record.
    ///
    /// The log itself only names the implementation, so the implementation
    /// is asked for its revision constant at the upgrade block.
    async fn enrich_upgrade(&self, record: &mut RawEventRecord) -> Result<(), DataSourceError> {
        let implementation = record
            .topics
            .get(1)
            .and_then(word_to_address)
            .unwrap_or(record.address);
        for getter in REVISION_GETTERS {
            match self
                .eth_call(implementation, selector(getter).to_vec(), record.block_number)
                .await
            {
                Ok(output) if output.len() == 32 => {
                    record.data = output;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    debug!(%implementation, getter, error = %e, "revision getter unavailable");
                }
            }
        }
        warn!(
            emitter = %record.address,
            block = record.block_number,
            "no revision getter answered for Upgraded log"
        );
        Ok(())
    }
}

#[async_trait]
impl LogSource for JsonRpcClient {
    async fn fetch(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEventRecord>, DataSourceError> {
        debug!(from_block, to_block, addresses = filter.addresses.len(), "eth_getLogs");

        let mut params = json!({
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
        });
        if !filter.addresses.is_empty() {
            params["address"] = json!(filter
                .addresses
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>());
        }
        if !filter.topics.is_empty() {
            params["topics"] = json!([filter
                .topics
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()]);
        }

        let response = self.request("eth_getLogs", json!([params])).await?;
        let logs = response
            .as_array()
            .ok_or_else(|| DataSourceError::ParseError("Expected array response".to_string()))?;

        let mut records = Vec::with_capacity(logs.len());
        for log in logs {
            if log.get("removed").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let mut record = parse_log(log)?;
            if record.topics.first() == Some(&topics::UPGRADED) && record.data.is_empty() {
                self.enrich_upgrade(&mut record).await?;
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn head_block(&self) -> Result<u64, DataSourceError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }
}

#[async_trait]
impl ChainReader for JsonRpcClient {
    async fn scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.call_address_getter("scaledBalanceOf(address)", token, user, block)
            .await
    }

    async fn previous_index(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.call_address_getter("getPreviousIndex(address)", token, user, block)
            .await
    }

    async fn discount_percent(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.call_address_getter("getDiscountPercent(address)", token, user, block)
            .await
    }

    async fn discount_token_balance(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.call_address_getter("balanceOf(address)", token, user, block)
            .await
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

fn parse_quantity(value: &Value) -> Result<u64, DataSourceError> {
    let text = value
        .as_str()
        .ok_or_else(|| DataSourceError::ParseError("Expected hex quantity".to_string()))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|e| DataSourceError::ParseError(format!("Invalid quantity {}: {}", text, e)))
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, DataSourceError> {
    let text = value
        .as_str()
        .ok_or_else(|| DataSourceError::ParseError("Expected hex data".to_string()))?;
    hex::decode(text.strip_prefix("0x").unwrap_or(text))
        .map_err(|e| DataSourceError::ParseError(format!("Invalid hex data: {}", e)))
}

fn parse_word(output: &[u8]) -> Result<U256, DataSourceError> {
    if output.len() != 32 {
        return Err(DataSourceError::ParseError(format!(
            "Expected a 32-byte return value, got {} bytes",
            output.len()
        )));
    }
    Ok(U256::from_be_slice(output))
}

fn field<'a>(log: &'a Value, name: &str) -> Result<&'a Value, DataSourceError> {
    log.get(name)
        .ok_or_else(|| DataSourceError::ParseError(format!("Missing {} field", name)))
}

fn parse_log(log: &Value) -> Result<RawEventRecord, DataSourceError> {
    let address = field(log, "address")?
        .as_str()
        .and_then(|s| Address::from_str(s).ok())
        .ok_or_else(|| DataSourceError::ParseError("Invalid address".to_string()))?;
    let topics = field(log, "topics")?
        .as_array()
        .ok_or_else(|| DataSourceError::ParseError("Expected topics array".to_string()))?
        .iter()
        .map(|t| {
            t.as_str()
                .and_then(|s| B256::from_str(s).ok())
                .ok_or_else(|| DataSourceError::ParseError("Invalid topic".to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let tx_hash = field(log, "transactionHash")?
        .as_str()
        .and_then(|s| B256::from_str(s).ok())
        .ok_or_else(|| DataSourceError::ParseError("Invalid transaction hash".to_string()))?;

    Ok(RawEventRecord {
        address,
        topics,
        data: parse_bytes(field(log, "data")?)?,
        block_number: parse_quantity(field(log, "blockNumber")?)?,
        log_index: parse_quantity(field(log, "logIndex")?)?,
        tx_hash,
    })
}
