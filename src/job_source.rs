//! Where work comes from and where results go.
//!
//! The orchestrator only sees [`JobSource`]. [`GetworkClient`] speaks the
//! JSON-RPC `getwork` method over HTTP(S).

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::hash::{DATA_LEN, DIFF1_TARGET};
use crate::pool::PoolCredentials;
use crate::work::RawWork;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection to pool failed: {0}")]
    Connection(String),
    #[error("pool request timed out")]
    Timeout,
    #[error("pool returned an error: {0}")]
    Remote(String),
    #[error("malformed pool response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted,
    Rejected(Option<String>),
}

pub trait JobSource: Send + Sync {
    fn fetch(&self, pool: &PoolCredentials) -> Result<RawWork, PoolError>;

    /// `data` already carries `nonce` in its header.
    fn submit(
        &self,
        pool: &PoolCredentials,
        data: &[u8; DATA_LEN],
        nonce: u32,
    ) -> Result<SubmitResponse, PoolError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GetworkResult {
    data: String,
    target: Option<String>,
}

pub struct GetworkClient {
    http: Client,
}

impl GetworkClient {
    pub fn new(timeout: Duration) -> Result<Self, PoolError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hashmill/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PoolError::Connection(e.to_string()))?;
        Ok(Self { http })
    }

    fn call(&self, pool: &PoolCredentials, params: serde_json::Value) -> Result<(serde_json::Value, HeaderMap), PoolError> {
        let body = json!({ "method": "getwork", "params": params, "id": 1 });
        let resp = self
            .http
            .post(&pool.url)
            .basic_auth(&pool.user, Some(&pool.pass))
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    PoolError::Timeout
                } else {
                    PoolError::Connection(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(PoolError::Remote(format!("HTTP {}", resp.status())));
        }
        let headers = resp.headers().clone();
        let rpc: RpcResponse = resp.json().map_err(|e| PoolError::Protocol(e.to_string()))?;
        if let Some(err) = rpc.error.filter(|e| !e.is_null()) {
            return Err(PoolError::Remote(err.to_string()));
        }
        let result = rpc
            .result
            .ok_or_else(|| PoolError::Protocol("missing result".into()))?;
        Ok((result, headers))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl JobSource for GetworkClient {
    fn fetch(&self, pool: &PoolCredentials) -> Result<RawWork, PoolError> {
        let (result, headers) = self.call(pool, json!([]))?;
        let roll_ntime = header_str(&headers, "X-Roll-NTime").is_some_and(|v| !v.eq_ignore_ascii_case("n"));
        let result: GetworkResult =
            serde_json::from_value(result).map_err(|e| PoolError::Protocol(e.to_string()))?;
        parse_getwork(&result.data, result.target.as_deref(), roll_ntime)
    }

    fn submit(
        &self,
        pool: &PoolCredentials,
        data: &[u8; DATA_LEN],
        _nonce: u32,
    ) -> Result<SubmitResponse, PoolError> {
        let (result, headers) = self.call(pool, json!([encode_getwork_data(data)]))?;
        match result.as_bool() {
            Some(true) => Ok(SubmitResponse::Accepted),
            Some(false) => {
                let reason = header_str(&headers, "X-Reject-Reason").map(str::to_string);
                Ok(SubmitResponse::Rejected(reason))
            }
            None => Err(PoolError::Protocol(format!("unexpected submit result {result}"))),
        }
    }
}

/// getwork transmits every 32-bit word byte-swapped relative to the header.
fn swap_words(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(4) {
        word.reverse();
    }
}

pub fn parse_getwork(data_hex: &str, target_hex: Option<&str>, roll_ntime: bool) -> Result<RawWork, PoolError> {
    let bytes = hex::decode(data_hex.trim()).map_err(|e| PoolError::Protocol(format!("data: {e}")))?;
    let mut data: [u8; DATA_LEN] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| PoolError::Protocol(format!("data is {} bytes, want {DATA_LEN}", v.len())))?;
    swap_words(&mut data);

    let target: [u8; 32] = match target_hex {
        Some(t) => hex::decode(t.trim())
            .map_err(|e| PoolError::Protocol(format!("target: {e}")))?
            .try_into()
            .map_err(|_| PoolError::Protocol("target is not 32 bytes".into()))?,
        None => DIFF1_TARGET,
    };
    Ok(RawWork { data, target, roll_ntime })
}

pub fn encode_getwork_data(data: &[u8; DATA_LEN]) -> String {
    let mut wire = *data;
    swap_words(&mut wire);
    hex::encode(wire)
}
