//! Full-node RPC collaborator.
//!
//! [`NodeRpc`] is the narrow set of node calls block production needs.
//! [`BitcoindRpc`] implements it over JSON-RPC with HTTP basic auth.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Block, BlockHash, ScriptBuf};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RpcConfig;
use crate::error::MinerError;
use crate::scheduler::ChainTip;

/// Reply of `walletprocesspsbt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
    /// Base64 envelope, with whatever signatures the wallet could add.
    pub psbt: String,
    pub complete: bool,
}

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainInfoJson {
    pub chain: String,
    pub blocks: u64,
    pub bestblockhash: String,
}

/// Subset of `getblockheader`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeaderJson {
    pub hash: String,
    pub height: u64,
    pub time: u64,
    /// Compact target as 8 hex digits.
    pub bits: String,
}

impl TryFrom<BlockHeaderJson> for ChainTip {
    type Error = MinerError;

    fn try_from(json: BlockHeaderJson) -> Result<Self, Self::Error> {
        let bad = |field: &str, e: String| MinerError::Rpc(format!("getblockheader {field}: {e}"));
        Ok(Self {
            height: json.height,
            hash: json.hash.parse::<BlockHash>().map_err(|e| bad("hash", e.to_string()))?,
            bits: u32::from_str_radix(&json.bits, 16).map_err(|e| bad("bits", e.to_string()))?,
            time: u32::try_from(json.time).map_err(|e| bad("time", e.to_string()))?,
        })
    }
}

/// Subset of `getaddressinfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfoJson {
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: String,
}

/// Node operations consumed by block production.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Hash of the node's best block.
    async fn best_block_hash(&self) -> Result<BlockHash, MinerError>;

    async fn block_header(&self, hash: &BlockHash) -> Result<ChainTip, MinerError>;

    /// Raw `getblocktemplate` reply for the signet and segwit rules.
    async fn block_template(&self) -> Result<serde_json::Value, MinerError>;

    /// Ask the wallet to sign a base64 envelope with `SIGHASH_ALL`.
    async fn process_envelope(&self, envelope: &str) -> Result<ProcessedEnvelope, MinerError>;

    /// Submit a finished block. A rejection reason yields
    /// [`MinerError::SubmissionRejected`].
    async fn submit_block(&self, block: &Block) -> Result<(), MinerError>;

    /// Locking script of a wallet address.
    async fn address_script(&self, address: &str) -> Result<ScriptBuf, MinerError>;
}

/// `Authorization` header value for a user and password.
pub fn basic_auth_header(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn params<const N: usize>(values: [serde_json::Value; N]) -> Result<ArrayParams, MinerError> {
    let mut params = ArrayParams::new();
    for value in values {
        params
            .insert(value)
            .map_err(|e| MinerError::Rpc(format!("encoding params: {e}")))?;
    }
    Ok(params)
}

/// JSON-RPC client for a bitcoind-compatible node.
#[derive(Clone)]
pub struct BitcoindRpc {
    client: HttpClient,
}

impl BitcoindRpc {
    pub fn new(config: &RpcConfig) -> Result<Self, MinerError> {
        let mut headers = HeaderMap::new();
        if let Some((user, password)) = config.auth.credentials()? {
            let value = HeaderValue::from_str(&basic_auth_header(&user, &password))
                .map_err(|e| MinerError::Config(format!("rpc credentials: {e}")))?;
            headers.insert("authorization", value);
        }

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(Duration::from_secs(config.request_timeout_secs))
            .build(&config.url)
            .map_err(|e| MinerError::Rpc(format!("building client for {}: {e}", config.url)))?;
        Ok(Self { client })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> Result<R, MinerError> {
        debug!(method, "rpc request");
        self.client
            .request(method, params)
            .await
            .map_err(|e| MinerError::Rpc(format!("{method}: {e}")))
    }
}

#[async_trait]
impl NodeRpc for BitcoindRpc {
    async fn best_block_hash(&self) -> Result<BlockHash, MinerError> {
        let info: BlockchainInfoJson = self.call("getblockchaininfo", ArrayParams::new()).await?;
        info.bestblockhash
            .parse()
            .map_err(|e| MinerError::Rpc(format!("getblockchaininfo bestblockhash: {e}")))
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<ChainTip, MinerError> {
        let header: BlockHeaderJson = self
            .call("getblockheader", params([hash.to_string().into()])?)
            .await?;
        header.try_into()
    }

    async fn block_template(&self) -> Result<serde_json::Value, MinerError> {
        let request = serde_json::json!({ "rules": ["signet", "segwit"] });
        self.call("getblocktemplate", params([request])?).await
    }

    async fn process_envelope(&self, envelope: &str) -> Result<ProcessedEnvelope, MinerError> {
        self.call(
            "walletprocesspsbt",
            params([envelope.into(), true.into(), "ALL".into()])?,
        )
        .await
    }

    async fn submit_block(&self, block: &Block) -> Result<(), MinerError> {
        let reason: Option<String> = self.call("submitblock", params([serialize_hex(block).into()])?).await?;
        match reason {
            None => Ok(()),
            Some(reason) => Err(MinerError::SubmissionRejected(reason)),
        }
    }

    async fn address_script(&self, address: &str) -> Result<ScriptBuf, MinerError> {
        let info: AddressInfoJson = self.call("getaddressinfo", params([address.into()])?).await?;
        hex::decode(&info.script_pub_key)
            .map(ScriptBuf::from_bytes)
            .map_err(|e| MinerError::Rpc(format!("getaddressinfo scriptPubKey: {e}")))
    }
}
