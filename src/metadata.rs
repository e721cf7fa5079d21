// src/metadata.rs
//
// Metadata service client. Two lookups:
// - the metadata digest bound into the signed payload (CheckMetadataHash),
// - the shortened metadata proof the Ledger app needs to decode a payload.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{error::SigningError, payload::METADATA_DIGEST_LEN};

#[async_trait]
pub trait MetadataDigestSource: Send + Sync {
    async fn fetch_digest(&self, chain_id: &str) -> Result<[u8; METADATA_DIGEST_LEN], SigningError>;
}

#[async_trait]
pub trait MetadataProofSource: Send + Sync {
    /// Metadata proof covering exactly the types used by `tx_blob`.
    async fn fetch_proof(&self, chain_id: &str, tx_blob: &[u8]) -> Result<Vec<u8>, SigningError>;
}

#[derive(Debug, Serialize)]
struct DigestRequest<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DigestResponse {
    metadata_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofRequest<'a> {
    tx_blob: String,
    chain: ChainRef<'a>,
}

#[derive(Debug, Serialize)]
struct ChainRef<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    tx_metadata: String,
}

/// HTTP client for a metadata service rooted at `base_url`
/// (e.g. `https://api.zondax.ch/polkadot`).
#[derive(Debug, Clone)]
pub struct HttpMetadataService {
    http: Client,
    base_url: String,
}

impl HttpMetadataService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SigningError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SigningError::metadata)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn digest_url(&self) -> String {
        format!("{}/node/metadata/hash", self.base_url)
    }

    fn proof_url(&self) -> String {
        format!("{}/transaction/metadata", self.base_url)
    }
}

#[async_trait]
impl MetadataDigestSource for HttpMetadataService {
    async fn fetch_digest(&self, chain_id: &str) -> Result<[u8; METADATA_DIGEST_LEN], SigningError> {
        let response: DigestResponse = self
            .http
            .post(self.digest_url())
            .json(&DigestRequest { id: chain_id })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SigningError::metadata)?
            .json()
            .await
            .map_err(SigningError::metadata)?;

        let digest = parse_digest(&response.metadata_hash)?;
        log::info!("🧾 Metadata hash for {}: 0x{}", chain_id, hex::encode(digest));
        Ok(digest)
    }
}

#[async_trait]
impl MetadataProofSource for HttpMetadataService {
    async fn fetch_proof(&self, chain_id: &str, tx_blob: &[u8]) -> Result<Vec<u8>, SigningError> {
        let request = ProofRequest {
            tx_blob: hex::encode(tx_blob),
            chain: ChainRef { id: chain_id },
        };
        let response: ProofResponse = self
            .http
            .post(self.proof_url())
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SigningError::metadata)?
            .json()
            .await
            .map_err(SigningError::metadata)?;

        let proof = decode_hex(&response.tx_metadata)?;
        log::debug!("Metadata proof for {}: {} bytes", chain_id, proof.len());
        Ok(proof)
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, SigningError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| SigningError::metadata(format!("invalid hex `{value}`: {e}")))
}

/// Parses the service's digest, with or without `0x`.
pub fn parse_digest(value: &str) -> Result<[u8; METADATA_DIGEST_LEN], SigningError> {
    let bytes = decode_hex(value)?;
    bytes.as_slice().try_into().map_err(|_| {
        SigningError::metadata(format!(
            "metadata hash must be {METADATA_DIGEST_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}
