// src/chain.rs
//
// Chain client adapter: the reads the signing context needs and the
// submission entry point, behind a trait so the orchestrator can be driven
// against a fake node in tests.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use jsonrpsee::core::client::Error as JsonRpcError;
use serde::Serialize;
use std::fmt;
use subxt::{
    backend::{
        legacy::{rpc_methods::TransactionStatus, LegacyRpcMethods},
        rpc::RpcClient,
    },
    error::RpcError,
    utils::AccountId32,
    OnlineClient, PolkadotConfig,
};

use crate::{
    error::SigningError,
    extrinsic::SignedTransaction,
    payload::Hash,
    signer::DerivedAddress,
};

/// Runtime version descriptor as reported by `state_getRuntimeVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersionInfo {
    pub spec_name: String,
    pub impl_name: String,
    pub spec_version: u32,
    pub transaction_version: u32,
}

/// Chain values the payload is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub genesis_hash: Hash,
    /// Latest finalized block, used as checkpoint for mortal eras.
    pub block_hash: Hash,
    pub block_number: u64,
    pub transaction_version: u32,
    pub spec_version: u32,
    pub runtime_version: Option<RuntimeVersionInfo>,
    pub extrinsic_version: u8,
}

/// Lifecycle events of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Future,
    Ready,
    Broadcast(Vec<String>),
    InBlock(Hash),
    Retracted(Hash),
    FinalityTimeout(Hash),
    Finalized(Hash),
    Usurped(Hash),
    Dropped,
    Invalid,
    Error(String),
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Future => write!(f, "future"),
            StatusEvent::Ready => write!(f, "ready"),
            StatusEvent::Broadcast(peers) => write!(f, "broadcast to {} peers", peers.len()),
            StatusEvent::InBlock(hash) => write!(f, "in block 0x{}", hex::encode(hash)),
            StatusEvent::Retracted(hash) => write!(f, "retracted from 0x{}", hex::encode(hash)),
            StatusEvent::FinalityTimeout(hash) => {
                write!(f, "finality timeout at 0x{}", hex::encode(hash))
            }
            StatusEvent::Finalized(hash) => write!(f, "finalized in 0x{}", hex::encode(hash)),
            StatusEvent::Usurped(hash) => write!(f, "usurped by 0x{}", hex::encode(hash)),
            StatusEvent::Dropped => write!(f, "dropped"),
            StatusEvent::Invalid => write!(f, "invalid"),
            StatusEvent::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

impl From<TransactionStatus<subxt::utils::H256>> for StatusEvent {
    fn from(status: TransactionStatus<subxt::utils::H256>) -> Self {
        match status {
            TransactionStatus::Future => StatusEvent::Future,
            TransactionStatus::Ready => StatusEvent::Ready,
            TransactionStatus::Broadcast(peers) => StatusEvent::Broadcast(peers),
            TransactionStatus::InBlock(hash) => StatusEvent::InBlock(hash.0),
            TransactionStatus::Retracted(hash) => StatusEvent::Retracted(hash.0),
            TransactionStatus::FinalityTimeout(hash) => StatusEvent::FinalityTimeout(hash.0),
            TransactionStatus::Finalized(hash) => StatusEvent::Finalized(hash.0),
            TransactionStatus::Usurped(hash) => StatusEvent::Usurped(hash.0),
            TransactionStatus::Dropped => StatusEvent::Dropped,
            TransactionStatus::Invalid => StatusEvent::Invalid,
        }
    }
}

/// Status updates of one submission. Dropping it unsubscribes without
/// withdrawing the transaction from the pool.
pub type StatusSubscription = BoxStream<'static, StatusEvent>;

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn account_nonce(&self, sender: &DerivedAddress) -> Result<u64, SigningError>;

    async fn chain_state(&self) -> Result<ChainState, SigningError>;

    async fn submit(&self, tx: &SignedTransaction) -> Result<StatusSubscription, SigningError>;
}

/// `ChainClient` over a subxt connection.
#[derive(Clone)]
pub struct SubxtChainClient {
    client: OnlineClient<PolkadotConfig>,
    rpc: LegacyRpcMethods<PolkadotConfig>,
}

impl SubxtChainClient {
    pub async fn connect(url: &str) -> Result<Self, SigningError> {
        let rpc_client = RpcClient::from_url(url).await.map_err(SigningError::chain)?;
        let client = OnlineClient::<PolkadotConfig>::from_rpc_client(rpc_client.clone())
            .await
            .map_err(SigningError::chain)?;
        let rpc = LegacyRpcMethods::<PolkadotConfig>::new(rpc_client);

        log::info!("🔗 Connected to {}", url);
        Ok(Self { client, rpc })
    }
}

#[async_trait]
impl ChainClient for SubxtChainClient {
    async fn account_nonce(&self, sender: &DerivedAddress) -> Result<u64, SigningError> {
        let raw: [u8; 32] = sender.public_key.as_slice().try_into().map_err(|_| {
            SigningError::malformed(format!(
                "public key of {} has {} bytes",
                sender.address,
                sender.public_key.len()
            ))
        })?;
        let account_id = AccountId32(raw);

        let nonce = self
            .client
            .tx()
            .account_nonce(&account_id)
            .await
            .map_err(SigningError::chain)?;

        log::info!("🔢 Account {}: chain_nonce={}", sender.address, nonce);
        Ok(nonce)
    }

    async fn chain_state(&self) -> Result<ChainState, SigningError> {
        // latest finalized block, so a mortal era is never anchored on a fork
        let latest = self
            .client
            .blocks()
            .at_latest()
            .await
            .map_err(SigningError::chain)?;

        let version = self
            .rpc
            .state_get_runtime_version(None)
            .await
            .map_err(SigningError::chain)?;

        let text = |key: &str| {
            version
                .other
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let runtime_version = text("specName").map(|spec_name| RuntimeVersionInfo {
            spec_name,
            impl_name: text("implName").unwrap_or_default(),
            spec_version: version.spec_version,
            transaction_version: version.transaction_version,
        });

        let state = ChainState {
            genesis_hash: self.client.genesis_hash().0,
            block_hash: latest.hash().0,
            block_number: latest.number().into(),
            transaction_version: version.transaction_version,
            spec_version: version.spec_version,
            runtime_version,
            extrinsic_version: self.client.metadata().extrinsic().version(),
        };

        log::info!(
            "📊 Chain state: genesis=0x{} finalized=#{} spec_version={} transaction_version={}",
            hex::encode(state.genesis_hash),
            state.block_number,
            state.spec_version,
            state.transaction_version
        );
        Ok(state)
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<StatusSubscription, SigningError> {
        let subscription = self
            .rpc
            .author_submit_and_watch_extrinsic(tx.encoded())
            .await
            .map_err(submission_error)?;

        Ok(subscription
            .map(|item| match item {
                Ok(status) => StatusEvent::from(status),
                Err(e) => StatusEvent::Error(e.to_string()),
            })
            .boxed())
    }
}

/// Splits submission failures into node verdicts and transport failures.
///
/// A JSON-RPC error object is the node's answer about the transaction itself
/// (e.g. `1010 Invalid Transaction: BadProof`), so the transaction was refused.
/// Anything else means the request may never have reached the node.
fn submission_error(err: subxt::Error) -> SigningError {
    if let subxt::Error::Rpc(rpc) = &err {
        match rpc {
            RpcError::ClientError(inner) => {
                if let Some(JsonRpcError::Call(call)) = inner.downcast_ref::<JsonRpcError>() {
                    let data = call.data().map(|d| format!(": {}", d.get())).unwrap_or_default();
                    return SigningError::SubmissionRejected(format!(
                        "{} ({}){}",
                        call.message(),
                        call.code(),
                        data
                    ));
                }
            }
            RpcError::RequestRejected(reason) => {
                return SigningError::SubmissionRejected(reason.clone())
            }
            _ => {}
        }
    }
    SigningError::chain(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::types::ErrorObject;
    use subxt::utils::H256;

    fn client_error(err: JsonRpcError) -> subxt::Error {
        subxt::Error::Rpc(RpcError::ClientError(Box::new(err)))
    }

    #[test]
    fn node_refusal_is_a_rejection() {
        let refused = client_error(JsonRpcError::Call(ErrorObject::owned(
            1010,
            "Invalid Transaction",
            Some("Transaction has a bad signature"),
        )));
        match submission_error(refused) {
            SigningError::SubmissionRejected(detail) => {
                assert!(detail.starts_with("Invalid Transaction (1010)"), "{detail}");
                assert!(detail.contains("bad signature"), "{detail}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transport_failure_is_unreachable() {
        let dropped = client_error(JsonRpcError::Transport(anyhow::anyhow!("connection reset")));
        assert!(matches!(
            submission_error(dropped),
            SigningError::ChainUnreachable(_)
        ));
        assert!(matches!(
            submission_error(client_error(JsonRpcError::RequestTimeout)),
            SigningError::ChainUnreachable(_)
        ));
        assert!(matches!(
            submission_error(subxt::Error::Rpc(RpcError::SubscriptionDropped)),
            SigningError::ChainUnreachable(_)
        ));
    }

    #[test]
    fn maps_node_statuses() {
        let hash = H256::repeat_byte(0x11);
        assert_eq!(
            StatusEvent::from(TransactionStatus::InBlock(hash)),
            StatusEvent::InBlock([0x11; 32])
        );
        assert_eq!(
            StatusEvent::from(TransactionStatus::<H256>::Dropped),
            StatusEvent::Dropped
        );
        assert_eq!(
            StatusEvent::from(TransactionStatus::Usurped(hash)),
            StatusEvent::Usurped([0x11; 32])
        );
    }

    #[test]
    fn status_display() {
        assert_eq!(StatusEvent::Ready.to_string(), "ready");
        assert_eq!(
            StatusEvent::Finalized([0u8; 32]).to_string(),
            format!("finalized in 0x{}", "00".repeat(32))
        );
        assert_eq!(
            StatusEvent::Error("boom".to_string()).to_string(),
            "error: boom"
        );
    }
}
