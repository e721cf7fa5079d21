// In-memory collaborators for driving the orchestrator without a node,
// a metadata service or a device.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use sp_core::{
    crypto::{AccountId32, Ss58AddressFormat, Ss58Codec},
    sr25519,
};
use sp_keyring::Sr25519Keyring;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use ledger_extrinsic_signer::{
    chain::StatusSubscription, metadata::MetadataDigestSource, ChainClient, ChainState,
    DerivationPath, DerivedAddress, ExternalSigner, RuntimeVersionInfo, Signature,
    SignedTransaction, SigningError, StatusEvent,
};

pub const RECIPIENT: &str = "15yiimjp4dMoR2kDYCqL53R9ugtnpAqfosV9M7nhKK1YTGP9";
pub const DIGEST: [u8; 32] = [0x5a; 32];
/// `MultiSignature::Sr25519`
pub const SR25519_VARIANT: u8 = 0x01;

pub fn fixture_chain_state() -> ChainState {
    ChainState {
        genesis_hash: [0u8; 32],
        block_hash: [0x42; 32],
        block_number: 77,
        transaction_version: 1,
        spec_version: 1,
        runtime_version: Some(RuntimeVersionInfo {
            spec_name: "polkadot".to_string(),
            impl_name: "parity-polkadot".to_string(),
            spec_version: 1,
            transaction_version: 1,
        }),
        extrinsic_version: 4,
    }
}

pub struct FakeChain {
    pub nonce: u64,
    pub state: ChainState,
    pub statuses: Vec<StatusEvent>,
    /// Keep the status stream open after the scripted events.
    pub hang: bool,
    pub unreachable: bool,
    /// Fail the submission call itself with this error.
    pub submit_error: Option<SigningError>,
    pub delay: Duration,
    pub submitted: Mutex<Vec<Vec<u8>>>,
}

impl FakeChain {
    pub fn finalizing() -> Self {
        Self {
            nonce: 0,
            state: fixture_chain_state(),
            statuses: vec![
                StatusEvent::Ready,
                StatusEvent::InBlock([0xb1; 32]),
                StatusEvent::Finalized([0xb1; 32]),
            ],
            hang: false,
            unreachable: false,
            submit_error: None,
            delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_statuses(statuses: Vec<StatusEvent>) -> Self {
        Self {
            statuses,
            ..Self::finalizing()
        }
    }

    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn account_nonce(&self, _sender: &DerivedAddress) -> Result<u64, SigningError> {
        if self.unreachable {
            return Err(SigningError::ChainUnreachable("connection refused".to_string()));
        }
        tokio::time::sleep(self.delay).await;
        Ok(self.nonce)
    }

    async fn chain_state(&self) -> Result<ChainState, SigningError> {
        Ok(self.state.clone())
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<StatusSubscription, SigningError> {
        self.submitted.lock().unwrap().push(tx.encoded().to_vec());
        if let Some(err) = &self.submit_error {
            return Err(err.clone());
        }
        let events = futures::stream::iter(self.statuses.clone());
        Ok(if self.hang {
            events.chain(futures::stream::pending()).boxed()
        } else {
            events.boxed()
        })
    }
}

pub struct FakeMetadata {
    pub result: Result<[u8; 32], SigningError>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeMetadata {
    pub fn ok() -> Self {
        Self {
            result: Ok(DIGEST),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: Err(SigningError::MetadataServiceError("503 Service Unavailable".to_string())),
            ..Self::ok()
        }
    }
}

#[async_trait]
impl MetadataDigestSource for FakeMetadata {
    async fn fetch_digest(&self, chain_id: &str) -> Result<[u8; 32], SigningError> {
        assert_eq!(chain_id, "dot");
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

/// Signs with a dev key, the way a device would: over the bytes it is given,
/// returning a variant-tagged signature.
pub struct FakeSigner {
    pub key: Sr25519Keyring,
    pub reject: bool,
    /// Report an address for this prefix instead of the requested one.
    pub address_prefix_override: Option<u16>,
    pub paths: Mutex<Vec<DerivationPath>>,
    pub signed: Mutex<Vec<Vec<u8>>>,
    pub sign_calls: AtomicUsize,
}

impl FakeSigner {
    pub fn alice() -> Self {
        Self {
            key: Sr25519Keyring::Alice,
            reject: false,
            address_prefix_override: None,
            paths: Mutex::new(Vec::new()),
            signed: Mutex::new(Vec::new()),
            sign_calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::alice()
        }
    }

    pub fn address(&self, prefix: u16) -> String {
        AccountId32::from(self.key.to_raw_public())
            .to_ss58check_with_version(Ss58AddressFormat::custom(prefix))
    }

    pub fn sign_count(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn signed_payloads(&self) -> Vec<Vec<u8>> {
        self.signed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSigner for FakeSigner {
    async fn get_address(
        &self,
        path: &DerivationPath,
        address_prefix: u16,
    ) -> Result<DerivedAddress, SigningError> {
        self.paths.lock().unwrap().push(*path);
        let prefix = self.address_prefix_override.unwrap_or(address_prefix);
        Ok(DerivedAddress {
            address: self.address(prefix),
            public_key: self.key.to_raw_public().to_vec(),
        })
    }

    async fn sign(&self, path: &DerivationPath, payload: &[u8]) -> Result<Signature, SigningError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(*path);
        if self.reject {
            return Err(SigningError::UserRejectedOnDevice);
        }
        self.signed.lock().unwrap().push(payload.to_vec());

        let signature: sr25519::Signature = self.key.sign(payload);
        let mut bytes = vec![SR25519_VARIANT];
        bytes.extend_from_slice(AsRef::<[u8]>::as_ref(&signature));
        Ok(Signature::new(bytes))
    }
}
