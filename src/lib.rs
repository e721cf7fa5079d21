//! Builds, signs on a Ledger device and submits Substrate extrinsics that
//! carry a metadata digest (`CheckMetadataHash`).
//!
//! The [`orchestrator::SigningOrchestrator`] drives one run: derive the sender
//! from the device, read the nonce and chain state while fetching the metadata
//! digest, build the exact payload the runtime will verify, have the device
//! sign it, assemble the extrinsic and follow it until it is finalized,
//! rejected or the wait times out.
//!
//! Chain access, the metadata service and the device are reached through the
//! [`chain::ChainClient`], [`metadata::MetadataDigestSource`] and
//! [`signer::ExternalSigner`] traits.

pub mod call;
pub mod chain;
pub mod derivation;
pub mod error;
pub mod extrinsic;
pub mod ledger;
pub mod metadata;
pub mod network;
pub mod orchestrator;
pub mod payload;
pub mod signer;

pub use call::{CallError, CallPayload};
pub use chain::{ChainClient, ChainState, RuntimeVersionInfo, StatusEvent, SubxtChainClient};
pub use derivation::DerivationPath;
pub use error::SigningError;
pub use extrinsic::{Signature, SignedTransaction};
pub use network::{NetworkProfile, NetworkRegistry};
pub use orchestrator::{
    FinalizedTransaction, OrchestrationError, OrchestratorConfig, OrchestratorState,
    SigningOrchestrator,
};
pub use payload::{build_unsigned_payload, EraPolicy, SigningContext, SigningMode, UnsignedPayload};
pub use signer::{DerivedAddress, ExternalSigner};
