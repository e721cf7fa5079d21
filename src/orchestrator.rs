// src/orchestrator.rs
//
// Signing orchestrator: one run takes a derivation path and a call through
//
//   Idle -> AddressDerived -> ContextResolved -> PayloadBuilt -> Signed
//        -> TransactionAssembled -> Submitted -> Finalized | Rejected | TimedOut
//
// Every failure ends the run. The error reports the state the run had reached
// and everything gathered so far, so the caller can decide how to retry.

use futures::StreamExt;
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    call::CallPayload,
    chain::{ChainClient, ChainState, StatusEvent},
    derivation::DerivationPath,
    error::SigningError,
    extrinsic::{Signature, SignedTransaction},
    metadata::MetadataDigestSource,
    network::{NetworkProfile, NetworkRegistry},
    payload::{
        build_unsigned_payload, EraPolicy, Hash, SigningContext, SigningMode, UnsignedPayload,
        METADATA_DIGEST_LEN,
    },
    signer::{DerivedAddress, ExternalSigner},
};

pub const DEFAULT_FINALITY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    AddressDerived,
    ContextResolved,
    PayloadBuilt,
    Signed,
    TransactionAssembled,
    Submitted,
    Finalized,
    Rejected,
    TimedOut,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestratorState::Finalized | OrchestratorState::Rejected | OrchestratorState::TimedOut
        )
    }

    fn can_advance_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, AddressDerived)
                | (AddressDerived, ContextResolved)
                | (ContextResolved, PayloadBuilt)
                | (PayloadBuilt, Signed)
                | (Signed, TransactionAssembled)
                | (TransactionAssembled, Submitted)
                | (TransactionAssembled, Rejected)
                | (Submitted, Finalized)
                | (Submitted, Rejected)
                | (Submitted, TimedOut)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on the wait for a terminal status after submission.
    pub finality_timeout: Duration,
    pub era: EraPolicy,
    pub mode: SigningMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            finality_timeout: DEFAULT_FINALITY_TIMEOUT,
            era: EraPolicy::Immortal,
            mode: SigningMode::MetadataHash,
        }
    }
}

/// Everything a run has gathered, in the order it was gathered.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub path: Option<DerivationPath>,
    pub sender: Option<DerivedAddress>,
    pub nonce: Option<u64>,
    pub chain_state: Option<ChainState>,
    pub metadata_digest: Option<[u8; METADATA_DIGEST_LEN]>,
    pub context: Option<SigningContext>,
    pub unsigned_payload: Option<UnsignedPayload>,
    pub signature: Option<Signature>,
    pub signed_transaction: Option<SignedTransaction>,
    pub statuses: Vec<StatusEvent>,
}

#[derive(Debug, Error)]
#[error("{source} (run stopped in state {state})")]
pub struct OrchestrationError {
    /// Last state the run reached.
    pub state: OrchestratorState,
    pub progress: Box<RunProgress>,
    #[source]
    pub source: SigningError,
}

impl OrchestrationError {
    pub fn error(&self) -> &SigningError {
        &self.source
    }

    /// A run can be resumed from its checkpoint only while no signature
    /// exists; a signature is bound to one payload.
    pub fn is_resumable(&self) -> bool {
        self.progress.signature.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct FinalizedTransaction {
    pub block_hash: Hash,
    pub extrinsic_hash: Hash,
    pub progress: RunProgress,
}

/// Bookkeeping for a single run.
struct Run {
    state: OrchestratorState,
    progress: RunProgress,
}

impl Run {
    fn new(path: DerivationPath) -> Self {
        Self {
            state: OrchestratorState::Idle,
            progress: RunProgress {
                path: Some(path),
                ..RunProgress::default()
            },
        }
    }

    fn advance(&mut self, next: OrchestratorState) -> Result<(), SigningError> {
        if !self.state.can_advance_to(next) {
            return Err(SigningError::malformed(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        log::debug!("Run state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn ensure_state(&self, state: OrchestratorState) -> Result<(), SigningError> {
        if self.state != state {
            return Err(SigningError::malformed(format!(
                "expected state {}, run is in {}",
                state, self.state
            )));
        }
        Ok(())
    }

    fn fail(self, source: SigningError) -> OrchestrationError {
        log::error!("❌ {} while in state {}: {}", source.kind(), self.state, source);
        OrchestrationError {
            state: self.state,
            progress: Box::new(self.progress),
            source,
        }
    }
}

/// Runs the signing workflow against caller-owned collaborators. The
/// orchestrator only borrows them and never closes or reconfigures them.
pub struct SigningOrchestrator<'a> {
    network: String,
    profile: NetworkProfile,
    config: OrchestratorConfig,
    chain: &'a dyn ChainClient,
    metadata: &'a dyn MetadataDigestSource,
    signer: &'a dyn ExternalSigner,
}

impl<'a> SigningOrchestrator<'a> {
    /// Creates an orchestrator for one network.
    ///
    /// The network name is resolved once, here, so an unknown name fails
    /// before any device or node is touched.
    ///
    /// # Arguments
    /// * `registry` - The injected network table
    /// * `network` - Network name to sign for (e.g. `polkadot`)
    /// * `config` - Finality ceiling, era policy and signing mode
    /// * `chain` - Node access for nonce, chain state and submission
    /// * `metadata` - Source of the metadata digest bound into the payload
    /// * `signer` - The device session that derives addresses and signs
    ///
    /// # Returns
    /// * `Ok(SigningOrchestrator)` - Ready to run
    /// * `Err(SigningError::UnknownNetwork)` - If `network` is not in the registry
    pub fn new(
        registry: &NetworkRegistry,
        network: &str,
        config: OrchestratorConfig,
        chain: &'a dyn ChainClient,
        metadata: &'a dyn MetadataDigestSource,
        signer: &'a dyn ExternalSigner,
    ) -> Result<Self, SigningError> {
        let profile = registry.lookup(network)?.clone();
        Ok(Self {
            network: network.to_string(),
            profile,
            config,
            chain,
            metadata,
            signer,
        })
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    /// Runs one signing attempt from address derivation to a terminal status.
    ///
    /// Steps run strictly in order, except the chain reads and the metadata
    /// digest lookup, which are fetched concurrently. The device signs the
    /// payload with its leading length byte removed. After submission the run
    /// waits at most `config.finality_timeout` for a terminal status; hitting
    /// that ceiling does not withdraw the extrinsic.
    ///
    /// # Arguments
    /// * `path` - Derivation path used for both the address and the signature
    /// * `call` - The encoded call to sign and submit
    ///
    /// # Returns
    /// * `Ok(FinalizedTransaction)` - Block hash, extrinsic hash and the full run record
    /// * `Err(OrchestrationError)` - The first failure, with the state the run had
    ///   reached and everything gathered up to that point
    ///
    /// # Example Usage
    /// ```rust,ignore
    /// let orchestrator = SigningOrchestrator::new(
    ///     &registry, "polkadot", OrchestratorConfig::default(), &chain, &metadata, &ledger,
    /// )?;
    /// let path = DerivationPath::for_account(0, 4)?;
    /// let finalized = orchestrator.run(path, &call).await?;
    /// ```
    pub async fn run(
        &self,
        path: DerivationPath,
        call: &CallPayload,
    ) -> Result<FinalizedTransaction, OrchestrationError> {
        let mut run = Run::new(path);
        log::info!("📥 Signing run on {} ({})", self.network, self.profile.chain_id);
        log::info!("   Derivation path: {}", path);
        log::info!("   Call: {}", call);

        if let Err(e) = self.derive_address(&mut run, &path).await {
            return Err(run.fail(e));
        }
        if let Err(e) = self.resolve_context(&mut run).await {
            return Err(run.fail(e));
        }
        if let Err(e) = self.build_payload(&mut run, call) {
            return Err(run.fail(e));
        }
        if let Err(e) = self.sign(&mut run, &path).await {
            return Err(run.fail(e));
        }
        if let Err(e) = self.assemble(&mut run, call) {
            return Err(run.fail(e));
        }

        match self.submit_and_watch(&mut run).await {
            Ok((block_hash, extrinsic_hash)) => {
                log::info!("✅ Finalized in block 0x{}", hex::encode(block_hash));
                Ok(FinalizedTransaction {
                    block_hash,
                    extrinsic_hash,
                    progress: run.progress,
                })
            }
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn derive_address(
        &self,
        run: &mut Run,
        path: &DerivationPath,
    ) -> Result<(), SigningError> {
        let sender = self
            .signer
            .get_address(path, self.profile.address_prefix)
            .await?;
        sender.verify(path, self.profile.address_prefix)?;

        log::info!("👤 Sender address: {}", sender.address);
        log::info!("   Public key: 0x{}", hex::encode(&sender.public_key));
        run.progress.sender = Some(sender);
        run.advance(OrchestratorState::AddressDerived)
    }

    /// Chain reads and the metadata digest are fetched concurrently so the
    /// spec version and the digest describe the same runtime.
    async fn resolve_context(&self, run: &mut Run) -> Result<(), SigningError> {
        run.ensure_state(OrchestratorState::AddressDerived)?;
        let sender = run
            .progress
            .sender
            .clone()
            .ok_or_else(|| SigningError::malformed("sender address is missing"))?;

        let chain_reads = async {
            let nonce = self.chain.account_nonce(&sender).await?;
            let state = self.chain.chain_state().await?;
            Ok::<_, SigningError>((nonce, state))
        };
        let digest_read = async {
            match self.config.mode {
                SigningMode::MetadataHash => self
                    .metadata
                    .fetch_digest(&self.profile.chain_id)
                    .await
                    .map(Some),
                SigningMode::Disabled => Ok(None),
            }
        };
        let (chain_result, digest_result) = tokio::join!(chain_reads, digest_read);

        if let Ok((nonce, state)) = &chain_result {
            run.progress.nonce = Some(*nonce);
            run.progress.chain_state = Some(state.clone());
        }
        if let Ok(digest) = &digest_result {
            run.progress.metadata_digest = *digest;
        }
        let (nonce, chain_state) = chain_result?;
        let digest = digest_result?;

        log::info!("🔢 Nonce: {}", nonce);
        if let Some(digest) = &digest {
            log::info!("🧾 Metadata hash: 0x{}", hex::encode(digest));
        }

        let context = SigningContext::resolve(
            &sender,
            nonce,
            &chain_state,
            digest.map(|d| d.to_vec()),
            self.config.mode,
            self.config.era,
        )?;
        run.progress.context = Some(context);
        run.advance(OrchestratorState::ContextResolved)
    }

    fn build_payload(&self, run: &mut Run, call: &CallPayload) -> Result<(), SigningError> {
        run.ensure_state(OrchestratorState::ContextResolved)?;
        let context = run
            .progress
            .context
            .as_ref()
            .ok_or_else(|| SigningError::malformed("signing context is missing"))?;

        let payload = build_unsigned_payload(context, call)?;
        log::info!("📝 Payload to sign [hex]: 0x{}", hex::encode(payload.as_bytes()));
        match payload.decode() {
            Ok(fields) => log::info!("📝 Payload to sign [human]: {}", fields.to_json()),
            Err(e) => log::warn!("⚠️ Could not decode payload for display: {}", e),
        }

        run.progress.unsigned_payload = Some(payload);
        run.advance(OrchestratorState::PayloadBuilt)
    }

    async fn sign(&self, run: &mut Run, path: &DerivationPath) -> Result<(), SigningError> {
        run.ensure_state(OrchestratorState::PayloadBuilt)?;
        let payload = run
            .progress
            .unsigned_payload
            .as_ref()
            .ok_or_else(|| SigningError::malformed("unsigned payload is missing"))?;

        // the device does not take the leading call length byte
        let device_bytes = payload.device_bytes()?;
        log::info!("✍️ Requesting signature for {} bytes, confirm on the device", device_bytes.len());
        let signature = self.signer.sign(path, device_bytes).await?;

        log::info!("✍️ Signature: {}", signature);
        run.progress.signature = Some(signature);
        run.advance(OrchestratorState::Signed)
    }

    fn assemble(&self, run: &mut Run, call: &CallPayload) -> Result<(), SigningError> {
        run.ensure_state(OrchestratorState::Signed)?;
        let (context, signature) = match (&run.progress.context, &run.progress.signature) {
            (Some(context), Some(signature)) => (context, signature.clone()),
            _ => return Err(SigningError::malformed("context or signature is missing")),
        };

        let tx = SignedTransaction::assemble(context, call, signature)?;
        log::info!("📦 Signed tx to broadcast [hex]: 0x{}", hex::encode(tx.encoded()));
        log::info!("📦 Signed tx to broadcast [human]: {}", tx.to_json());

        run.progress.signed_transaction = Some(tx);
        run.advance(OrchestratorState::TransactionAssembled)
    }

    /// Submits and follows the status stream until a terminal event or the
    /// ceiling. Hitting the ceiling does not withdraw the transaction.
    async fn submit_and_watch(&self, run: &mut Run) -> Result<(Hash, Hash), SigningError> {
        run.ensure_state(OrchestratorState::TransactionAssembled)?;
        let tx = run
            .progress
            .signed_transaction
            .as_ref()
            .ok_or_else(|| SigningError::malformed("signed transaction is missing"))?;
        let extrinsic_hash = tx.hash();

        let mut statuses = match self.chain.submit(tx).await {
            Ok(statuses) => statuses,
            Err(e @ SigningError::SubmissionRejected(_)) => {
                // refused by the node, nothing reached the pool
                run.advance(OrchestratorState::Rejected)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        run.advance(OrchestratorState::Submitted)?;
        log::info!("📤 Submitted extrinsic 0x{}", hex::encode(extrinsic_hash));

        let started = Instant::now();
        let ceiling = self.config.finality_timeout;
        let events = &mut run.progress.statuses;
        let watch = async {
            while let Some(event) = statuses.next().await {
                log::info!("📡 Tx status: {}", event);
                events.push(event.clone());
                match event {
                    StatusEvent::Finalized(block_hash) => return Ok(block_hash),
                    StatusEvent::Dropped => {
                        return Err(SigningError::SubmissionRejected("dropped".to_string()))
                    }
                    StatusEvent::Invalid => {
                        return Err(SigningError::SubmissionRejected("invalid".to_string()))
                    }
                    StatusEvent::Usurped(by) => {
                        return Err(SigningError::SubmissionRejected(format!(
                            "usurped by 0x{}",
                            hex::encode(by)
                        )))
                    }
                    StatusEvent::Error(detail) => {
                        return Err(SigningError::SubmissionRejected(detail))
                    }
                    StatusEvent::FinalityTimeout(_) => {
                        return Err(SigningError::TimedOut(started.elapsed()))
                    }
                    _ => {}
                }
            }
            Err(SigningError::chain(
                "status subscription ended before a terminal status",
            ))
        };

        let outcome = match tokio::time::timeout(ceiling, watch).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!(
                    "⚠️ No terminal status within {:?}; the transaction may still be included",
                    ceiling
                );
                Err(SigningError::TimedOut(ceiling))
            }
        };

        match &outcome {
            Ok(_) => run.advance(OrchestratorState::Finalized)?,
            Err(SigningError::SubmissionRejected(_)) => run.advance(OrchestratorState::Rejected)?,
            Err(SigningError::TimedOut(_)) => run.advance(OrchestratorState::TimedOut)?,
            Err(_) => {}
        }
        outcome.map(|block_hash| (block_hash, extrinsic_hash))
    }
}
