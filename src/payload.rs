// src/payload.rs
//
// Canonical unsigned signing payload.
//
// The bytes produced here must be exactly what the runtime rebuilds when it
// checks the signature of a v4 extrinsic, i.e. the SCALE encoding of
// `(call, extra, additional)`:
//
//   Compact(len(call)) ++ call
//   extra:      era ++ Compact(nonce) ++ Compact(tip) ++ mode
//   additional: spec_version ++ transaction_version ++ genesis_hash
//               ++ checkpoint block hash ++ Option<metadata_digest>
//
// The leading compact length is kept in the encoding and stripped before the
// bytes go to the device (see `UnsignedPayload::device_bytes`).

use parity_scale_codec::{Compact, Decode, Encode};
use serde_json::json;
use sp_runtime::generic::Era;

use crate::{
    call::CallPayload,
    chain::{ChainState, RuntimeVersionInfo},
    error::SigningError,
    signer::DerivedAddress,
};

pub type Hash = [u8; 32];

pub const METADATA_DIGEST_LEN: usize = 32;
pub const SUPPORTED_EXTRINSIC_VERSION: u8 = 4;
/// Longest mortality period whose birth block equals the current block.
pub const MAX_MORTAL_PERIOD: u64 = 4096;

/// Which payload variant the runtime expects (`CheckMetadataHash` mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SigningMode {
    Disabled = 0,
    MetadataHash = 1,
}

impl SigningMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SigningMode {
    type Error = SigningError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SigningMode::Disabled),
            1 => Ok(SigningMode::MetadataHash),
            other => Err(SigningError::malformed(format!("unknown signing mode {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraPolicy {
    /// Checkpoint is the genesis block; the transaction never expires.
    #[default]
    Immortal,
    /// Valid for `period` blocks starting at the latest finalized block.
    Mortal { period: u64 },
}

/// Everything the payload depends on, captured within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub sender_address: String,
    pub sender_public_key: Vec<u8>,
    pub nonce: u64,
    pub genesis_hash: Hash,
    /// Mortality checkpoint; the genesis hash for an immortal era.
    pub block_hash: Hash,
    pub transaction_version: u32,
    pub spec_version: u32,
    pub runtime_version: Option<RuntimeVersionInfo>,
    pub extrinsic_version: u8,
    pub mode: SigningMode,
    pub era: Era,
    pub tip: u128,
    pub metadata_digest: Option<Vec<u8>>,
}

impl SigningContext {
    /// Assembles the context from the values fetched during one run.
    ///
    /// # Arguments
    /// * `sender` - Address and public key derived on the device
    /// * `nonce` - Next account nonce reported by the node
    /// * `chain` - Genesis hash, latest finalized block and runtime versions
    /// * `metadata_digest` - Digest from the metadata service, `None` when disabled
    /// * `mode` - Whether the runtime expects the metadata digest
    /// * `era_policy` - Immortal, or mortal from the latest finalized block
    ///
    /// # Returns
    /// * `Ok(SigningContext)` - With tip 0 and the era checkpoint filled in
    /// * `Err(SigningError::MalformedContext)` - If the mortal period is too long
    pub fn resolve(
        sender: &DerivedAddress,
        nonce: u64,
        chain: &ChainState,
        metadata_digest: Option<Vec<u8>>,
        mode: SigningMode,
        era_policy: EraPolicy,
    ) -> Result<Self, SigningError> {
        let (era, block_hash) = match era_policy {
            EraPolicy::Immortal => (Era::Immortal, chain.genesis_hash),
            EraPolicy::Mortal { period } => {
                if period > MAX_MORTAL_PERIOD {
                    return Err(SigningError::malformed(format!(
                        "mortal period {period} exceeds {MAX_MORTAL_PERIOD} blocks"
                    )));
                }
                (Era::mortal(period, chain.block_number), chain.block_hash)
            }
        };

        Ok(Self {
            sender_address: sender.address.clone(),
            sender_public_key: sender.public_key.clone(),
            nonce,
            genesis_hash: chain.genesis_hash,
            block_hash,
            transaction_version: chain.transaction_version,
            spec_version: chain.spec_version,
            runtime_version: chain.runtime_version.clone(),
            extrinsic_version: chain.extrinsic_version,
            mode,
            era,
            tip: 0,
            metadata_digest,
        })
    }

    /// Checks every field the runtime will rebuild the payload from.
    pub fn validate(&self) -> Result<(), SigningError> {
        if self.sender_address.is_empty() {
            return Err(SigningError::malformed("sender address is missing"));
        }
        if self.sender_public_key.len() != 32 {
            return Err(SigningError::malformed(format!(
                "sender public key must be 32 bytes, got {}",
                self.sender_public_key.len()
            )));
        }
        if self.extrinsic_version != SUPPORTED_EXTRINSIC_VERSION {
            return Err(SigningError::malformed(format!(
                "extrinsic format version {} is not supported",
                self.extrinsic_version
            )));
        }

        let runtime = self
            .runtime_version
            .as_ref()
            .ok_or_else(|| SigningError::malformed("runtime version is missing"))?;
        if runtime.spec_version != self.spec_version
            || runtime.transaction_version != self.transaction_version
        {
            return Err(SigningError::malformed(format!(
                "runtime version {}/{} disagrees with spec/transaction version {}/{}",
                runtime.spec_version,
                runtime.transaction_version,
                self.spec_version,
                self.transaction_version
            )));
        }

        if self.era.is_immortal() && self.block_hash != self.genesis_hash {
            return Err(SigningError::malformed(
                "immortal era must be checkpointed at the genesis hash",
            ));
        }

        match (self.mode, &self.metadata_digest) {
            (SigningMode::MetadataHash, None) => {
                Err(SigningError::malformed("metadata digest is missing"))
            }
            (SigningMode::MetadataHash, Some(digest)) if digest.len() != METADATA_DIGEST_LEN => {
                Err(SigningError::malformed(format!(
                    "metadata digest must be {METADATA_DIGEST_LEN} bytes, got {}",
                    digest.len()
                )))
            }
            (SigningMode::Disabled, Some(_)) => Err(SigningError::malformed(
                "metadata digest given while metadata checking is disabled",
            )),
            _ => Ok(()),
        }
    }

    fn digest_array(&self) -> Option<Hash> {
        self.metadata_digest.as_ref().and_then(|d| d.as_slice().try_into().ok())
    }

    /// The signed extension values carried inside the extrinsic.
    pub fn encode_extra_to(&self, out: &mut Vec<u8>) {
        self.era.encode_to(out);
        Compact(self.nonce).encode_to(out);
        Compact(self.tip).encode_to(out);
        out.push(self.mode.as_u8());
    }

    /// The implicit values the runtime supplies itself when verifying.
    fn encode_additional_to(&self, out: &mut Vec<u8>) {
        self.spec_version.encode_to(out);
        self.transaction_version.encode_to(out);
        out.extend_from_slice(&self.genesis_hash);
        out.extend_from_slice(&self.block_hash);
        self.digest_array().encode_to(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedPayload {
    bytes: Vec<u8>,
    marker_len: usize,
}

impl UnsignedPayload {
    /// Full encoding, including the call length marker.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The bytes handed to the device: the payload with its single leading
    /// length byte removed. The device neither consumes the marker nor has
    /// room for it.
    pub fn device_bytes(&self) -> Result<&[u8], SigningError> {
        if self.marker_len != 1 {
            return Err(SigningError::malformed(format!(
                "call length marker spans {} bytes; only a single-byte marker can be stripped",
                self.marker_len
            )));
        }
        Ok(&self.bytes[1..])
    }

    pub fn decode(&self) -> Result<PayloadFields, SigningError> {
        PayloadFields::decode_from(&self.bytes)
    }
}

/// Builds the exact byte sequence the runtime verifies the signature against.
///
/// Pure and deterministic: the same context and call always give the same
/// bytes. The context is validated first, so a payload is never built from
/// a half-resolved or inconsistent snapshot.
///
/// # Arguments
/// * `ctx` - Signing context captured during the current run
/// * `call` - The encoded call
///
/// # Returns
/// * `Ok(UnsignedPayload)` - `Compact(len(call)) ++ call ++ extra ++ additional`
/// * `Err(SigningError::MalformedContext)` - If any context field is missing,
///   has the wrong length or disagrees with another field
pub fn build_unsigned_payload(
    ctx: &SigningContext,
    call: &CallPayload,
) -> Result<UnsignedPayload, SigningError> {
    ctx.validate()?;

    let mut bytes = Vec::new();
    Compact(call.bytes().len() as u32).encode_to(&mut bytes);
    let marker_len = bytes.len();

    bytes.extend_from_slice(call.bytes());
    ctx.encode_extra_to(&mut bytes);
    ctx.encode_additional_to(&mut bytes);

    Ok(UnsignedPayload { bytes, marker_len })
}

/// An unsigned payload decoded back into its fields, for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFields {
    pub call: Vec<u8>,
    pub era: Era,
    pub nonce: u64,
    pub tip: u128,
    pub mode: u8,
    pub spec_version: u32,
    pub transaction_version: u32,
    pub genesis_hash: Hash,
    pub block_hash: Hash,
    pub metadata_digest: Option<Hash>,
}

impl PayloadFields {
    pub fn decode_from(mut input: &[u8]) -> Result<Self, SigningError> {
        let input = &mut input;
        let fields = Self {
            call: decode_field(input, "call")?,
            era: decode_field(input, "era")?,
            nonce: decode_field::<Compact<u64>>(input, "nonce")?.0,
            tip: decode_field::<Compact<u128>>(input, "tip")?.0,
            mode: decode_field(input, "mode")?,
            spec_version: decode_field(input, "spec version")?,
            transaction_version: decode_field(input, "transaction version")?,
            genesis_hash: decode_field(input, "genesis hash")?,
            block_hash: decode_field(input, "block hash")?,
            metadata_digest: decode_field(input, "metadata digest")?,
        };
        if !input.is_empty() {
            return Err(SigningError::malformed(format!(
                "{} trailing bytes after payload",
                input.len()
            )));
        }
        Ok(fields)
    }

    /// Human readable form, for logging next to the raw hex.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "method": format!("0x{}", hex::encode(&self.call)),
            "era": format!("{:?}", self.era),
            "nonce": self.nonce,
            "tip": self.tip.to_string(),
            "mode": self.mode,
            "specVersion": self.spec_version,
            "transactionVersion": self.transaction_version,
            "genesisHash": format!("0x{}", hex::encode(self.genesis_hash)),
            "blockHash": format!("0x{}", hex::encode(self.block_hash)),
            "metadataHash": self.metadata_digest.map(|d| format!("0x{}", hex::encode(d))),
        })
    }
}

fn decode_field<T: Decode>(input: &mut &[u8], name: &str) -> Result<T, SigningError> {
    T::decode(input).map_err(|e| SigningError::malformed(format!("cannot decode {name}: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fixture_chain() -> ChainState {
        ChainState {
            genesis_hash: [0u8; 32],
            block_hash: [7u8; 32],
            block_number: 1_000,
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

    pub(crate) fn fixture_sender() -> DerivedAddress {
        DerivedAddress {
            address: "1fixture".to_string(),
            public_key: vec![9u8; 32],
        }
    }

    pub(crate) fn fixture_context() -> SigningContext {
        SigningContext::resolve(
            &fixture_sender(),
            0,
            &fixture_chain(),
            Some(vec![0xab; 32]),
            SigningMode::MetadataHash,
            EraPolicy::Immortal,
        )
        .unwrap()
    }

    fn fixture_call() -> CallPayload {
        CallPayload::new(vec![0x05, 0x03, 0x00, 0x11, 0x22], "fixture").unwrap()
    }

    #[test]
    fn payload_is_deterministic() {
        let ctx = fixture_context();
        let call = fixture_call();
        let a = build_unsigned_payload(&ctx, &call).unwrap();
        let b = build_unsigned_payload(&ctx, &call).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn payload_byte_layout() {
        let ctx = fixture_context();
        let call = fixture_call();
        let payload = build_unsigned_payload(&ctx, &call).unwrap();

        let mut expected = vec![5 << 2];
        expected.extend_from_slice(call.bytes());
        expected.push(0x00); // immortal era
        expected.push(0x00); // nonce 0
        expected.push(0x00); // tip 0
        expected.push(0x01); // mode
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&[0u8; 32]);
        expected.extend_from_slice(&[0u8; 32]); // checkpoint = genesis
        expected.push(0x01);
        expected.extend_from_slice(&[0xab; 32]);

        assert_eq!(payload.as_bytes(), expected.as_slice());
        assert_eq!(payload.len(), 1 + 5 + 4 + 8 + 64 + 33);
    }

    #[test]
    fn device_bytes_drop_exactly_the_length_marker() {
        let payload = build_unsigned_payload(&fixture_context(), &fixture_call()).unwrap();
        let device = payload.device_bytes().unwrap();
        assert_eq!(device.len(), payload.len() - 1);
        assert_eq!(device, &payload.as_bytes()[1..]);
        assert_eq!(&device[..5], fixture_call().bytes());
    }

    #[test]
    fn multi_byte_marker_is_not_stripped() {
        let call = CallPayload::new(vec![1u8; 80], "large").unwrap();
        let payload = build_unsigned_payload(&fixture_context(), &call).unwrap();
        assert!(matches!(
            payload.device_bytes(),
            Err(SigningError::MalformedContext(_))
        ));
    }

    #[test]
    fn decoded_fields_match_context() {
        let ctx = fixture_context();
        let call = fixture_call();
        let fields = build_unsigned_payload(&ctx, &call).unwrap().decode().unwrap();

        assert_eq!(fields.call, call.bytes());
        assert_eq!(fields.era, ctx.era);
        assert_eq!(fields.nonce, ctx.nonce);
        assert_eq!(fields.tip, 0);
        assert_eq!(fields.mode, 1);
        assert_eq!(fields.spec_version, ctx.spec_version);
        assert_eq!(fields.transaction_version, ctx.transaction_version);
        assert_eq!(fields.genesis_hash, ctx.genesis_hash);
        assert_eq!(fields.block_hash, ctx.block_hash);
        assert_eq!(fields.metadata_digest, Some([0xab; 32]));

        let human = fields.to_json();
        assert_eq!(human["nonce"], 0);
        assert_eq!(human["metadataHash"], format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn mortal_era_uses_current_block_as_checkpoint() {
        let ctx = SigningContext::resolve(
            &fixture_sender(),
            3,
            &fixture_chain(),
            Some(vec![0xab; 32]),
            SigningMode::MetadataHash,
            EraPolicy::Mortal { period: 64 },
        )
        .unwrap();
        assert_eq!(ctx.block_hash, [7u8; 32]);
        assert_eq!(ctx.era.birth(1_000), 1_000);

        let fields = build_unsigned_payload(&ctx, &fixture_call())
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(fields.era, Era::mortal(64, 1_000));
        assert_eq!(fields.block_hash, [7u8; 32]);
    }

    #[test]
    fn oversized_mortal_period_is_rejected() {
        let err = SigningContext::resolve(
            &fixture_sender(),
            0,
            &fixture_chain(),
            None,
            SigningMode::Disabled,
            EraPolicy::Mortal { period: 65_536 },
        )
        .unwrap_err();
        assert!(matches!(err, SigningError::MalformedContext(_)));
    }

    #[test]
    fn disabled_mode_encodes_no_digest() {
        let ctx = SigningContext::resolve(
            &fixture_sender(),
            0,
            &fixture_chain(),
            None,
            SigningMode::Disabled,
            EraPolicy::Immortal,
        )
        .unwrap();
        let payload = build_unsigned_payload(&ctx, &fixture_call()).unwrap();
        assert_eq!(*payload.as_bytes().last().unwrap(), 0x00);
        assert_eq!(payload.decode().unwrap().metadata_digest, None);
    }

    #[test]
    fn rejects_malformed_contexts() {
        let call = fixture_call();
        let malformed = |ctx: SigningContext| {
            matches!(
                build_unsigned_payload(&ctx, &call),
                Err(SigningError::MalformedContext(_))
            )
        };

        let mut short_digest = fixture_context();
        short_digest.metadata_digest = Some(vec![1u8; 31]);
        assert!(malformed(short_digest));

        let mut no_digest = fixture_context();
        no_digest.metadata_digest = None;
        assert!(malformed(no_digest));

        let mut no_runtime = fixture_context();
        no_runtime.runtime_version = None;
        assert!(malformed(no_runtime));

        let mut stale_runtime = fixture_context();
        stale_runtime.spec_version = 2;
        assert!(malformed(stale_runtime));

        let mut v5 = fixture_context();
        v5.extrinsic_version = 5;
        assert!(malformed(v5));

        let mut wrong_checkpoint = fixture_context();
        wrong_checkpoint.block_hash = [1u8; 32];
        assert!(malformed(wrong_checkpoint));

        let mut no_sender = fixture_context();
        no_sender.sender_address.clear();
        assert!(malformed(no_sender));

        let mut short_key = fixture_context();
        short_key.sender_public_key = vec![1u8; 20];
        assert!(malformed(short_key));
    }

    #[test]
    fn signing_mode_from_byte() {
        assert_eq!(SigningMode::try_from(1).unwrap(), SigningMode::MetadataHash);
        assert_eq!(SigningMode::try_from(0).unwrap(), SigningMode::Disabled);
        assert!(SigningMode::try_from(2).is_err());
    }
}
