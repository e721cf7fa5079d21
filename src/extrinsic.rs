// src/extrinsic.rs
//
// Signed extrinsic assembly. The envelope repeats the signed extension values
// used for the payload, so the runtime can rebuild the exact bytes that were
// signed.

use parity_scale_codec::Encode;
use serde_json::json;
use sp_core::hashing::blake2_256;
use sp_runtime::generic::Era;
use std::fmt;

use crate::{
    call::CallPayload,
    error::SigningError,
    payload::{Hash, SigningContext, SigningMode},
};

/// Bit set in the version byte of a signed extrinsic.
const SIGNED_FLAG: u8 = 0b1000_0000;
const MULTI_ADDRESS_ID: u8 = 0x00;

/// Raw signature bytes as returned by the signer.
///
/// Ledger Substrate apps prefix the signature with its `MultiSignature`
/// variant (0x00 for ed25519), so the bytes are used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    pub sender_address: String,
    pub sender_public_key: Hash,
    pub signature: Signature,
    pub era: Era,
    pub nonce: u64,
    pub tip: u128,
    pub mode: SigningMode,
    /// Not encoded in the extrinsic; the runtime supplies it when verifying.
    pub metadata_digest: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    envelope: SignatureEnvelope,
    call: Vec<u8>,
    extrinsic_version: u8,
    encoded: Vec<u8>,
}

impl SignedTransaction {
    /// Combines the signature with the call and the context it was made for.
    ///
    /// The envelope repeats the era, nonce, tip and mode that went into the
    /// signed payload, so the runtime rebuilds the same bytes when verifying.
    ///
    /// # Arguments
    /// * `ctx` - The context the payload was built from
    /// * `call` - The call that was signed
    /// * `signature` - Signature bytes exactly as returned by the device
    ///
    /// # Returns
    /// * `Ok(SignedTransaction)` - Length-prefixed v4 extrinsic ready for `author_submitExtrinsic`
    /// * `Err(SigningError::MalformedContext)` - Invalid context or empty signature
    pub fn assemble(
        ctx: &SigningContext,
        call: &CallPayload,
        signature: Signature,
    ) -> Result<Self, SigningError> {
        ctx.validate()?;
        if signature.as_bytes().is_empty() {
            return Err(SigningError::malformed("signature is empty"));
        }
        let sender_public_key: Hash = ctx
            .sender_public_key
            .as_slice()
            .try_into()
            .map_err(|_| SigningError::malformed("sender public key must be 32 bytes"))?;

        let envelope = SignatureEnvelope {
            sender_address: ctx.sender_address.clone(),
            sender_public_key,
            signature,
            era: ctx.era,
            nonce: ctx.nonce,
            tip: ctx.tip,
            mode: ctx.mode,
            metadata_digest: ctx.metadata_digest.clone(),
        };

        let mut body = vec![SIGNED_FLAG | ctx.extrinsic_version];
        body.push(MULTI_ADDRESS_ID);
        body.extend_from_slice(&envelope.sender_public_key);
        body.extend_from_slice(envelope.signature.as_bytes());
        ctx.encode_extra_to(&mut body);
        body.extend_from_slice(call.bytes());

        Ok(Self {
            envelope,
            call: call.bytes().to_vec(),
            extrinsic_version: ctx.extrinsic_version,
            // length-prefixed, as submitted over RPC
            encoded: body.encode(),
        })
    }

    pub fn envelope(&self) -> &SignatureEnvelope {
        &self.envelope
    }

    pub fn call(&self) -> &[u8] {
        &self.call
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Extrinsic hash as reported by the node.
    pub fn hash(&self) -> Hash {
        blake2_256(&self.encoded)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "isSigned": true,
            "version": self.extrinsic_version,
            "signer": { "Id": self.envelope.sender_address },
            "signature": self.envelope.signature.to_string(),
            "era": format!("{:?}", self.envelope.era),
            "nonce": self.envelope.nonce,
            "tip": self.envelope.tip.to_string(),
            "mode": self.envelope.mode.as_u8(),
            "method": format!("0x{}", hex::encode(&self.call)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::tests::fixture_context;
    use parity_scale_codec::{Compact, Decode};

    fn call() -> CallPayload {
        CallPayload::new(vec![0x07, 0x01, 0x04], "bond").unwrap()
    }

    #[test]
    fn envelope_mirrors_context() {
        let ctx = fixture_context();
        let signature = Signature::new(vec![0x00; 65]);
        let tx = SignedTransaction::assemble(&ctx, &call(), signature.clone()).unwrap();

        let envelope = tx.envelope();
        assert_eq!(envelope.sender_address, ctx.sender_address);
        assert_eq!(envelope.sender_public_key.to_vec(), ctx.sender_public_key);
        assert_eq!(envelope.signature, signature);
        assert_eq!(envelope.era, ctx.era);
        assert_eq!(envelope.nonce, ctx.nonce);
        assert_eq!(envelope.mode, ctx.mode);
        assert_eq!(envelope.metadata_digest, ctx.metadata_digest);
        assert_eq!(tx.call(), call().bytes());
    }

    #[test]
    fn encoded_layout() {
        let ctx = fixture_context();
        let signature = Signature::new(vec![0x00; 65]);
        let tx = SignedTransaction::assemble(&ctx, &call(), signature).unwrap();

        let mut input = tx.encoded();
        let len = Compact::<u32>::decode(&mut input).unwrap().0 as usize;
        assert_eq!(len, input.len());

        assert_eq!(input[0], 0x84);
        assert_eq!(input[1], MULTI_ADDRESS_ID);
        assert_eq!(&input[2..34], &[9u8; 32]);
        assert_eq!(&input[34..99], &[0u8; 65]);
        // era, nonce, tip, mode
        assert_eq!(&input[99..103], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&input[103..], call().bytes());
    }

    #[test]
    fn hash_is_blake2_of_encoding() {
        let tx = SignedTransaction::assemble(&fixture_context(), &call(), Signature::new(vec![1; 65]))
            .unwrap();
        assert_eq!(tx.hash(), blake2_256(tx.encoded()));
        assert_eq!(tx.to_json()["nonce"], 0);
    }

    #[test]
    fn empty_signature_is_rejected() {
        assert!(matches!(
            SignedTransaction::assemble(&fixture_context(), &call(), Signature::new(Vec::new())),
            Err(SigningError::MalformedContext(_))
        ));
    }
}
