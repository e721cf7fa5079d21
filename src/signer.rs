// src/signer.rs
//
// External signer capability: derive an address for a path, sign bytes with
// the key at that path. The private key never leaves the implementation.

use async_trait::async_trait;
use sp_core::crypto::{AccountId32, Ss58AddressFormat, Ss58Codec};

use crate::{derivation::DerivationPath, error::SigningError, extrinsic::Signature};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    /// SS58 address as reported by the signer.
    pub address: String,
    pub public_key: Vec<u8>,
}

impl DerivedAddress {
    /// Checks that `address` is the SS58 encoding of `public_key` under `prefix`.
    pub fn verify(&self, path: &DerivationPath, prefix: u16) -> Result<(), SigningError> {
        let failed = |reason: String| SigningError::DerivationFailed {
            path: path.to_string(),
            reason,
        };

        let raw: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| failed(format!("public key has {} bytes", self.public_key.len())))?;

        let expected = AccountId32::from(raw)
            .to_ss58check_with_version(Ss58AddressFormat::custom(prefix));
        if expected != self.address {
            return Err(failed(format!(
                "device returned {} but the public key encodes to {}",
                self.address, expected
            )));
        }
        Ok(())
    }
}

/// A signing device session. Implementations serialize their own access;
/// callers may share one session between runs.
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    async fn get_address(
        &self,
        path: &DerivationPath,
        address_prefix: u16,
    ) -> Result<DerivedAddress, SigningError>;

    async fn sign(&self, path: &DerivationPath, payload: &[u8]) -> Result<Signature, SigningError>;
}
