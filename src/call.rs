// src/call.rs
//
// Encoded call payloads. The orchestrator treats a call as opaque bytes;
// the constructors here only exist for the two operations the CLI offers.

use parity_scale_codec::{Compact, Encode};
use sp_core::crypto::{AccountId32, Ss58Codec};
use std::fmt;
use thiserror::Error;

use crate::network::{CallIndex, NetworkProfile};

/// `MultiAddress::Id` variant index.
const MULTI_ADDRESS_ID: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("invalid recipient address `{address}`: {reason}")]
    InvalidRecipient { address: String, reason: String },
    #[error("recipient `{address}` uses address prefix {found}, network expects {expected}")]
    WrongNetwork {
        address: String,
        found: u16,
        expected: u16,
    },
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("call payload is empty")]
    Empty,
}

/// Encoded call plus a description for the audit log. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPayload {
    bytes: Vec<u8>,
    description: String,
}

impl CallPayload {
    pub fn new(bytes: Vec<u8>, description: impl Into<String>) -> Result<Self, CallError> {
        if bytes.is_empty() {
            return Err(CallError::Empty);
        }
        Ok(Self {
            bytes,
            description: description.into(),
        })
    }

    /// `Balances::transfer_keep_alive(dest, value)`
    pub fn transfer_keep_alive(
        profile: &NetworkProfile,
        recipient: &str,
        amount: u128,
    ) -> Result<Self, CallError> {
        if amount == 0 {
            return Err(CallError::ZeroAmount);
        }
        let dest = decode_recipient(recipient, profile.address_prefix)?;

        let mut bytes = call_header(profile.calls.transfer_keep_alive);
        bytes.push(MULTI_ADDRESS_ID);
        bytes.extend_from_slice(AsRef::<[u8]>::as_ref(&dest));
        Compact(amount).encode_to(&mut bytes);

        Self::new(
            bytes,
            format!("balances.transferKeepAlive(dest: {recipient}, value: {amount})"),
        )
    }

    /// `Staking::bond_extra(max_additional)`
    pub fn bond_extra(profile: &NetworkProfile, amount: u128) -> Result<Self, CallError> {
        if amount == 0 {
            return Err(CallError::ZeroAmount);
        }

        let mut bytes = call_header(profile.calls.bond_extra);
        Compact(amount).encode_to(&mut bytes);

        Self::new(bytes, format!("staking.bondExtra(max_additional: {amount})"))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for CallPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [0x{}]", self.description, hex::encode(&self.bytes))
    }
}

fn call_header(index: CallIndex) -> Vec<u8> {
    vec![index.pallet, index.call]
}

fn decode_recipient(address: &str, expected_prefix: u16) -> Result<AccountId32, CallError> {
    let (account, format) = AccountId32::from_ss58check_with_version(address).map_err(|e| {
        CallError::InvalidRecipient {
            address: address.to_string(),
            reason: format!("{e:?}"),
        }
    })?;

    let found = u16::from(format);
    if found != expected_prefix {
        return Err(CallError::WrongNetwork {
            address: address.to_string(),
            found,
            expected: expected_prefix,
        });
    }
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkRegistry;

    const RECIPIENT: &str = "15yiimjp4dMoR2kDYCqL53R9ugtnpAqfosV9M7nhKK1YTGP9";

    #[test]
    fn transfer_keep_alive_layout() {
        let registry = NetworkRegistry::default();
        let profile = registry.lookup("polkadot").unwrap();
        let call = CallPayload::transfer_keep_alive(profile, RECIPIENT, 3_720_000_000_000).unwrap();

        let (dest, _) = AccountId32::from_ss58check_with_version(RECIPIENT).unwrap();
        let bytes = call.bytes();
        assert_eq!(&bytes[..3], &[5, 3, MULTI_ADDRESS_ID]);
        assert_eq!(&bytes[3..35], AsRef::<[u8]>::as_ref(&dest));
        assert_eq!(&bytes[35..], Compact(3_720_000_000_000u128).encode().as_slice());
        assert!(call.description().contains("transferKeepAlive"));
    }

    #[test]
    fn bond_extra_layout() {
        let registry = NetworkRegistry::default();
        let profile = registry.lookup("kusama").unwrap();
        let call = CallPayload::bond_extra(profile, 1_000).unwrap();

        let mut expected = vec![6, 1];
        Compact(1_000u128).encode_to(&mut expected);
        assert_eq!(call.bytes(), expected.as_slice());
    }

    #[test]
    fn recipient_must_match_network_prefix() {
        let registry = NetworkRegistry::default();
        let kusama = registry.lookup("kusama").unwrap();
        assert_eq!(
            CallPayload::transfer_keep_alive(kusama, RECIPIENT, 1),
            Err(CallError::WrongNetwork {
                address: RECIPIENT.to_string(),
                found: 0,
                expected: 2,
            })
        );
    }

    #[test]
    fn rejects_garbage_and_zero_amounts() {
        let registry = NetworkRegistry::default();
        let polkadot = registry.lookup("polkadot").unwrap();
        assert!(matches!(
            CallPayload::transfer_keep_alive(polkadot, "not-an-address", 1),
            Err(CallError::InvalidRecipient { .. })
        ));
        assert_eq!(
            CallPayload::bond_extra(polkadot, 0),
            Err(CallError::ZeroAmount)
        );
        assert_eq!(CallPayload::new(Vec::new(), "nothing"), Err(CallError::Empty));
    }
}
