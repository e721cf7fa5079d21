// src/derivation.rs
//
// BIP44 derivation path for Substrate keys held by the Ledger device:
// m/44'/354'/account'/change'/index'
//
// The same path value must be used for address derivation and for signing,
// so it is a small `Copy` value that the orchestrator threads through both
// calls unchanged.

use std::{fmt, str::FromStr};
use thiserror::Error;

pub const PURPOSE: u32 = 44;
pub const COIN_TYPE: u32 = 354;
pub const HARDENED: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationPathError {
    #[error("path must start with `m/`")]
    MissingRoot,
    #[error("expected 5 path segments, found {0}")]
    SegmentCount(usize),
    #[error("segment `{0}` is not a number")]
    NotANumber(String),
    #[error("segment {0} must be hardened")]
    NotHardened(usize),
    #[error("segment value {0} does not fit below the hardened offset")]
    OutOfRange(u32),
    #[error("expected purpose 44' and coin type 354', found {purpose}'/{coin_type}'")]
    WrongPrefix { purpose: u32, coin_type: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    pub account: u32,
    pub change: u32,
    pub address_index: u32,
    /// The Ledger Substrate apps expect a hardened leaf; other signers may not.
    pub hardened_index: bool,
}

impl DerivationPath {
    pub fn new(account: u32, change: u32, address_index: u32) -> Result<Self, DerivationPathError> {
        for value in [account, change, address_index] {
            if value >= HARDENED {
                return Err(DerivationPathError::OutOfRange(value));
            }
        }
        Ok(Self {
            account,
            change,
            address_index,
            hardened_index: true,
        })
    }

    /// Path used by the CLI: account type selects the account segment, change is 0.
    pub fn for_account(account_type: u32, address_index: u32) -> Result<Self, DerivationPathError> {
        Self::new(account_type, 0, address_index)
    }

    pub fn segments(&self) -> [u32; 5] {
        let leaf = if self.hardened_index {
            self.address_index | HARDENED
        } else {
            self.address_index
        };
        [
            PURPOSE | HARDENED,
            COIN_TYPE | HARDENED,
            self.account | HARDENED,
            self.change | HARDENED,
            leaf,
        ]
    }

    /// Serialized form sent to the device: five little-endian u32 values.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (chunk, segment) in out.chunks_exact_mut(4).zip(self.segments()) {
            chunk.copy_from_slice(&segment.to_le_bytes());
        }
        out
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'/{}'/{}",
            PURPOSE, COIN_TYPE, self.account, self.change, self.address_index
        )?;
        if self.hardened_index {
            write!(f, "'")?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = DerivationPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("m/").ok_or(DerivationPathError::MissingRoot)?;
        let raw: Vec<&str> = rest.split('/').collect();
        if raw.len() != 5 {
            return Err(DerivationPathError::SegmentCount(raw.len()));
        }

        let mut values = [0u32; 5];
        let mut hardened = [false; 5];
        for (i, segment) in raw.iter().enumerate() {
            let (digits, is_hardened) = match segment.strip_suffix('\'') {
                Some(digits) => (digits, true),
                None => (*segment, false),
            };
            let value: u32 = digits
                .parse()
                .map_err(|_| DerivationPathError::NotANumber(segment.to_string()))?;
            if value >= HARDENED {
                return Err(DerivationPathError::OutOfRange(value));
            }
            // only the leaf may be soft
            if !is_hardened && i < 4 {
                return Err(DerivationPathError::NotHardened(i));
            }
            values[i] = value;
            hardened[i] = is_hardened;
        }

        if values[0] != PURPOSE || values[1] != COIN_TYPE {
            return Err(DerivationPathError::WrongPrefix {
                purpose: values[0],
                coin_type: values[1],
            });
        }

        Ok(Self {
            account: values[2],
            change: values[3],
            address_index: values[4],
            hardened_index: hardened[4],
        })
    }
}
