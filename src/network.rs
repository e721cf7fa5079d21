// src/network.rs
//
// Network profile registry: network name -> chain identifier, RPC endpoint,
// address prefix and the call indices of the calls this tool can build.
// The registry is a plain value handed to the orchestrator, so tests and
// deployments can substitute their own table.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;

use crate::error::SigningError;

/// Pallet and call index of a dispatchable, as laid out by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIndex {
    pub pallet: u8,
    pub call: u8,
}

impl CallIndex {
    pub const fn new(pallet: u8, call: u8) -> Self {
        Self { pallet, call }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIndices {
    /// `Balances::transfer_keep_alive`
    pub transfer_keep_alive: CallIndex,
    /// `Staking::bond_extra`
    pub bond_extra: CallIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Identifier understood by the metadata service (e.g. `dot`).
    pub chain_id: String,
    pub rpc_endpoint: String,
    /// SS58 address format prefix.
    pub address_prefix: u16,
    /// Base URL of the metadata digest / metadata proof service.
    pub metadata_service_url: String,
    pub calls: CallIndices,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read network table: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid network table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chain id `{chain_id}` is used by both `{first}` and `{second}`")]
    DuplicateChainId {
        chain_id: String,
        first: String,
        second: String,
    },
    #[error("network table is empty")]
    Empty,
}

/// Immutable table of supported networks, keyed by network name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkRegistry {
    networks: BTreeMap<String, NetworkProfile>,
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "polkadot".to_string(),
            NetworkProfile {
                chain_id: "dot".to_string(),
                rpc_endpoint: "wss://polkadot-rpc.publicnode.com".to_string(),
                address_prefix: 0,
                metadata_service_url: "https://api.zondax.ch/polkadot".to_string(),
                calls: CallIndices {
                    transfer_keep_alive: CallIndex::new(5, 3),
                    bond_extra: CallIndex::new(7, 1),
                },
            },
        );
        networks.insert(
            "kusama".to_string(),
            NetworkProfile {
                chain_id: "ksm".to_string(),
                rpc_endpoint: "wss://kusama-rpc.publicnode.com".to_string(),
                address_prefix: 2,
                metadata_service_url: "https://api.zondax.ch/kusama".to_string(),
                calls: CallIndices {
                    transfer_keep_alive: CallIndex::new(4, 3),
                    bond_extra: CallIndex::new(6, 1),
                },
            },
        );
        Self { networks }
    }
}

impl NetworkRegistry {
    /// Builds a registry, rejecting tables where two networks share a chain id.
    pub fn new(networks: BTreeMap<String, NetworkProfile>) -> Result<Self, RegistryError> {
        if networks.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, profile) in &networks {
            if let Some(first) = seen.insert(profile.chain_id.as_str(), name.as_str()) {
                return Err(RegistryError::DuplicateChainId {
                    chain_id: profile.chain_id.clone(),
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
        }

        Ok(Self { networks })
    }

    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let networks: BTreeMap<String, NetworkProfile> = serde_json::from_str(json)?;
        Self::new(networks)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn lookup(&self, network_name: &str) -> Result<&NetworkProfile, SigningError> {
        self.networks
            .get(network_name)
            .ok_or_else(|| SigningError::UnknownNetwork(network_name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }
}
