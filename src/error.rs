// src/error.rs
//
// Error taxonomy shared by the collaborators and the signing orchestrator.
// Every variant is terminal for the run that produced it; recovery is left to
// the caller.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),

    /// The device session could not be opened or the app is not running.
    #[error("external signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("address derivation failed for {path}: {reason}")]
    DerivationFailed { path: String, reason: String },

    #[error("chain unreachable: {0}")]
    ChainUnreachable(String),

    #[error("metadata service error: {0}")]
    MetadataServiceError(String),

    #[error("malformed signing context: {0}")]
    MalformedContext(String),

    #[error("transaction rejected on the device")]
    UserRejectedOnDevice,

    #[error("external signer timed out")]
    SignerTimeout,

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    /// The submission may still be included later.
    #[error("no terminal status within {0:?}")]
    TimedOut(Duration),
}

impl SigningError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        SigningError::MalformedContext(reason.into())
    }

    pub fn chain(err: impl std::fmt::Display) -> Self {
        SigningError::ChainUnreachable(err.to_string())
    }

    pub fn metadata(err: impl std::fmt::Display) -> Self {
        SigningError::MetadataServiceError(err.to_string())
    }

    /// Short stable name, used in logs and for exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            SigningError::UnknownNetwork(_) => "UnknownNetwork",
            SigningError::SignerUnavailable(_) => "SignerUnavailable",
            SigningError::DerivationFailed { .. } => "DerivationFailed",
            SigningError::ChainUnreachable(_) => "ChainUnreachable",
            SigningError::MetadataServiceError(_) => "MetadataServiceError",
            SigningError::MalformedContext(_) => "MalformedContext",
            SigningError::UserRejectedOnDevice => "UserRejectedOnDevice",
            SigningError::SignerTimeout => "SignerTimeout",
            SigningError::SubmissionRejected(_) => "SubmissionRejected",
            SigningError::TimedOut(_) => "TimedOut",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_taxonomy_names() {
        assert_eq!(SigningError::UserRejectedOnDevice.kind(), "UserRejectedOnDevice");
        assert_eq!(
            SigningError::TimedOut(Duration::from_secs(120)).kind(),
            "TimedOut"
        );
        assert_eq!(SigningError::malformed("x").kind(), "MalformedContext");
    }

    #[test]
    fn display_carries_detail() {
        let err = SigningError::DerivationFailed {
            path: "m/44'/354'/0'/0'/4'".to_string(),
            reason: "bad key handle".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "address derivation failed for m/44'/354'/0'/0'/4': bad key handle"
        );
    }
}
