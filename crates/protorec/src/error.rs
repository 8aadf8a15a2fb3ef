//! Error types for prototype recovery.
//!
//! Only conditions that make the current analysis attempt meaningless are
//! errors. A trial that cannot be classified, or a prototype that cannot be
//! narrowed safely, is reported through trial status, a `bool` return or the
//! restart flag on [`Funcdata`](protorec_core::Funcdata) instead.

use thiserror::Error;

/// Errors raised while building models or recovering prototypes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// The ABI description is malformed. Raised while a model is built.
    #[error("badly specified ABI: {0}")]
    BadAbi(String),

    /// Analysis state contradicts itself; the current attempt must stop.
    #[error("inconsistent recovery state: {0}")]
    Inconsistent(String),

    /// An operation needs a prototype model and none is attached.
    #[error("prototype has no model")]
    MissingModel,

    /// A graph edit failed.
    #[error(transparent)]
    Core(#[from] protorec_core::Error),
}

impl ProtoError {
    pub(crate) fn bad_abi(msg: impl Into<String>) -> Self {
        Self::BadAbi(msg.into())
    }

    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }
}

/// Result alias for recovery operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use protorec_core::OpId;

    #[test]
    fn test_display() {
        let err = ProtoError::bad_abi("illegal overlap");
        assert_eq!(err.to_string(), "badly specified ABI: illegal overlap");

        let core: ProtoError = protorec_core::Error::DeadOp(OpId(4)).into();
        assert_eq!(core.to_string(), "op4 has been destroyed");
    }
}
