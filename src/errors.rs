//! Error taxonomy for the simulation core.
//!
//! Everything that can go wrong is surfaced to the top of the run loop;
//! nothing here participates in Monte Carlo acceptance decisions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Missing or inconsistent parameters, detected at initialization.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required parameter was not specified at all.
    #[error("missing required parameter: {0}")]
    ParameterMissing(String),

    /// State archive could not be written, read or understood.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Loss of numerical integrity that stabilization cannot repair.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Replica-exchange bookkeeping disagrees with the replicas.
    #[error("replica-exchange consistency error: {0}")]
    Consistency(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
