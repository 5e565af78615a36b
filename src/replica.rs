//! The contract between the run loop / exchange coordinator and a concrete
//! model replica, plus the tagged sum over the supported model kinds.
//!
//! Serialization of "the replica" goes through `ReplicaContents`: a closed
//! enum whose tag is carried by the archive itself, so resuming a state file
//! that was written for a different model kind fails loudly instead of
//! reinterpreting bytes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SimError};
use crate::meta::MetadataMap;
use crate::params::{LoggingParams, ModelParams};
use crate::rng::SimRng;
use crate::sdw::{SdwContents, SdwModel};

/// A scalar observable sample: name, file short name, current value.
#[derive(Clone, Debug)]
pub struct ScalarObs {
    pub name: String,
    pub short: String,
    pub value: f64,
}

/// A vector observable sample (fixed length across the run).
#[derive(Clone, Debug)]
pub struct VectorObs {
    pub name: String,
    pub short: String,
    pub values: Vec<f64>,
}

/// A key/value observable sample: values tabulated against explicit keys.
#[derive(Clone, Debug)]
pub struct KeyValueObs {
    pub name: String,
    pub short: String,
    pub key_name: String,
    pub keys: Vec<f64>,
    pub values: Vec<f64>,
}

/// What the sweep engine and the exchange coordinator need from a model.
pub trait Replica {
    fn sweep_simple(&mut self, take_measurement: bool) -> Result<()>;
    fn sweep(&mut self, take_measurement: bool) -> Result<()>;
    fn sweep_simple_thermalization(&mut self) -> Result<()>;
    fn sweep_thermalization(&mut self) -> Result<()>;

    fn scalar_observables(&self) -> Vec<ScalarObs>;
    fn vector_observables(&self) -> Vec<VectorObs>;
    fn key_value_observables(&self) -> Vec<KeyValueObs>;
    fn model_metadata(&self) -> MetadataMap;

    fn set_exchange_parameter_value(&mut self, value: f64);
    fn exchange_parameter_value(&self) -> f64;
    fn exchange_action_contribution(&self) -> f64;
    /// Acceptance probability for swapping the control parameters of two
    /// replicas with the given exchange-action contributions.
    fn exchange_probability(&self, par1: f64, action1: f64, par2: f64, action2: f64) -> f64;

    /// Opaque tunable state that travels with the control parameter on an
    /// accepted exchange (the proposal width, for the SDW model).
    fn control_data(&self) -> Vec<u8>;
    fn set_control_data(&mut self, data: &[u8]) -> Result<()>;

    fn thermalization_over(&mut self, process_index: usize);

    /// Flat snapshot of the current system configuration for the
    /// configuration stream.
    fn system_configuration(&self) -> Vec<f64>;

    fn save_contents(&self) -> ReplicaContents;
    fn load_contents(&mut self, contents: ReplicaContents) -> Result<()>;
}

/// Serialized replica payload; the enum tag names the model kind.
#[derive(Clone, Serialize, Deserialize)]
pub enum ReplicaContents {
    Sdw(Box<SdwContents>),
}

/// The supported model kinds.
pub enum ReplicaKind {
    Sdw(SdwModel),
}

impl ReplicaKind {
    pub fn as_replica(&self) -> &dyn Replica {
        match self {
            ReplicaKind::Sdw(m) => m,
        }
    }

    pub fn as_replica_mut(&mut self) -> &mut dyn Replica {
        match self {
            ReplicaKind::Sdw(m) => m,
        }
    }
}

/// Instantiate the replica a process owns, per the model parameters.
pub fn create_replica(
    pars: &ModelParams,
    logging: &LoggingParams,
    rng: SimRng,
    process_index: usize,
) -> Result<ReplicaKind> {
    match pars.model.as_str() {
        "sdw" => Ok(ReplicaKind::Sdw(SdwModel::new(
            pars,
            logging,
            rng,
            process_index,
        )?)),
        other => Err(SimError::Configuration(format!(
            "model '{other}' is not supported by this build"
        ))),
    }
}
