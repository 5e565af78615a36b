//! Parameter blocks for model, Monte Carlo, replica exchange and logging.
//!
//! Each block knows how to validate itself and how to render itself as a
//! metadata map for `info.dat` and the output file headers. The `specified`
//! sets record which keys were actually given on the command line or in the
//! configuration file, mirroring how required-parameter checks and resume
//! bookkeeping work.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SimError};
use crate::meta::MetadataMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GreenUpdateType {
    /// Plain wrap multiplications, no re-stabilization.
    Simple,
    /// Wraps plus periodic UDV re-stabilization.
    Stabilized,
}

impl FromStr for GreenUpdateType {
    type Err = SimError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(GreenUpdateType::Simple),
            "stabilized" => Ok(GreenUpdateType::Stabilized),
            other => Err(SimError::Configuration(format!(
                "unknown greenUpdateType '{other}', expected 'simple' or 'stabilized'"
            ))),
        }
    }
}

impl std::fmt::Display for GreenUpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GreenUpdateType::Simple => write!(f, "simple"),
            GreenUpdateType::Stabilized => write!(f, "stabilized"),
        }
    }
}

/// Model parameters for the lattice fermion model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub l: u32,
    pub beta: f64,
    pub m: u32,
    pub dtau: f64,
    pub mu: f64,
    /// Tuning parameter of the bosonic action (the usual control parameter).
    pub r: f64,
    /// Quartic coupling of the bosonic action.
    pub u: f64,
    /// Bare bosonic velocity entering the temporal gradient term.
    pub c: f64,
    /// Target acceptance ratio for the adaptive proposal width.
    pub acc_ratio: f64,
    /// Stabilization interval in time slices; must divide m.
    pub s: u32,
    pub checkerboard: bool,
    pub timedisplaced: bool,
    pub specified: BTreeSet<String>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "sdw".into(),
            l: 0,
            beta: 0.0,
            m: 0,
            dtau: 0.0,
            mu: 0.0,
            r: 0.0,
            u: 1.0,
            c: 1.0,
            acc_ratio: 0.5,
            s: 0,
            checkerboard: false,
            timedisplaced: false,
            specified: BTreeSet::new(),
        }
    }
}

impl ModelParams {
    /// Derive the third of {beta, m, dtau} from the two that were given.
    ///
    /// All three given is accepted if consistent; fewer than two is a
    /// configuration error.
    pub fn complete_temperature(&mut self) -> Result<()> {
        let has = |k: &str| self.specified.contains(k);
        match (has("beta"), has("m"), has("dtau")) {
            (true, true, true) => {
                if (self.beta - f64::from(self.m) * self.dtau).abs() > 1e-10 {
                    return Err(SimError::Configuration(format!(
                        "beta = {} inconsistent with m * dtau = {}",
                        self.beta,
                        f64::from(self.m) * self.dtau
                    )));
                }
            }
            (true, true, false) => {
                self.dtau = self.beta / f64::from(self.m);
            }
            (true, false, true) => {
                self.m = (self.beta / self.dtau).round() as u32;
                if self.m == 0 {
                    return Err(SimError::Configuration(
                        "beta / dtau rounds to zero time slices".into(),
                    ));
                }
                self.dtau = self.beta / f64::from(self.m);
            }
            (false, true, true) => {
                self.beta = f64::from(self.m) * self.dtau;
            }
            _ => {
                return Err(SimError::Configuration(
                    "at least two of beta, m, dtau must be specified".into(),
                ));
            }
        }
        // Default stabilization interval: the largest value <= 10 dividing m.
        if self.s == 0 {
            let mut s = self.m.min(10);
            while self.m % s != 0 {
                s -= 1;
            }
            self.s = s;
        }
        Ok(())
    }

    pub fn check(&self) -> Result<()> {
        for key in ["L", "r", "mu", "accRatio"] {
            if !self.specified.contains(key) {
                return Err(SimError::ParameterMissing(key.into()));
            }
        }
        if self.model != "sdw" && self.model != "hubbard" {
            return Err(SimError::Configuration(format!(
                "unknown model '{}'",
                self.model
            )));
        }
        if self.l < 2 {
            return Err(SimError::Configuration(format!(
                "linear lattice size L = {} is too small",
                self.l
            )));
        }
        if self.checkerboard && self.l % 2 != 0 {
            return Err(SimError::Configuration(
                "checkerboard decomposition only supported for even linear lattice sizes".into(),
            ));
        }
        if self.m < 2 {
            return Err(SimError::Configuration(format!(
                "need at least two time slices, got m = {}",
                self.m
            )));
        }
        if self.s == 0 || self.m % self.s != 0 {
            return Err(SimError::Configuration(format!(
                "stabilization interval s = {} must divide m = {}",
                self.s, self.m
            )));
        }
        if !(0.0 < self.acc_ratio && self.acc_ratio < 1.0) {
            return Err(SimError::Configuration(format!(
                "accRatio = {} outside (0, 1)",
                self.acc_ratio
            )));
        }
        Ok(())
    }

    pub fn metadata(&self) -> MetadataMap {
        let n = self.l * self.l;
        let mut meta = MetadataMap::new();
        meta.insert("model".into(), self.model.clone());
        meta.insert("checkerboard".into(), self.checkerboard.to_string());
        meta.insert("timedisplaced".into(), self.timedisplaced.to_string());
        meta.insert("targetAccRatio".into(), self.acc_ratio.to_string());
        meta.insert("r".into(), self.r.to_string());
        meta.insert("u".into(), self.u.to_string());
        meta.insert("c".into(), self.c.to_string());
        meta.insert("mu".into(), self.mu.to_string());
        meta.insert("L".into(), self.l.to_string());
        meta.insert("d".into(), "2".into());
        meta.insert("N".into(), n.to_string());
        meta.insert("beta".into(), self.beta.to_string());
        meta.insert("m".into(), self.m.to_string());
        meta.insert("dtau".into(), self.dtau.to_string());
        meta.insert("s".into(), self.s.to_string());
        meta
    }

    /// Mark every scalar field as explicitly specified (used by tests and by
    /// the resume path, which trusts the archived values).
    pub fn mark_all_specified(&mut self) {
        for key in [
            "model", "L", "beta", "m", "dtau", "mu", "r", "u", "c", "accRatio", "s",
            "checkerboard", "timedisplaced",
        ] {
            self.specified.insert(key.into());
        }
    }
}

/// Monte Carlo driver parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McParams {
    pub sweeps: u32,
    pub thermalization: u32,
    pub jk_blocks: u32,
    pub timeseries: bool,
    pub measure_interval: u32,
    /// Sweeps between checkpoints; 0 = save only when finishing.
    pub save_interval: u32,
    pub rng_seed: Option<u32>,
    pub sim_index: u32,
    pub green_update_type: GreenUpdateType,
    pub state_file_name: String,
    pub save_configuration_stream_text: bool,
    pub save_configuration_stream_binary: bool,
    pub save_configuration_stream_interval: u32,
    pub output_directory: PathBuf,
    pub sweeps_has_changed: bool,
    pub specified: BTreeSet<String>,
}

impl Default for McParams {
    fn default() -> Self {
        Self {
            sweeps: 0,
            thermalization: 0,
            jk_blocks: 1,
            timeseries: false,
            measure_interval: 1,
            save_interval: 0,
            rng_seed: None,
            sim_index: 0,
            green_update_type: GreenUpdateType::Stabilized,
            state_file_name: "simulation.state.json".into(),
            save_configuration_stream_text: false,
            save_configuration_stream_binary: false,
            save_configuration_stream_interval: 1,
            output_directory: PathBuf::from("."),
            sweeps_has_changed: false,
            specified: BTreeSet::new(),
        }
    }
}

impl McParams {
    pub fn check(&self) -> Result<()> {
        if self.measure_interval == 0 {
            return Err(SimError::Configuration(
                "measureInterval must be at least 1".into(),
            ));
        }
        if self.jk_blocks == 0 {
            return Err(SimError::Configuration(
                "jkBlocks must be at least 1".into(),
            ));
        }
        if self.save_configuration_stream_interval == 0 {
            return Err(SimError::Configuration(
                "saveConfigurationStreamInterval must be at least 1".into(),
            ));
        }
        if self.save_configuration_stream_interval % self.measure_interval != 0 {
            return Err(SimError::Configuration(
                "saveConfigurationStreamInterval must be a multiple of measureInterval".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata(&self) -> MetadataMap {
        let mut meta = MetadataMap::new();
        meta.insert("sweeps".into(), self.sweeps.to_string());
        meta.insert("thermalization".into(), self.thermalization.to_string());
        meta.insert("jkBlocks".into(), self.jk_blocks.to_string());
        meta.insert("timeseries".into(), self.timeseries.to_string());
        meta.insert("measureInterval".into(), self.measure_interval.to_string());
        meta.insert("saveInterval".into(), self.save_interval.to_string());
        if let Some(seed) = self.rng_seed {
            meta.insert("rngSeed".into(), seed.to_string());
        }
        meta.insert("simindex".into(), self.sim_index.to_string());
        meta.insert(
            "greenUpdateType".into(),
            self.green_update_type.to_string(),
        );
        meta.insert("stateFileName".into(), self.state_file_name.clone());
        meta
    }

    /// State file path for one process; with several processes each rank gets
    /// its own file derived from the configured name.
    pub fn state_file_for_rank(&self, num_processes: usize, rank: usize) -> PathBuf {
        let name = if num_processes <= 1 {
            self.state_file_name.clone()
        } else {
            match self.state_file_name.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}.p{rank}.{ext}"),
                None => format!("{}.p{rank}", self.state_file_name),
            }
        };
        self.output_directory.join(name)
    }
}

/// Replica-exchange parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PtParams {
    pub control_parameter_name: String,
    pub control_parameter_values: Vec<f64>,
    /// Sweeps between exchange rounds; 0 disables exchange entirely.
    pub exchange_interval: u32,
}

impl PtParams {
    pub fn check(&self) -> Result<()> {
        if self.control_parameter_values.is_empty() {
            return Err(SimError::Configuration(
                "controlParameterValues must not be empty".into(),
            ));
        }
        if self.control_parameter_values.len() > 1 && self.control_parameter_name.is_empty() {
            return Err(SimError::Configuration(
                "controlParameterName must be set for replica exchange".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata(&self) -> MetadataMap {
        let mut meta = MetadataMap::new();
        meta.insert(
            "controlParameterName".into(),
            self.control_parameter_name.clone(),
        );
        meta.insert(
            "controlParameterValues".into(),
            self.control_parameter_values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        );
        meta.insert(
            "exchangeInterval".into(),
            self.exchange_interval.to_string(),
        );
        meta
    }

    /// Output subdirectory for one control-parameter index.
    pub fn subdir(&self, cpi: usize) -> String {
        format!(
            "p{}_{}{}",
            cpi, self.control_parameter_name, self.control_parameter_values[cpi]
        )
    }
}

/// Numerical-consistency logging switches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingParams {
    /// Log the wrapped-vs-fresh Green's function deviation at every
    /// stabilization point.
    pub log_green_consistency: bool,
    pub logfiledir: PathBuf,
    /// Relative deviation above which a stabilization is flagged.
    pub green_tolerance: f64,
}

impl Default for LoggingParams {
    fn default() -> Self {
        Self {
            log_green_consistency: false,
            logfiledir: PathBuf::from("."),
            green_tolerance: 1e-6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_model() -> ModelParams {
        let mut p = ModelParams {
            l: 4,
            beta: 1.0,
            m: 10,
            dtau: 0.1,
            mu: 0.5,
            r: -1.0,
            acc_ratio: 0.5,
            ..ModelParams::default()
        };
        p.mark_all_specified();
        p
    }

    #[test]
    fn temperature_completion_fills_dtau() {
        let mut p = base_model();
        p.specified.remove("dtau");
        p.complete_temperature().unwrap();
        assert!((p.dtau - 0.1).abs() < 1e-14);
    }

    #[test]
    fn temperature_completion_rejects_single_value() {
        let mut p = base_model();
        p.specified.remove("dtau");
        p.specified.remove("m");
        assert!(p.complete_temperature().is_err());
    }

    #[test]
    fn checkerboard_needs_even_l() {
        let mut p = base_model();
        p.l = 5;
        p.checkerboard = true;
        p.complete_temperature().unwrap();
        assert!(p.check().is_err());
    }

    #[test]
    fn default_stabilization_interval_divides_m() {
        let mut p = base_model();
        p.m = 12;
        p.dtau = 1.0 / 12.0;
        p.s = 0;
        p.complete_temperature().unwrap();
        assert_eq!(p.m % p.s, 0);
        assert!(p.s <= 10);
    }

    #[test]
    fn state_file_names_are_distinct_per_rank() {
        let mc = McParams::default();
        let a = mc.state_file_for_rank(4, 0);
        let b = mc.state_file_for_rank(4, 1);
        assert_ne!(a, b);
        assert!(b.to_string_lossy().contains("p1"));
    }
}
