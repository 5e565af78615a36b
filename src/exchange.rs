//! Replica-exchange statistics kept at rank 0: swap acceptance histograms
//! and the up/down diffusion of replicas through control-parameter space.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::meta::{IntDoubleMapWriter, MetadataMap};

/// Which extreme of the parameter ladder a replica touched last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterDirection {
    None,
    Up,
    Down,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExchangeStatistics {
    /// Per parameter index c: swaps of (c, c+1) proposed resp. accepted.
    pub swap_up_proposed: Vec<u64>,
    pub swap_up_accepted: Vec<u64>,
    /// Per process: direction label from the last extreme visited.
    pub process_going_where: Vec<ParameterDirection>,
    /// Per parameter index: how often an up-moving resp. down-moving replica
    /// sat there at an exchange round.
    pub count_going_up: Vec<u64>,
    pub count_going_down: Vec<u64>,
}

impl ExchangeStatistics {
    pub fn new(num_pars: usize) -> Self {
        Self {
            swap_up_proposed: vec![0; num_pars],
            swap_up_accepted: vec![0; num_pars],
            process_going_where: vec![ParameterDirection::None; num_pars],
            count_going_up: vec![0; num_pars],
            count_going_down: vec![0; num_pars],
        }
    }

    /// Update the diffusion histograms from the current process ↔ parameter
    /// assignment, before the swap pass of an exchange round.
    pub fn record_directions(&mut self, par_of_process: &[usize]) {
        let top = par_of_process.len() - 1;
        for (process, &cpi) in par_of_process.iter().enumerate() {
            if cpi == top && top > 0 {
                self.process_going_where[process] = ParameterDirection::Down;
            } else if cpi == 0 {
                self.process_going_where[process] = ParameterDirection::Up;
            }
            match self.process_going_where[process] {
                ParameterDirection::Up => self.count_going_up[cpi] += 1,
                ParameterDirection::Down => self.count_going_down[cpi] += 1,
                ParameterDirection::None => {}
            }
        }
    }

    /// Write `exchange-parameters.values`, `exchange-acceptance.values` and
    /// `exchange-diffusion.values` into `dir`.
    pub fn write_files(
        &self,
        dir: &Path,
        control_parameter_values: &[f64],
        meta: &MetadataMap,
    ) -> Result<()> {
        let num_pars = control_parameter_values.len();

        let mut base = IntDoubleMapWriter::new();
        base.add_metadata_map(meta);
        base.add_meta("key", "control parameter index");

        let parameters: BTreeMap<usize, f64> = control_parameter_values
            .iter()
            .copied()
            .enumerate()
            .collect();
        let mut w = base.clone();
        w.add_header_text("Control parameter values");
        w.add_header_text("control parameter index \t control parameter value");
        w.write_to_file(&dir.join("exchange-parameters.values"), &parameters)?;

        let mut acceptance = BTreeMap::new();
        for c in 0..num_pars {
            let proposed = self.swap_up_proposed[c];
            let rate = if proposed > 0 {
                self.swap_up_accepted[c] as f64 / proposed as f64
            } else {
                0.0
            };
            acceptance.insert(c, rate);
        }
        let mut w = base.clone();
        w.add_header_text("Acceptance ratio of exchanging replicas at control parameters (upwards)");
        w.add_header_text("control parameter index \t acceptance ratio");
        w.write_to_file(&dir.join("exchange-acceptance.values"), &acceptance)?;

        let mut diffusion = BTreeMap::new();
        for c in 0..num_pars {
            let up = self.count_going_up[c];
            let down = self.count_going_down[c];
            let fraction = if up + down > 0 {
                up as f64 / (up + down) as f64
            } else {
                0.0
            };
            diffusion.insert(c, fraction);
        }
        let mut w = base;
        w.add_header_text("Diffusion fraction of replicas at control parameters: df = nUp / (nUp + nDown)");
        w.add_header_text("control parameter index \t diffusion fraction");
        w.write_to_file(&dir.join("exchange-diffusion.values"), &diffusion)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flips_only_at_the_extremes() {
        let mut es = ExchangeStatistics::new(3);
        // process 0 sits at the bottom, process 2 at the top
        es.record_directions(&[0, 1, 2]);
        assert_eq!(es.process_going_where[0], ParameterDirection::Up);
        assert_eq!(es.process_going_where[1], ParameterDirection::None);
        assert_eq!(es.process_going_where[2], ParameterDirection::Down);
        assert_eq!(es.count_going_up, vec![1, 0, 0]);
        assert_eq!(es.count_going_down, vec![0, 0, 1]);

        // process 0 moved to the middle but keeps its Up label
        es.record_directions(&[1, 0, 2]);
        assert_eq!(es.process_going_where[0], ParameterDirection::Up);
        assert_eq!(es.count_going_up, vec![2, 1, 0]);
    }

    #[test]
    fn single_parameter_ladder_never_labels_down() {
        let mut es = ExchangeStatistics::new(1);
        es.record_directions(&[0]);
        assert_eq!(es.process_going_where[0], ParameterDirection::Up);
        assert_eq!(es.count_going_up, vec![1]);
        assert_eq!(es.count_going_down, vec![0]);
    }
}
