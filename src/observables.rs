//! Observable handlers for replica-exchange runs.
//!
//! Every measurement, each process samples its replica and the handlers
//! gather the values to rank 0, where they are binned by the control
//! parameter the sampling replica currently carries. Rank 0 owns the
//! per-parameter time series and averaged tables; the other ranks only
//! contribute through the gathers.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::errors::Result;
use crate::meta::{DataSeriesWriter, IntDoubleMapWriter, MetadataMap};

/// Mean and error of a time series using `blocks` jackknife blocks.
pub fn jackknife_blocked(data: &[f64], blocks: u32) -> (f64, f64) {
    let n = data.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = data.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let b = (blocks as usize).clamp(1, n);
    if b < 2 {
        // plain standard error of the mean
        let var = data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        return (mean, (var / n as f64).sqrt());
    }

    // leave-one-block-out estimates over contiguous blocks
    let total: f64 = data.iter().sum();
    let mut jack = Vec::with_capacity(b);
    let base = n / b;
    let extra = n % b;
    let mut start = 0usize;
    for i in 0..b {
        let len = base + usize::from(i < extra);
        let block_sum: f64 = data[start..start + len].iter().sum();
        jack.push((total - block_sum) / (n - len) as f64);
        start += len;
    }
    let jack_mean = jack.iter().sum::<f64>() / b as f64;
    let jack_var =
        jack.iter().map(|&x| (x - jack_mean).powi(2)).sum::<f64>() * (b as f64 - 1.0) / b as f64;
    (mean, jack_var.sqrt())
}

/// Per-parameter time series of one scalar observable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalarHandlerPt {
    pub name: String,
    pub short: String,
    series: Vec<Vec<f64>>,
}

impl ScalarHandlerPt {
    pub fn new(name: &str, short: &str, num_pars: usize) -> Self {
        Self {
            name: name.into(),
            short: short.into(),
            series: vec![Vec::new(); num_pars],
        }
    }

    /// Collective: every rank contributes its sample; rank 0 bins them.
    pub fn insert_value(
        &mut self,
        value: f64,
        comm: &dyn Communicator,
        par_of_process: Option<&[usize]>,
    ) {
        if let Some(all) = comm.gather_f64(value) {
            let pop = par_of_process.expect("rank 0 must pass the parameter map");
            for (process, v) in all.into_iter().enumerate() {
                self.series[pop[process]].push(v);
            }
        }
    }

    pub fn sample_count(&self, cpi: usize) -> usize {
        self.series[cpi].len()
    }

    pub fn mean_and_error(&self, cpi: usize, jk_blocks: u32) -> (f64, f64) {
        jackknife_blocked(&self.series[cpi], jk_blocks)
    }

    pub fn write_series(&self, dir: &Path, cpi: usize, meta: &MetadataMap) -> Result<()> {
        let mut w = DataSeriesWriter::new();
        w.add_header_text(&format!("Time series of {}", self.name));
        w.add_metadata_map(meta);
        w.add_meta("observable", &self.name);
        w.write_to_file(
            &dir.join(format!("{}.series", self.short)),
            &self.series[cpi],
        )
    }
}

/// Per-parameter accumulated mean of one vector observable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorHandlerPt {
    pub name: String,
    pub short: String,
    size: usize,
    sums: Vec<Vec<f64>>,
    counts: Vec<u64>,
}

impl VectorHandlerPt {
    pub fn new(name: &str, short: &str, size: usize, num_pars: usize) -> Self {
        Self {
            name: name.into(),
            short: short.into(),
            size,
            sums: vec![vec![0.0; size]; num_pars],
            counts: vec![0; num_pars],
        }
    }

    pub fn insert_value(
        &mut self,
        values: &[f64],
        comm: &dyn Communicator,
        par_of_process: Option<&[usize]>,
    ) {
        debug_assert_eq!(values.len(), self.size);
        if let Some(all) = comm.gather_f64_vec(values) {
            let pop = par_of_process.expect("rank 0 must pass the parameter map");
            for (process, v) in all.into_iter().enumerate() {
                let cpi = pop[process];
                for (acc, x) in self.sums[cpi].iter_mut().zip(v) {
                    *acc += x;
                }
                self.counts[cpi] += 1;
            }
        }
    }

    pub fn sample_count(&self, cpi: usize) -> u64 {
        self.counts[cpi]
    }

    pub fn write_mean(&self, dir: &Path, cpi: usize, meta: &MetadataMap) -> Result<()> {
        let mut table = BTreeMap::new();
        let count = self.counts[cpi].max(1) as f64;
        for (i, &s) in self.sums[cpi].iter().enumerate() {
            table.insert(i, s / count);
        }
        let mut w = IntDoubleMapWriter::new();
        w.add_header_text(&format!("Mean of vector observable {}", self.name));
        w.add_header_text("index \t mean");
        w.add_metadata_map(meta);
        w.add_meta("observable", &self.name);
        w.add_meta("samples", self.counts[cpi]);
        w.write_to_file(&dir.join(format!("{}.values", self.short)), &table)
    }
}

/// Per-parameter accumulated mean of a key/value observable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyValueHandlerPt {
    pub name: String,
    pub short: String,
    pub key_name: String,
    keys: Vec<f64>,
    sums: Vec<Vec<f64>>,
    counts: Vec<u64>,
}

impl KeyValueHandlerPt {
    pub fn new(name: &str, short: &str, key_name: &str, keys: Vec<f64>, num_pars: usize) -> Self {
        let size = keys.len();
        Self {
            name: name.into(),
            short: short.into(),
            key_name: key_name.into(),
            keys,
            sums: vec![vec![0.0; size]; num_pars],
            counts: vec![0; num_pars],
        }
    }

    pub fn insert_value(
        &mut self,
        values: &[f64],
        comm: &dyn Communicator,
        par_of_process: Option<&[usize]>,
    ) {
        if let Some(all) = comm.gather_f64_vec(values) {
            let pop = par_of_process.expect("rank 0 must pass the parameter map");
            for (process, v) in all.into_iter().enumerate() {
                let cpi = pop[process];
                for (acc, x) in self.sums[cpi].iter_mut().zip(v) {
                    *acc += x;
                }
                self.counts[cpi] += 1;
            }
        }
    }

    pub fn write_mean(&self, dir: &Path, cpi: usize, meta: &MetadataMap) -> Result<()> {
        use std::io::Write;
        let mut file = File::create(dir.join(format!("{}.values", self.short)))?;
        writeln!(file, "## Mean of {} keyed by {}", self.name, self.key_name)?;
        file.write_all(crate::meta::metadata_lines(meta, "#").as_bytes())?;
        writeln!(file, "# observable = {}", self.name)?;
        writeln!(file, "# samples = {}", self.counts[cpi])?;
        let count = self.counts[cpi].max(1) as f64;
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        for (key, sum) in self.keys.iter().zip(&self.sums[cpi]) {
            wtr.write_record(&[key.to_string(), format!("{:.10e}", sum / count)])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        wtr.flush()?;
        Ok(())
    }
}
