//! The simulation driver: thermalization/measurement staging, periodic
//! checkpointing, replica-exchange rounds, graceful shutdown and resume.
//!
//! Every replica process runs one `DetQmcPt` around its own replica; rank 0
//! additionally owns the process ↔ parameter permutations, the exchange
//! statistics and all shared output files. Collective calls (broadcast,
//! gather, scatter, barrier) are the only cross-process suspension points
//! and are reached by all ranks in the same order.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::ProgressBar;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::errors::{Result, SimError};
use crate::exchange::ExchangeStatistics;
use crate::meta::{self, MetadataMap};
use crate::observables::{KeyValueHandlerPt, ScalarHandlerPt, VectorHandlerPt};
use crate::params::{GreenUpdateType, LoggingParams, McParams, ModelParams, PtParams};
use crate::replica::{create_replica, ReplicaContents, ReplicaKind};
use crate::rng::SimRng;
use crate::timing::Timing;

/// Stop this many minutes before the granted walltime runs out.
const SAFETY_MINUTES: u32 = 35;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Thermalization,
    Measurement,
    Finished,
}

/// On-disk state archive. The section order is part of the format.
#[derive(Serialize, Deserialize)]
struct StateArchive {
    logging: LoggingParams,
    model: ModelParams,
    mc: McParams,
    pt: PtParams,
    contents: RunContents,
}

#[derive(Serialize, Deserialize)]
struct RunContents {
    coordinator_rng: SimRng,
    scalar_handlers: Vec<ScalarHandlerPt>,
    vector_handlers: Vec<VectorHandlerPt>,
    key_value_handlers: Vec<KeyValueHandlerPt>,
    sweeps_done: u32,
    sweeps_done_thermalization: u32,
    sw_counter: u32,
    total_walltime_secs: u32,
    local_parameter_index: usize,
    par_of_process: Vec<usize>,
    process_of_par: Vec<usize>,
    exchange_statistics: ExchangeStatistics,
    replica: ReplicaContents,
}

pub struct DetQmcPt<C: Communicator> {
    pars_model: ModelParams,
    pars_mc: McParams,
    pars_pt: PtParams,
    pars_logging: LoggingParams,

    model_meta: MetadataMap,
    mc_meta: MetadataMap,
    pt_meta: MetadataMap,

    coordinator_rng: SimRng,
    replica: ReplicaKind,

    scalar_handlers: Vec<ScalarHandlerPt>,
    vector_handlers: Vec<VectorHandlerPt>,
    key_value_handlers: Vec<KeyValueHandlerPt>,

    sweeps_done: u32,
    sweeps_done_thermalization: u32,
    sw_counter: u32,

    started: Instant,
    total_walltime_secs: u32,
    walltime_at_last_save: u32,
    granted_walltime_secs: u32,
    jobid: String,

    num_processes: usize,
    process_index: usize,
    local_parameter_index: usize,

    // rank-0 bookkeeping; empty elsewhere
    par_of_process: Vec<usize>,
    process_of_par: Vec<usize>,
    exchange_action: Vec<f64>,
    process_control_data: Vec<Vec<u8>>,
    stats: ExchangeStatistics,

    config_buffer: VecDeque<(Vec<f64>, usize)>,

    comm: C,
    timing: Timing,
    progress: Option<ProgressBar>,
}

impl<C: Communicator> DetQmcPt<C> {
    /// Start a fresh simulation.
    pub fn new(
        mut pars_model: ModelParams,
        pars_mc: McParams,
        pars_pt: PtParams,
        pars_logging: LoggingParams,
        comm: C,
    ) -> Result<Self> {
        pars_model.complete_temperature()?;
        Self::init(pars_model, pars_mc, pars_pt, pars_logging, comm)
    }

    /// Resume from this process's state archive. Only `sweeps` (upwards) and
    /// `saveInterval` may change relative to the archived parameters.
    pub fn resume(state_path: &Path, new_mc: &McParams, comm: C) -> Result<Self> {
        let file = File::open(state_path).map_err(|e| {
            SimError::Serialization(format!("cannot open state file {}: {e}", state_path.display()))
        })?;
        let archive: StateArchive = serde_json::from_reader(BufReader::new(file))?;
        let StateArchive {
            logging,
            model,
            mut mc,
            pt,
            contents,
        } = archive;

        if new_mc.sweeps > mc.sweeps {
            if comm.rank() == 0 {
                println!(
                    "Target sweeps will be changed from {} to {}",
                    mc.sweeps, new_mc.sweeps
                );
            }
            mc.sweeps = new_mc.sweeps;
            mc.sweeps_has_changed = true;
        }
        if new_mc.specified.contains("saveInterval") && new_mc.save_interval != mc.save_interval {
            if comm.rank() == 0 {
                println!(
                    "saveInterval will be changed from {} to {}",
                    mc.save_interval, new_mc.save_interval
                );
            }
            mc.save_interval = new_mc.save_interval;
        }

        let par_table = contents.par_of_process.clone();
        let mut sim = Self::init(model, mc, pt, logging, comm)?;
        sim.load_contents(contents)?;

        // re-align every replica with the root's permutation table
        let idx = sim.comm.scatter_usize(if sim.process_index == 0 {
            Some(&par_table)
        } else {
            None
        });
        sim.local_parameter_index = idx;
        sim.replica
            .as_replica_mut()
            .set_exchange_parameter_value(sim.pars_pt.control_parameter_values[idx]);

        if sim.process_index == 0 {
            println!(
                "State of previous simulation has been loaded.\n  sweepsDoneThermalization: {}\n  sweepsDone: {}",
                sim.sweeps_done_thermalization, sim.sweeps_done
            );
        }
        Ok(sim)
    }

    fn init(
        pars_model: ModelParams,
        mut pars_mc: McParams,
        pars_pt: PtParams,
        pars_logging: LoggingParams,
        comm: C,
    ) -> Result<Self> {
        pars_model.check()?;
        pars_mc.check()?;
        pars_pt.check()?;

        let num_processes = comm.size();
        let process_index = comm.rank();
        if num_processes != pars_pt.control_parameter_values.len() {
            return Err(SimError::Configuration(format!(
                "number of processes {} does not match number of control parameter values {}",
                num_processes,
                pars_pt.control_parameter_values.len()
            )));
        }
        if !pars_pt.control_parameter_name.is_empty() && pars_pt.control_parameter_name != "r" {
            return Err(SimError::Configuration(format!(
                "the sdw model exchanges the parameter 'r', not '{}'",
                pars_pt.control_parameter_name
            )));
        }

        // agree on one base seed; the root draws one if none was given
        let proposed = match pars_mc.rng_seed {
            Some(s) => s,
            None => {
                if process_index == 0 {
                    println!("No rng seed specified, using an entropy-derived seed from the root process");
                }
                ChaCha20Rng::from_entropy().next_u64() as u32
            }
        };
        let seed = comm.broadcast_u32(proposed);
        pars_mc.rng_seed = Some(seed);

        let replica_rng = SimRng::for_replica(seed, pars_mc.sim_index, process_index as u32);
        let coordinator_rng =
            SimRng::for_coordinator(seed, pars_mc.sim_index, num_processes as u32);

        let local_parameter_index = process_index;
        let mut model_pars_local = pars_model.clone();
        model_pars_local.r = pars_pt.control_parameter_values[local_parameter_index];
        let replica = create_replica(&model_pars_local, &pars_logging, replica_rng, process_index)?;

        let mut model_meta = replica.as_replica().model_metadata();
        if !pars_pt.control_parameter_name.is_empty() && num_processes > 1 {
            model_meta.remove(&pars_pt.control_parameter_name);
        }
        let mut mc_meta = pars_mc.metadata();
        mc_meta.remove("stateFileName");
        let pt_meta = pars_pt.metadata();

        let rep = replica.as_replica();
        let scalar_handlers = rep
            .scalar_observables()
            .iter()
            .map(|o| ScalarHandlerPt::new(&o.name, &o.short, num_processes))
            .collect();
        let vector_handlers = rep
            .vector_observables()
            .iter()
            .map(|o| VectorHandlerPt::new(&o.name, &o.short, o.values.len(), num_processes))
            .collect();
        let key_value_handlers = rep
            .key_value_observables()
            .iter()
            .map(|o| {
                KeyValueHandlerPt::new(&o.name, &o.short, &o.key_name, o.keys.clone(), num_processes)
            })
            .collect();

        let granted_walltime_secs = std::env::var("PBS_WALLTIME")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(u32::MAX);
        let jobid = std::env::var("SLURM_JOBID").unwrap_or_else(|_| "nojobid".into());

        std::fs::create_dir_all(&pars_mc.output_directory)?;

        let mut sim = Self {
            par_of_process: if process_index == 0 {
                (0..num_processes).collect()
            } else {
                Vec::new()
            },
            process_of_par: if process_index == 0 {
                (0..num_processes).collect()
            } else {
                Vec::new()
            },
            exchange_action: vec![0.0; if process_index == 0 { num_processes } else { 0 }],
            process_control_data: vec![Vec::new(); if process_index == 0 { num_processes } else { 0 }],
            stats: ExchangeStatistics::new(num_processes),
            pars_model,
            pars_mc,
            pars_pt,
            pars_logging,
            model_meta,
            mc_meta,
            pt_meta,
            coordinator_rng,
            replica,
            scalar_handlers,
            vector_handlers,
            key_value_handlers,
            sweeps_done: 0,
            sweeps_done_thermalization: 0,
            sw_counter: 0,
            started: Instant::now(),
            total_walltime_secs: 0,
            walltime_at_last_save: 0,
            granted_walltime_secs,
            jobid,
            num_processes,
            process_index,
            local_parameter_index,
            config_buffer: VecDeque::new(),
            comm,
            timing: Timing::new(),
            progress: None,
        };

        if sim.stream_enabled() {
            sim.write_configuration_stream_header()?;
        }

        if sim.process_index == 0 {
            println!(
                "Granted walltime: {} seconds.\nJob ID: {}\n",
                sim.granted_walltime_secs, sim.jobid
            );
            println!(
                "Simulation initialized, parameters:\n{}{}{}",
                meta::metadata_lines(&sim.mc_meta, ""),
                meta::metadata_lines(&sim.pt_meta, ""),
                meta::metadata_lines(&sim.model_meta, "")
            );
        }
        Ok(sim)
    }

    pub fn set_progress(&mut self, progress: ProgressBar) {
        if self.process_index == 0 {
            self.progress = Some(progress);
        }
    }

    pub fn sweeps_done(&self) -> u32 {
        self.sweeps_done
    }

    pub fn sweeps_done_thermalization(&self) -> u32 {
        self.sweeps_done_thermalization
    }

    pub fn exchange_statistics(&self) -> &ExchangeStatistics {
        &self.stats
    }

    pub fn parameter_maps(&self) -> (&[usize], &[usize]) {
        (&self.par_of_process, &self.process_of_par)
    }

    pub fn replica(&self) -> &ReplicaKind {
        &self.replica
    }

    pub fn scalar_handler(&self, name: &str) -> Option<&ScalarHandlerPt> {
        self.scalar_handlers.iter().find(|h| h.name == name)
    }

    fn say(&self, msg: &str) {
        if self.process_index != 0 {
            return;
        }
        match &self.progress {
            Some(pb) => pb.println(msg),
            None => println!("{msg}"),
        }
    }

    fn cur_walltime_secs(&self) -> u32 {
        self.started.elapsed().as_secs().min(u64::from(u32::MAX)) as u32
    }

    fn stream_enabled(&self) -> bool {
        self.pars_mc.save_configuration_stream_text || self.pars_mc.save_configuration_stream_binary
    }

    fn subdir_path(&self, cpi: usize) -> PathBuf {
        self.pars_mc
            .output_directory
            .join(self.pars_pt.subdir(cpi))
    }

    fn model_meta_for(&self, cpi: usize) -> MetadataMap {
        let mut meta = self.model_meta.clone();
        if !self.pars_pt.control_parameter_name.is_empty() {
            meta.insert(
                self.pars_pt.control_parameter_name.clone(),
                self.pars_pt.control_parameter_values[cpi].to_string(),
            );
        }
        meta
    }

    /// Drive the simulation to completion (or to a graceful early exit).
    pub fn run(&mut self) -> Result<()> {
        let mut stage = if self.sweeps_done_thermalization < self.pars_mc.thermalization {
            self.say(&format!(
                "Thermalization for {} sweeps...",
                self.pars_mc.thermalization
            ));
            Stage::Thermalization
        } else if self.sweeps_done < self.pars_mc.sweeps {
            self.say(&format!(
                "Measurements for {} sweeps...",
                self.pars_mc.sweeps
            ));
            Stage::Measurement
        } else {
            Stage::Finished
        };

        while stage != Stage::Finished {
            // graceful-shutdown poll, every second sweep
            if self.sw_counter % 2 == 0 {
                let mut stop_now = false;
                if self.process_index == 0 {
                    if self.cur_walltime_secs()
                        > self.granted_walltime_secs.saturating_sub(SAFETY_MINUTES * 60)
                    {
                        self.say(&format!(
                            "Granted walltime will be exceeded in less than {SAFETY_MINUTES} minutes."
                        ));
                        stop_now = true;
                    } else if let Some(found) = self.abort_sentinel() {
                        self.say(&format!("Found file {}.", found.display()));
                        stop_now = true;
                    }
                }
                let stop_now = self.comm.broadcast_bool(stop_now);
                if stop_now {
                    self.say("Save state / results and exit gracefully.");
                    self.save(stage == Stage::Measurement)?;
                    self.comm.barrier();
                    return Ok(());
                }
            }

            match stage {
                Stage::Thermalization => {
                    match self.pars_mc.green_update_type {
                        GreenUpdateType::Simple => {
                            self.replica.as_replica_mut().sweep_simple_thermalization()?
                        }
                        GreenUpdateType::Stabilized => {
                            self.replica.as_replica_mut().sweep_thermalization()?
                        }
                    }
                    self.sweeps_done_thermalization += 1;
                    self.sw_counter += 1;
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }
                    if self.sw_counter == self.pars_mc.save_interval {
                        self.say(&format!(
                            "  {} ... saving state ...",
                            self.sweeps_done_thermalization
                        ));
                        self.sw_counter = 0;
                        self.save(false)?;
                        self.comm.barrier();
                    }
                    if self.sweeps_done_thermalization == self.pars_mc.thermalization {
                        self.say("Thermalization finished\n");
                        self.replica
                            .as_replica_mut()
                            .thermalization_over(self.process_index);
                        self.sw_counter = 0;
                        stage = if self.sweeps_done < self.pars_mc.sweeps {
                            self.say(&format!(
                                "Measurements for {} sweeps...",
                                self.pars_mc.sweeps
                            ));
                            Stage::Measurement
                        } else {
                            Stage::Finished
                        };
                    }
                }

                Stage::Measurement => {
                    self.sw_counter += 1;
                    let take_measurement = self.sw_counter % self.pars_mc.measure_interval == 0;
                    match self.pars_mc.green_update_type {
                        GreenUpdateType::Simple => {
                            self.replica.as_replica_mut().sweep_simple(take_measurement)?
                        }
                        GreenUpdateType::Stabilized => {
                            self.replica.as_replica_mut().sweep(take_measurement)?
                        }
                    }
                    if take_measurement {
                        self.insert_measurements();
                        if self.stream_enabled()
                            && self.sw_counter % self.pars_mc.save_configuration_stream_interval
                                == 0
                        {
                            self.config_buffer.push_back((
                                self.replica.as_replica().system_configuration(),
                                self.local_parameter_index,
                            ));
                        }
                    }
                    self.sweeps_done += 1;
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }
                    if self.sw_counter == self.pars_mc.save_interval {
                        self.say(&format!(
                            "  {} ... saving results and state ...",
                            self.sweeps_done
                        ));
                        self.sw_counter = 0;
                        self.save(true)?;
                        self.comm.barrier();
                    }
                    if self.sweeps_done >= self.pars_mc.sweeps {
                        self.sw_counter = 0;
                        self.say("Measurements finished\n");
                        stage = Stage::Finished;
                    }
                }

                Stage::Finished => unreachable!("loop exits before reaching Finished"),
            }

            // replica exchange plus the cheap consistency check
            if stage != Stage::Finished {
                if self.pars_pt.exchange_interval != 0
                    && (self.sweeps_done + self.sweeps_done_thermalization)
                        % self.pars_pt.exchange_interval
                        == 0
                {
                    self.replica_exchange_step()?;
                }
                self.consistency_check()?;
            }
        }

        // final save so short runs leave a resumable archive even when
        // saveInterval never divided the sweep count
        self.save(true)?;
        self.comm.barrier();

        if self.process_index == 0 {
            println!("{}", self.timing.report());
        }
        Ok(())
    }

    fn abort_sentinel(&self) -> Option<PathBuf> {
        let dir = &self.pars_mc.output_directory;
        let names = [
            format!("ABORT.{}", self.jobid),
            format!("../ABORT.{}", self.jobid),
            "ABORT.all".to_string(),
            "../ABORT.all".to_string(),
        ];
        names
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.exists())
    }

    fn insert_measurements(&mut self) {
        let pop = if self.process_index == 0 {
            Some(self.par_of_process.as_slice())
        } else {
            None
        };
        let rep = self.replica.as_replica();
        for (handler, obs) in self.scalar_handlers.iter_mut().zip(rep.scalar_observables()) {
            handler.insert_value(obs.value, &self.comm, pop);
        }
        for (handler, obs) in self.vector_handlers.iter_mut().zip(rep.vector_observables()) {
            handler.insert_value(&obs.values, &self.comm, pop);
        }
        for (handler, obs) in self
            .key_value_handlers
            .iter_mut()
            .zip(rep.key_value_observables())
        {
            handler.insert_value(&obs.values, &self.comm, pop);
        }
    }

    fn replica_exchange_step(&mut self) -> Result<()> {
        self.timing.start("replicaExchangeStep");

        let local_data = self.replica.as_replica().control_data();
        let gathered_data = self.comm.gather_bytes(&local_data);
        let local_action = self.replica.as_replica().exchange_action_contribution();
        let gathered_action = self.comm.gather_f64(local_action);

        if self.process_index == 0 {
            self.process_control_data =
                gathered_data.expect("gather returns all data at rank 0");
            self.exchange_action =
                gathered_action.expect("gather returns all data at rank 0");

            self.stats.record_directions(&self.par_of_process);

            for c in 0..self.num_processes.saturating_sub(1) {
                let par1 = self.pars_pt.control_parameter_values[c];
                let par2 = self.pars_pt.control_parameter_values[c + 1];
                let proc1 = self.process_of_par[c];
                let proc2 = self.process_of_par[c + 1];
                let action1 = self.exchange_action[proc1];
                let action2 = self.exchange_action[proc2];

                let prob = self
                    .replica
                    .as_replica()
                    .exchange_probability(par1, action1, par2, action2);
                self.stats.swap_up_proposed[c] += 1;
                if prob >= 1.0 || self.coordinator_rng.rand01() <= prob {
                    self.stats.swap_up_accepted[c] += 1;
                    self.par_of_process[proc1] = c + 1;
                    self.par_of_process[proc2] = c;
                    self.process_of_par[c] = proc2;
                    self.process_of_par[c + 1] = proc1;
                    self.process_control_data.swap(proc1, proc2);
                }
            }
        }

        let new_index = self.comm.scatter_usize(if self.process_index == 0 {
            Some(&self.par_of_process)
        } else {
            None
        });
        self.local_parameter_index = new_index;
        self.replica
            .as_replica_mut()
            .set_exchange_parameter_value(self.pars_pt.control_parameter_values[new_index]);

        let data = self.comm.scatter_bytes(if self.process_index == 0 {
            Some(&self.process_control_data)
        } else {
            None
        });
        self.replica.as_replica_mut().set_control_data(&data)?;

        self.timing.stop("replicaExchangeStep");
        Ok(())
    }

    fn consistency_check(&mut self) -> Result<()> {
        let local_value = self.replica.as_replica().exchange_parameter_value();
        let gathered = self.comm.gather_f64(local_value);
        let mut ok = true;
        if self.process_index == 0 {
            let values = gathered.expect("gather returns all data at rank 0");
            for (process, &v) in values.iter().enumerate() {
                let expected =
                    self.pars_pt.control_parameter_values[self.par_of_process[process]];
                if (v - expected).abs() > 1e-10 {
                    eprintln!(
                        "process {process} carries exchange parameter {v}, expected {expected}"
                    );
                    ok = false;
                }
            }
        }
        let ok = self.comm.broadcast_bool(ok);
        if ok {
            Ok(())
        } else {
            Err(SimError::Consistency(
                "exchange parameter value mismatch".into(),
            ))
        }
    }

    fn save(&mut self, with_results: bool) -> Result<()> {
        if with_results {
            self.gather_and_output_configurations()?;
            self.save_results()?;
        }
        self.save_state()
    }

    fn save_state(&mut self) -> Result<()> {
        self.timing.start("saveState");

        let cwts = self.cur_walltime_secs();
        self.total_walltime_secs += cwts - self.walltime_at_last_save;
        self.walltime_at_last_save = cwts;

        let archive = StateArchive {
            logging: self.pars_logging.clone(),
            model: self.pars_model.clone(),
            mc: self.pars_mc.clone(),
            pt: self.pars_pt.clone(),
            contents: RunContents {
                coordinator_rng: self.coordinator_rng.clone(),
                scalar_handlers: self.scalar_handlers.clone(),
                vector_handlers: self.vector_handlers.clone(),
                key_value_handlers: self.key_value_handlers.clone(),
                sweeps_done: self.sweeps_done,
                sweeps_done_thermalization: self.sweeps_done_thermalization,
                sw_counter: self.sw_counter,
                total_walltime_secs: self.total_walltime_secs,
                local_parameter_index: self.local_parameter_index,
                par_of_process: self.par_of_process.clone(),
                process_of_par: self.process_of_par.clone(),
                exchange_statistics: self.stats.clone(),
                replica: self.replica.as_replica().save_contents(),
            },
        };
        let path = self
            .pars_mc
            .state_file_for_rank(self.num_processes, self.process_index);
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), &archive)?;

        if self.process_index == 0 {
            self.write_info_files()?;
            let combined = self.combined_meta();
            self.stats.write_files(
                &self.pars_mc.output_directory,
                &self.pars_pt.control_parameter_values,
                &combined,
            )?;
        }

        self.timing.stop("saveState");
        Ok(())
    }

    fn combined_meta(&self) -> MetadataMap {
        let mut meta = self.model_meta.clone();
        meta.extend(self.mc_meta.clone());
        meta.extend(self.pt_meta.clone());
        meta
    }

    fn version_meta() -> MetadataMap {
        let mut meta = MetadataMap::new();
        meta.insert("code".into(), env!("CARGO_PKG_NAME").into());
        meta.insert("codeVersion".into(), env!("CARGO_PKG_VERSION").into());
        meta
    }

    fn write_info_files(&self) -> Result<()> {
        let mut current_state = MetadataMap::new();
        current_state.insert(
            "sweepsDoneThermalization".into(),
            self.sweeps_done_thermalization.to_string(),
        );
        current_state.insert("sweepsDone".into(), self.sweeps_done.to_string());
        current_state.insert(
            "totalWallTimeSecs".into(),
            self.total_walltime_secs.to_string(),
        );

        let write_info = |model_meta: &MetadataMap, dir: &Path| -> Result<()> {
            std::fs::create_dir_all(dir)?;
            let info = dir.join("info.dat");
            meta::write_metadata_block(
                &info,
                &Self::version_meta(),
                "Determinantal quantum Monte Carlo simulation with replica exchange",
                false,
            )?;
            meta::write_metadata_block(&info, model_meta, "Model parameters:", true)?;
            meta::write_metadata_block(&info, &self.mc_meta, "Monte Carlo parameters:", true)?;
            meta::write_metadata_block(&info, &self.pt_meta, "Replica exchange parameters:", true)?;
            meta::write_metadata_block(&info, &current_state, "Current state of simulation:", true)
        };

        write_info(&self.model_meta, &self.pars_mc.output_directory)?;
        for cpi in 0..self.num_processes {
            write_info(&self.model_meta_for(cpi), &self.subdir_path(cpi))?;
        }
        Ok(())
    }

    fn save_results(&mut self) -> Result<()> {
        self.timing.start("saveResults");
        if self.process_index == 0 {
            for cpi in 0..self.num_processes {
                let dir = self.subdir_path(cpi);
                std::fs::create_dir_all(&dir)?;
                let meta = self.model_meta_for(cpi);

                let results_path = dir.join("results.values");
                let mut results = File::create(&results_path)?;
                writeln!(results, "## Averaged scalar observables")?;
                writeln!(results, "## observable\tmean\terror")?;
                writeln!(results, "# jkBlocks = {}", self.pars_mc.jk_blocks)?;
                for handler in &self.scalar_handlers {
                    let (mean, error) = handler.mean_and_error(cpi, self.pars_mc.jk_blocks);
                    writeln!(
                        results,
                        "{}\t{:.10e}\t{:.10e}",
                        handler.name, mean, error
                    )?;
                    if self.pars_mc.timeseries {
                        handler.write_series(&dir, cpi, &meta)?;
                    }
                }
                for handler in &self.vector_handlers {
                    handler.write_mean(&dir, cpi, &meta)?;
                }
                for handler in &self.key_value_handlers {
                    handler.write_mean(&dir, cpi, &meta)?;
                }
            }
        }
        self.timing.stop("saveResults");
        Ok(())
    }

    fn write_configuration_stream_header(&self) -> Result<()> {
        let dir = self.subdir_path(self.local_parameter_index);
        std::fs::create_dir_all(&dir)?;
        let meta = self.model_meta_for(self.local_parameter_index);
        let mut combined = meta;
        combined.extend(self.mc_meta.clone());
        combined.extend(self.pt_meta.clone());
        meta::write_metadata_block(
            &dir.join("configs-phi.infoheader"),
            &combined,
            "System configuration stream of the auxiliary field",
            false,
        )
    }

    /// Collect every buffered configuration at rank 0 and append it to the
    /// stream files of the parameter bin it was sampled in.
    fn gather_and_output_configurations(&mut self) -> Result<()> {
        if !self.stream_enabled() {
            return Ok(());
        }
        // all processes buffer on the same schedule, so the queue lengths
        // agree and the collectives below stay aligned
        let rounds = self.config_buffer.len();
        for _ in 0..rounds {
            let (config, cpi) = self
                .config_buffer
                .pop_front()
                .expect("queue length checked above");
            let mut bytes = Vec::with_capacity(config.len() * 8);
            for v in &config {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            let gathered = self.comm.gather_bytes(&bytes);
            let cpis = self.comm.gather_usize(cpi);
            if self.process_index == 0 {
                let gathered = gathered.expect("gather returns all data at rank 0");
                let cpis = cpis.expect("gather returns all data at rank 0");
                for (buf, &target) in gathered.iter().zip(&cpis) {
                    let dir = self.subdir_path(target);
                    std::fs::create_dir_all(&dir)?;
                    if self.pars_mc.save_configuration_stream_binary {
                        let mut f = OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(dir.join("configs-phi.binarystream"))?;
                        f.write_all(buf)?;
                    }
                    if self.pars_mc.save_configuration_stream_text {
                        let mut f = OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(dir.join("configs-phi.textstream"))?;
                        let values: Vec<String> = buf
                            .chunks_exact(8)
                            .map(|c| {
                                let mut arr = [0u8; 8];
                                arr.copy_from_slice(c);
                                format!("{:.10e}", f64::from_le_bytes(arr))
                            })
                            .collect();
                        writeln!(f, "{}", values.join(" "))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn load_contents(&mut self, contents: RunContents) -> Result<()> {
        self.coordinator_rng = contents.coordinator_rng;
        self.scalar_handlers = contents.scalar_handlers;
        self.vector_handlers = contents.vector_handlers;
        self.key_value_handlers = contents.key_value_handlers;
        self.sweeps_done = contents.sweeps_done;
        self.sweeps_done_thermalization = contents.sweeps_done_thermalization;
        self.sw_counter = contents.sw_counter;
        self.total_walltime_secs = contents.total_walltime_secs;
        self.local_parameter_index = contents.local_parameter_index;
        if self.process_index == 0 {
            self.par_of_process = contents.par_of_process;
            self.process_of_par = contents.process_of_par;
            self.stats = contents.exchange_statistics;
        }
        self.replica.as_replica_mut().load_contents(contents.replica)
    }
}
