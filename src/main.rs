//! Command-line entry point: parse options and the configuration file,
//! spawn one replica process per control-parameter value, run to completion.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use dqmc::comm::{ChannelCommunicator, SingleProcess};
use dqmc::errors::{Result, SimError};
use dqmc::params::{GreenUpdateType, LoggingParams, McParams, ModelParams, PtParams};
use dqmc::run::DetQmcPt;

/// Determinantal QMC for the O(3) spin-density-wave model with replica
/// exchange. Settings come from the command line and from `--conf`
/// (key = value lines); command-line arguments take precedence.
#[derive(Parser)]
#[command(name = "dqmc", version, about, allow_negative_numbers = true)]
struct Cli {
    /// Configuration file to be used; settings in there are overridden by
    /// command line arguments
    #[arg(short = 'c', long, default_value = "simulation.conf")]
    conf: PathBuf,

    // ---- model parameters -------------------------------------------------
    /// Model to be simulated (sdw)
    #[arg(long)]
    model: Option<String>,
    /// Linear spatial extent
    #[arg(long = "L")]
    l: Option<u32>,
    /// Inverse temperature (kB = 1)
    #[arg(long)]
    beta: Option<f64>,
    /// Number of imaginary time discretization levels (beta = m dtau)
    #[arg(long)]
    m: Option<u32>,
    /// Imaginary time discretization step
    #[arg(long)]
    dtau: Option<f64>,
    /// Chemical potential
    #[arg(long)]
    mu: Option<f64>,
    /// Tuning parameter of the bosonic action
    #[arg(long)]
    r: Option<f64>,
    /// Quartic coupling of the bosonic action
    #[arg(long)]
    u: Option<f64>,
    /// Bare bosonic velocity
    #[arg(long)]
    c: Option<f64>,
    /// Target acceptance ratio for proposal-width tuning
    #[arg(long = "accRatio")]
    acc_ratio: Option<f64>,
    /// Green's function stabilization interval in time slices
    #[arg(long)]
    s: Option<u32>,
    /// Use the checkerboard decomposition of the hopping propagator
    #[arg(long)]
    checkerboard: bool,
    /// Carry time-displaced Green's functions (metadata only for sdw)
    #[arg(long)]
    timedisplaced: bool,

    // ---- Monte Carlo parameters -------------------------------------------
    /// Number of measurement sweeps
    #[arg(long)]
    sweeps: Option<u32>,
    /// Number of warm-up sweeps
    #[arg(long)]
    thermalization: Option<u32>,
    /// Take measurements every so many sweeps
    #[arg(long = "measureInterval")]
    measure_interval: Option<u32>,
    /// Write results and state every so many sweeps; 0: only at the end
    #[arg(long = "saveInterval")]
    save_interval: Option<u32>,
    /// Number of jackknife blocks for error estimation
    #[arg(long = "jkBlocks")]
    jk_blocks: Option<u32>,
    /// Write time series of individual measurements to disk
    #[arg(long)]
    timeseries: bool,
    /// Seed of the random number generators
    #[arg(long = "rngSeed")]
    rng_seed: Option<u32>,
    /// Index of this simulation instance (enters the RNG streams)
    #[arg(long)]
    simindex: Option<u32>,
    /// Green's function update scheme: simple | stabilized
    #[arg(long = "greenUpdateType")]
    green_update_type: Option<String>,
    /// Name of the state file for checkpoints and resuming
    #[arg(long = "stateFileName")]
    state_file_name: Option<String>,
    /// Stream system configurations as text
    #[arg(long = "saveConfigurationStreamText")]
    save_configuration_stream_text: bool,
    /// Stream system configurations as raw binary
    #[arg(long = "saveConfigurationStreamBinary")]
    save_configuration_stream_binary: bool,
    /// Measurement sweeps between streamed configurations
    #[arg(long = "saveConfigurationStreamInterval")]
    save_configuration_stream_interval: Option<u32>,
    /// Directory receiving all output files
    #[arg(long = "outputDirectory")]
    output_directory: Option<PathBuf>,

    // ---- replica exchange -------------------------------------------------
    /// Name of the exchanged control parameter (r)
    #[arg(long = "controlParameterName")]
    control_parameter_name: Option<String>,
    /// Control parameter value per replica, comma separated
    #[arg(
        long = "controlParameterValues",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    control_parameter_values: Option<Vec<f64>>,
    /// Sweeps between replica-exchange rounds; 0 disables exchange
    #[arg(long = "exchangeInterval")]
    exchange_interval: Option<u32>,

    // ---- logging ----------------------------------------------------------
    /// Log wrapped-vs-fresh Green's function deviations per process
    #[arg(long = "logGreenConsistency")]
    log_green_consistency: bool,
    /// Directory for the per-process log files
    #[arg(long)]
    logfiledir: Option<PathBuf>,
}

/// `key = value` lines, `#` comments; missing file is an empty configuration.
fn read_conf(path: &PathBuf) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return Ok(map);
    };
    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(SimError::Configuration(format!(
                "malformed configuration line '{raw}'"
            )));
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn parse_conf<T: FromStr>(conf: &BTreeMap<String, String>, key: &str) -> Result<Option<T>> {
    match conf.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            SimError::Configuration(format!("cannot parse configuration value {key} = {raw}"))
        }),
    }
}

/// Command line wins over the configuration file.
fn pick<T: Clone + FromStr>(
    cli_value: &Option<T>,
    conf: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    if let Some(v) = cli_value {
        return Ok(Some(v.clone()));
    }
    parse_conf(conf, key)
}

fn pick_flag(cli_value: bool, conf: &BTreeMap<String, String>, key: &str) -> Result<bool> {
    if cli_value {
        return Ok(true);
    }
    Ok(parse_conf::<bool>(conf, key)?.unwrap_or(false))
}

fn build_params(
    cli: &Cli,
    conf: &BTreeMap<String, String>,
) -> Result<(ModelParams, McParams, PtParams, LoggingParams)> {
    let mut model = ModelParams::default();
    macro_rules! set_model {
        ($field:ident, $cli:expr, $key:literal) => {
            if let Some(v) = pick($cli, conf, $key)? {
                model.$field = v;
                model.specified.insert($key.into());
            }
        };
    }
    set_model!(model, &cli.model, "model");
    set_model!(l, &cli.l, "L");
    set_model!(beta, &cli.beta, "beta");
    set_model!(m, &cli.m, "m");
    set_model!(dtau, &cli.dtau, "dtau");
    set_model!(mu, &cli.mu, "mu");
    set_model!(r, &cli.r, "r");
    set_model!(u, &cli.u, "u");
    set_model!(c, &cli.c, "c");
    set_model!(acc_ratio, &cli.acc_ratio, "accRatio");
    set_model!(s, &cli.s, "s");
    model.checkerboard = pick_flag(cli.checkerboard, conf, "checkerboard")?;
    model.timedisplaced = pick_flag(cli.timedisplaced, conf, "timedisplaced")?;
    if model.checkerboard {
        model.specified.insert("checkerboard".into());
    }
    if model.timedisplaced {
        model.specified.insert("timedisplaced".into());
    }

    let mut mc = McParams::default();
    macro_rules! set_mc {
        ($field:ident, $cli:expr, $key:literal) => {
            if let Some(v) = pick($cli, conf, $key)? {
                mc.$field = v;
                mc.specified.insert($key.into());
            }
        };
    }
    set_mc!(sweeps, &cli.sweeps, "sweeps");
    set_mc!(thermalization, &cli.thermalization, "thermalization");
    set_mc!(measure_interval, &cli.measure_interval, "measureInterval");
    set_mc!(save_interval, &cli.save_interval, "saveInterval");
    set_mc!(jk_blocks, &cli.jk_blocks, "jkBlocks");
    set_mc!(sim_index, &cli.simindex, "simindex");
    set_mc!(state_file_name, &cli.state_file_name, "stateFileName");
    set_mc!(
        save_configuration_stream_interval,
        &cli.save_configuration_stream_interval,
        "saveConfigurationStreamInterval"
    );
    set_mc!(output_directory, &cli.output_directory, "outputDirectory");
    if let Some(seed) = pick(&cli.rng_seed, conf, "rngSeed")? {
        mc.rng_seed = Some(seed);
        mc.specified.insert("rngSeed".into());
    }
    if let Some(kind) = pick(&cli.green_update_type, conf, "greenUpdateType")? {
        mc.green_update_type = GreenUpdateType::from_str(&kind)?;
        mc.specified.insert("greenUpdateType".into());
    }
    mc.timeseries = pick_flag(cli.timeseries, conf, "timeseries")?;
    mc.save_configuration_stream_text = pick_flag(
        cli.save_configuration_stream_text,
        conf,
        "saveConfigurationStreamText",
    )?;
    mc.save_configuration_stream_binary = pick_flag(
        cli.save_configuration_stream_binary,
        conf,
        "saveConfigurationStreamBinary",
    )?;

    let mut pt = PtParams::default();
    if let Some(name) = pick(&cli.control_parameter_name, conf, "controlParameterName")? {
        pt.control_parameter_name = name;
    }
    pt.control_parameter_values = match &cli.control_parameter_values {
        Some(values) => values.clone(),
        None => match conf.get("controlParameterValues") {
            Some(raw) => raw
                .split([',', ' '])
                .filter(|t| !t.is_empty())
                .map(|t| {
                    t.parse::<f64>().map_err(|_| {
                        SimError::Configuration(format!(
                            "cannot parse control parameter value '{t}'"
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?,
            None => Vec::new(),
        },
    };
    if let Some(interval) = pick(&cli.exchange_interval, conf, "exchangeInterval")? {
        pt.exchange_interval = interval;
    }
    // a plain single-replica run needs no explicit ladder
    if pt.control_parameter_values.is_empty() {
        pt.control_parameter_values = vec![model.r];
    }

    let mut logging = LoggingParams::default();
    logging.log_green_consistency = pick_flag(cli.log_green_consistency, conf, "logGreenConsistency")?;
    if let Some(dir) = pick(&cli.logfiledir, conf, "logfiledir")? {
        logging.logfiledir = dir;
    }

    Ok((model, mc, pt, logging))
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(" {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]")
            .expect("static progress template"),
    );
    bar
}

fn run_simulation(
    rank: usize,
    model: ModelParams,
    mc: McParams,
    pt: PtParams,
    logging: LoggingParams,
    comm: impl dqmc::comm::Communicator,
    resume: bool,
    with_progress: bool,
) -> Result<()> {
    let total_sweeps = u64::from(mc.thermalization) + u64::from(mc.sweeps);
    let num_processes = pt.control_parameter_values.len();
    let mut sim = if resume {
        let path = mc.state_file_for_rank(num_processes, rank);
        DetQmcPt::resume(&path, &mc, comm)?
    } else {
        DetQmcPt::new(model, mc, pt, logging, comm)?
    };
    if with_progress && total_sweeps > 0 {
        sim.set_progress(progress_bar(total_sweeps));
    }
    sim.run()
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    let conf = read_conf(&cli.conf)?;
    let (model, mc, pt, logging) = build_params(&cli, &conf)?;

    let p = pt.control_parameter_values.len();
    // a state file from a previous run means we resume it
    let resume = mc.state_file_for_rank(p, 0).exists();

    if p == 1 {
        return run_simulation(0, model, mc, pt, logging, SingleProcess, resume, true);
    }

    let comms = ChannelCommunicator::create(p);
    let mut handles = Vec::with_capacity(p);
    for (rank, comm) in comms.into_iter().enumerate() {
        let (model, mc, pt, logging) = (model.clone(), mc.clone(), pt.clone(), logging.clone());
        handles.push(thread::spawn(move || {
            run_simulation(rank, model, mc, pt, logging, comm, resume, rank == 0)
        }));
    }
    let mut first_error = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("replica process {rank} failed: {e}");
                first_error.get_or_insert(e);
            }
            Err(_) => {
                let e = SimError::Configuration(format!("replica thread {rank} panicked"));
                eprintln!("{e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
