//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;

use dqmc::params::{McParams, ModelParams, PtParams};

/// The reference model of the end-to-end scenarios: L = 4, β = 1, m = 10.
pub fn scenario_model() -> ModelParams {
    let mut pars = ModelParams {
        l: 4,
        beta: 1.0,
        m: 10,
        dtau: 0.1,
        mu: 0.5,
        r: -1.0,
        acc_ratio: 0.5,
        ..ModelParams::default()
    };
    pars.mark_all_specified();
    pars.specified.remove("s");
    pars.s = 0; // defaulted by temperature completion
    pars
}

pub fn scenario_mc(
    sweeps: u32,
    thermalization: u32,
    measure_interval: u32,
    save_interval: u32,
    rng_seed: u32,
    output_directory: PathBuf,
) -> McParams {
    let mut mc = McParams {
        sweeps,
        thermalization,
        measure_interval,
        save_interval,
        rng_seed: Some(rng_seed),
        output_directory,
        ..McParams::default()
    };
    for key in [
        "sweeps",
        "thermalization",
        "measureInterval",
        "saveInterval",
        "rngSeed",
    ] {
        mc.specified.insert(key.into());
    }
    mc
}

pub fn pt_single(r: f64) -> PtParams {
    PtParams {
        control_parameter_name: String::new(),
        control_parameter_values: vec![r],
        exchange_interval: 0,
    }
}

pub fn pt_ladder(values: Vec<f64>, exchange_interval: u32) -> PtParams {
    PtParams {
        control_parameter_name: "r".into(),
        control_parameter_values: values,
        exchange_interval,
    }
}

/// Fresh scratch directory under the system temp dir, unique per test tag.
pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dqmc-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch directory");
    dir
}
