//! Determinantal quantum Monte Carlo for the O(3) spin-density-wave model
//! on the square lattice, with parallel tempering over a ladder of control
//! parameters.

pub mod bmat;
pub mod comm;
pub mod errors;
pub mod exchange;
pub mod fields;
pub mod greens;
pub mod lattice;
pub mod linalg;
pub mod meta;
pub mod observables;
pub mod params;
pub mod replica;
pub mod rng;
pub mod run;
pub mod sdw;
pub mod timing;
