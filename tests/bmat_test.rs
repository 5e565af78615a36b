//! B-matrix product laws from the outside: inverse round-trips, the
//! checkerboard-vs-dense Trotter equivalence, and the exactness of the
//! wrap-plus-SMW chain over a full sweep.

mod common;

use common::scenario_model;
use dqmc::bmat::{Hoppings, SdwBmat, SlicePropagator};
use dqmc::fields::PhiField;
use dqmc::lattice::SquareLattice;
use dqmc::linalg::{cpx, frobenius_diff, identity, max_abs_diff, CMat};
use dqmc::params::LoggingParams;
use dqmc::replica::Replica;
use dqmc::rng::SimRng;
use dqmc::sdw::SdwModel;

struct Fixture {
    lat: SquareLattice,
    hop: Hoppings,
    field: PhiField,
    dtau: f64,
    mu: f64,
}

fn fixture(dtau: f64, m: u32, seed: u32) -> Fixture {
    let lat = SquareLattice::new(4);
    let mu = 0.5;
    let hop = Hoppings::new(&lat, dtau, mu);
    let mut rng = SimRng::for_replica(seed, 0, 0);
    let field = PhiField::random(lat.n(), m, dtau, &mut rng);
    Fixture {
        lat,
        hop,
        field,
        dtau,
        mu,
    }
}

fn propagator(fx: &Fixture, checkerboard: bool) -> SdwBmat<'_> {
    SdwBmat {
        lat: &fx.lat,
        hop: &fx.hop,
        field: &fx.field,
        checkerboard,
        mu: fx.mu,
        dtau: fx.dtau,
    }
}

fn random_matrix(n: usize, rng: &mut SimRng) -> CMat {
    CMat::from_fn(n, n, |_, _| {
        cpx(rng.rand_range(-1.0, 1.0), rng.rand_range(-1.0, 1.0))
    })
}

#[test]
fn left_inverse_undoes_left_multiplication() {
    for checkerboard in [false, true] {
        let fx = fixture(0.1, 6, 31);
        let b = propagator(&fx, checkerboard);
        let mut rng = SimRng::for_replica(32, 0, 0);
        let a = random_matrix(b.n4(), &mut rng);
        let roundtrip = b
            .left_mult_b_inv(&b.left_mult_b(&a, 5, 1).unwrap(), 5, 1)
            .unwrap();
        let dev = max_abs_diff(&roundtrip, &a);
        assert!(dev < 1e-7, "checkerboard={checkerboard}: deviation {dev}");
    }
}

#[test]
fn right_inverse_undoes_right_multiplication() {
    for checkerboard in [false, true] {
        let fx = fixture(0.1, 6, 33);
        let b = propagator(&fx, checkerboard);
        let mut rng = SimRng::for_replica(34, 0, 0);
        let a = random_matrix(b.n4(), &mut rng);
        let roundtrip = b
            .right_mult_b_inv(&b.right_mult_b(&a, 6, 2).unwrap(), 6, 2)
            .unwrap();
        let dev = max_abs_diff(&roundtrip, &a);
        assert!(dev < 1e-7, "checkerboard={checkerboard}: deviation {dev}");
    }
}

#[test]
fn checkerboard_tracks_dense_product_within_trotter_tolerance() {
    // L = 4, dtau = 0.01: the bond-group split carries an O(dtau²·k) error
    let fx = fixture(0.01, 4, 35);
    let cb = propagator(&fx, true);
    let eye = identity(cb.n4());
    for k in 1..=4u32 {
        let via_cb = cb.left_mult_b(&eye, k, 0).unwrap();
        let dense = cb.dense_b(k, 0);
        let err = frobenius_diff(&via_cb, &dense);
        // error budget grows linearly with the number of slices spanned
        let budget = 1e-3 * f64::from(k);
        assert!(err < budget, "slice span {k}: Frobenius error {err}");
    }
}

#[test]
fn wrap_and_smw_chain_matches_fresh_recomputation() {
    // One stabilization chunk (s = m), so interior slices are maintained
    // purely by wraps and rank-4 SMW updates. After the down sweep the last
    // slice processed is k = 1; its Green's function then reflects every
    // field update of the sweep and can be checked against a full rebuild.
    let mut pars = scenario_model();
    pars.m = 8;
    pars.beta = 0.8;
    pars.s = 8;
    let rng = SimRng::for_replica(42, 0, 1);
    let mut model = SdwModel::new(&pars, &LoggingParams::default(), rng, 0).unwrap();
    model.sweep(false).unwrap(); // up
    model.sweep(false).unwrap(); // down

    let fresh = model.fresh_green(1).unwrap();
    let dev = max_abs_diff(model.green_at(1), &fresh);
    assert!(dev < 1e-9, "SMW chain drifted by {dev}");
}
