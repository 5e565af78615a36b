//! The bosonic O(3) auxiliary field φ(site, slice) and its derived caches.
//!
//! The caches ch = cosh(Δτ|φ|) and sh = sinh(Δτ|φ|)/|φ| appear in every
//! vertex exponential; they are refreshed together with φ on every accepted
//! move and never drift out of sync with it. Slices are indexed 1..=m; the
//! unused slice 0 stays at φ = 0.

use serde::{Deserialize, Serialize};

use crate::lattice::{SquareLattice, TimeChain, Z};
use crate::rng::SimRng;

/// Initial field components are drawn uniformly from this range.
pub const PHI_LOW: f64 = -1.0;
pub const PHI_HIGH: f64 = 1.0;

pub type Phi = [f64; 3];

#[inline]
fn dot(a: Phi, b: Phi) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhiField {
    n: usize,
    m: u32,
    dtau: f64,
    phi: Vec<Phi>,
    ch: Vec<f64>,
    sh: Vec<f64>,
}

impl PhiField {
    /// Freshly randomized field with consistent caches.
    pub fn random(n: usize, m: u32, dtau: f64, rng: &mut SimRng) -> Self {
        let len = (m as usize + 1) * n;
        let mut field = Self {
            n,
            m,
            dtau,
            phi: vec![[0.0; 3]; len],
            ch: vec![1.0; len],
            sh: vec![dtau; len],
        };
        for k in 1..=m {
            for site in 0..n {
                let phi = [
                    rng.rand_range(PHI_LOW, PHI_HIGH),
                    rng.rand_range(PHI_LOW, PHI_HIGH),
                    rng.rand_range(PHI_LOW, PHI_HIGH),
                ];
                let (ch, sh) = cache_values(dtau, phi);
                field.set(site, k, phi, ch, sh);
            }
        }
        field
    }

    #[inline(always)]
    fn idx(&self, site: usize, k: u32) -> usize {
        debug_assert!(site < self.n && k <= self.m);
        k as usize * self.n + site
    }

    #[inline(always)]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline(always)]
    pub fn m(&self) -> u32 {
        self.m
    }

    #[inline(always)]
    pub fn dtau(&self) -> f64 {
        self.dtau
    }

    #[inline(always)]
    pub fn phi(&self, site: usize, k: u32) -> Phi {
        self.phi[self.idx(site, k)]
    }

    #[inline(always)]
    pub fn ch(&self, site: usize, k: u32) -> f64 {
        self.ch[self.idx(site, k)]
    }

    #[inline(always)]
    pub fn sh(&self, site: usize, k: u32) -> f64 {
        self.sh[self.idx(site, k)]
    }

    #[inline(always)]
    pub fn set(&mut self, site: usize, k: u32, phi: Phi, ch: f64, sh: f64) {
        let i = self.idx(site, k);
        self.phi[i] = phi;
        self.ch[i] = ch;
        self.sh[i] = sh;
    }

    /// System average of each field component over sites and slices.
    pub fn mean_phi(&self) -> Phi {
        let mut acc = [0.0; 3];
        for k in 1..=self.m {
            for site in 0..self.n {
                let p = self.phi(site, k);
                acc[0] += p[0];
                acc[1] += p[1];
                acc[2] += p[2];
            }
        }
        let norm = (self.n as f64) * f64::from(self.m);
        [acc[0] / norm, acc[1] / norm, acc[2] / norm]
    }

    /// Bosonic action difference for replacing φ(site, k) by `newphi`.
    ///
    /// One-sided discrete time derivative; space gradient counts each bond
    /// through the neighbor sum; local r and u terms.
    pub fn delta_s_phi(
        &self,
        lat: &SquareLattice,
        time: &TimeChain,
        site: usize,
        k: u32,
        newphi: Phi,
        r: f64,
        u: f64,
        c: f64,
    ) -> f64 {
        let oldphi = self.phi(site, k);
        let phi_diff = [
            newphi[0] - oldphi[0],
            newphi[1] - oldphi[1],
            newphi[2] - oldphi[2],
        ];

        let oldphi_sq = dot(oldphi, oldphi);
        let newphi_sq = dot(newphi, newphi);
        let phi_sq_diff = newphi_sq - oldphi_sq;
        let phi_pow4_diff = newphi_sq * newphi_sq - oldphi_sq * oldphi_sq;

        let earlier = self.phi(site, time.minus(k));
        let later = self.phi(site, time.plus(k));
        let phi_time_neigh = [
            later[0] + earlier[0],
            later[1] + earlier[1],
            later[2] + earlier[2],
        ];

        let mut phi_space_neigh = [0.0; 3];
        for neigh in lat.neighbors(site) {
            let p = self.phi(neigh, k);
            phi_space_neigh[0] += p[0];
            phi_space_neigh[1] += p[1];
            phi_space_neigh[2] += p[2];
        }

        let dtau = self.dtau;
        let delta_kinetic =
            (1.0 / (c * c * dtau)) * (phi_sq_diff - dot(phi_time_neigh, phi_diff));
        let delta_gradient =
            0.5 * dtau * (Z as f64 * phi_sq_diff - 2.0 * dot(phi_space_neigh, phi_diff));
        let delta_local = dtau * (0.5 * r * phi_sq_diff + 0.25 * u * phi_pow4_diff);

        delta_kinetic + delta_gradient + delta_local
    }

    /// Full bosonic action (reference implementation; the updater only ever
    /// needs differences).
    pub fn action(&self, lat: &SquareLattice, time: &TimeChain, r: f64, u: f64, c: f64) -> f64 {
        use crate::lattice::{XPLUS, YPLUS};
        let dtau = self.dtau;
        let mut action = 0.0;
        for k in 1..=self.m {
            for site in 0..self.n {
                let phi = self.phi(site, k);
                let prev = self.phi(site, time.minus(k));
                let dt = [
                    (phi[0] - prev[0]) / dtau,
                    (phi[1] - prev[1]) / dtau,
                    (phi[2] - prev[2]) / dtau,
                ];
                action += (dtau / (2.0 * c * c)) * dot(dt, dt);

                // bonds counted once via the PLUS directions
                for dir in [XPLUS, YPLUS] {
                    let np = self.phi(lat.neighbor(dir, site), k);
                    let diff = [phi[0] - np[0], phi[1] - np[1], phi[2] - np[2]];
                    action += 0.5 * dtau * dot(diff, diff);
                }

                let phisq = dot(phi, phi);
                action += 0.5 * dtau * r * phisq;
                action += 0.25 * dtau * u * phisq * phisq;
            }
        }
        action
    }

    /// ∂S_φ/∂r — the field's coupling to the control parameter, used as the
    /// exchange-action contribution of this replica.
    pub fn exchange_action_contribution(&self) -> f64 {
        let mut sum_sq = 0.0;
        for k in 1..=self.m {
            for site in 0..self.n {
                let phi = self.phi(site, k);
                sum_sq += dot(phi, phi);
            }
        }
        0.5 * self.dtau * sum_sq
    }

    /// Flat snapshot of the physical slices (k = 1..=m), site-major within a
    /// slice, for the configuration stream.
    pub fn configuration(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.m as usize * self.n * 3);
        for k in 1..=self.m {
            for site in 0..self.n {
                out.extend_from_slice(&self.phi(site, k));
            }
        }
        out
    }
}

/// cosh(Δτ|φ|) and sinh(Δτ|φ|)/|φ|, with the |φ| → 0 limit for the latter.
pub fn cache_values(dtau: f64, phi: Phi) -> (f64, f64) {
    let norm = dot(phi, phi).sqrt();
    if norm < 1e-300 {
        (1.0, dtau)
    } else {
        ((dtau * norm).cosh(), (dtau * norm).sinh() / norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup() -> (SquareLattice, TimeChain, PhiField, SimRng) {
        let lat = SquareLattice::new(4);
        let time = TimeChain::new(6);
        let mut rng = SimRng::for_replica(5, 0, 0);
        let field = PhiField::random(lat.n(), 6, 0.1, &mut rng);
        (lat, time, field, rng)
    }

    #[test]
    fn caches_match_definitions_after_init() {
        let (_, _, field, _) = setup();
        for k in 1..=field.m() {
            for site in 0..field.n() {
                let (ch, sh) = cache_values(field.dtau(), field.phi(site, k));
                assert_relative_eq!(field.ch(site, k), ch, epsilon = 1e-15);
                assert_relative_eq!(field.sh(site, k), sh, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn delta_s_phi_matches_full_action_difference() {
        let (lat, time, mut field, mut rng) = setup();
        let (r, u, c) = (-0.5, 1.0, 1.0);
        for _ in 0..20 {
            let site = rng.rand_index(field.n());
            let k = 1 + rng.rand_index(field.m() as usize) as u32;
            let old = field.phi(site, k);
            let newphi = [
                old[0] + rng.rand_range(-0.3, 0.3),
                old[1] + rng.rand_range(-0.3, 0.3),
                old[2] + rng.rand_range(-0.3, 0.3),
            ];
            let predicted = field.delta_s_phi(&lat, &time, site, k, newphi, r, u, c);

            let before = field.action(&lat, &time, r, u, c);
            let (ch, sh) = cache_values(field.dtau(), newphi);
            field.set(site, k, newphi, ch, sh);
            let after = field.action(&lat, &time, r, u, c);
            assert_relative_eq!(predicted, after - before, epsilon = 1e-9);
        }
    }

    #[test]
    fn exchange_action_is_the_r_derivative() {
        let (lat, time, field, _) = setup();
        let (u, c) = (1.0, 1.0);
        let eps = 1e-6;
        let s_plus = field.action(&lat, &time, eps, u, c);
        let s_minus = field.action(&lat, &time, -eps, u, c);
        let numeric = (s_plus - s_minus) / (2.0 * eps);
        assert_relative_eq!(
            field.exchange_action_contribution(),
            numeric,
            epsilon = 1e-6
        );
    }

    #[test]
    fn zero_field_cache_limit() {
        let (ch, sh) = cache_values(0.1, [0.0, 0.0, 0.0]);
        assert_eq!(ch, 1.0);
        assert_eq!(sh, 0.1);
    }
}
