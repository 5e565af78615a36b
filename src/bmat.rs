//! Single-particle propagation through imaginary time: the slice-to-slice
//! B-matrices B(k, k−1) = e^{−Δτ V(φ_k)} · e^{−Δτ K} and their products.
//!
//! The sweep engine only ever consumes the `SlicePropagator` capability set
//! (left/right multiplication by B-matrix products and their inverses); the
//! dense product is kept as the reference implementation for tests. The
//! checkerboard variant factorizes e^{−Δτ K} into four commuting bond groups
//! (horizontal/vertical × even/odd), which needs an even linear lattice size
//! and makes every bond factor exactly invertible (cosh² − sinh² = 1).

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SimError};
use crate::fields::{Phi, PhiField};
use crate::lattice::{SquareLattice, XPLUS, YPLUS};
use crate::linalg::{cpx, sym_mat_exp_scaled, CMat, Cpx, RMat};

pub const XBAND: usize = 0;
pub const YBAND: usize = 1;

/// Band of a block row/column of the 4N×4N matrices: blocks 0, 1 carry the
/// X band (both spins), blocks 2, 3 the Y band.
#[inline(always)]
fn band_of_block(j: usize) -> usize {
    if j < 2 {
        XBAND
    } else {
        YBAND
    }
}

/// Hopping amplitudes, the dense propagator e^{−Δτ K} per band, and the
/// checkerboard bond factors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hoppings {
    pub hop_hor: [f64; 2],
    pub hop_ver: [f64; 2],
    /// Dense e^{−Δτ K_band}; includes the chemical potential.
    pub prop_k: [RMat; 2],
    cosh_hor: [f64; 2],
    sinh_hor: [f64; 2],
    cosh_ver: [f64; 2],
    sinh_ver: [f64; 2],
    /// Bond groups 0: horizontal even-x, 1: horizontal odd-x,
    /// 2: vertical even-y, 3: vertical odd-y. Bonds within a group are
    /// disjoint, so their 2×2 factors commute.
    bond_groups: [Vec<(u32, u32)>; 4],
}

impl Hoppings {
    pub fn new(lat: &SquareLattice, dtau: f64, mu: f64) -> Self {
        // t_ij conventions of the spin-density-wave model: the X band hops
        // with −1 horizontally and −0.5 vertically, the Y band with the
        // opposite signs and axes swapped.
        let hop_hor = [-1.0, 0.5];
        let hop_ver = [-0.5, 1.0];

        let n = lat.n();
        let mut prop_k: [RMat; 2] = [RMat::zeros(n, n), RMat::zeros(n, n)];
        for bandidx in 0..2 {
            let mut k = RMat::from_diagonal_element(n, n, -mu);
            for site in 0..n {
                // K carries −t_ij on the hopping entries
                k[(site, lat.neighbor(XPLUS, site))] -= hop_hor[bandidx];
                k[(site, lat.neighbor(crate::lattice::XMINUS, site))] -= hop_hor[bandidx];
                k[(site, lat.neighbor(YPLUS, site))] -= hop_ver[bandidx];
                k[(site, lat.neighbor(crate::lattice::YMINUS, site))] -= hop_ver[bandidx];
            }
            prop_k[bandidx] = sym_mat_exp_scaled(&k, -dtau);
        }

        let mut bond_groups: [Vec<(u32, u32)>; 4] = Default::default();
        for site in 0..n {
            let (x, y) = lat.site_coords(site);
            bond_groups[x % 2].push((site as u32, lat.neighbor(XPLUS, site) as u32));
            bond_groups[2 + y % 2].push((site as u32, lat.neighbor(YPLUS, site) as u32));
        }

        let mut cosh_hor = [0.0; 2];
        let mut sinh_hor = [0.0; 2];
        let mut cosh_ver = [0.0; 2];
        let mut sinh_ver = [0.0; 2];
        for bandidx in 0..2 {
            // bond block of e^{−Δτ K_hop}: K has −t on the bond, so the
            // factor is [[cosh(Δτ t), sinh(Δτ t)], [sinh(Δτ t), cosh(Δτ t)]]
            cosh_hor[bandidx] = (dtau * hop_hor[bandidx]).cosh();
            sinh_hor[bandidx] = (dtau * hop_hor[bandidx]).sinh();
            cosh_ver[bandidx] = (dtau * hop_ver[bandidx]).cosh();
            sinh_ver[bandidx] = (dtau * hop_ver[bandidx]).sinh();
        }

        Self {
            hop_hor,
            hop_ver,
            prop_k,
            cosh_hor,
            sinh_hor,
            cosh_ver,
            sinh_ver,
            bond_groups,
        }
    }

    #[inline]
    fn group_factors(&self, group: usize, bandidx: usize) -> (f64, f64) {
        if group < 2 {
            (self.cosh_hor[bandidx], self.sinh_hor[bandidx])
        } else {
            (self.cosh_ver[bandidx], self.sinh_ver[bandidx])
        }
    }
}

/// 4×4 vertex exponential e^{σΔτV} for one site, given the field components,
/// c = cosh(Δτ|φ|) and s = sinh(Δτ|φ|)/|φ|.
pub fn vertex_matrix(sigma: f64, phi: Phi, c: f64, s: f64) -> Matrix4<Cpx> {
    let a = sigma * phi[2] * s;
    let b = cpx(sigma * phi[0] * s, -sigma * phi[1] * s);
    let bc = cpx(sigma * phi[0] * s, sigma * phi[1] * s);
    let cc = cpx(c, 0.0);
    let ar = cpx(a, 0.0);
    let zero = cpx(0.0, 0.0);
    Matrix4::new(
        cc, zero, ar, b, //
        zero, cc, bc, -ar, //
        ar, b, cc, zero, //
        bc, -ar, zero, cc,
    )
}

/// Per-slice vertex coefficient vectors: entry (r, j) scales block (r, j) of
/// the 4N×4N vertex exponential as a site-diagonal factor.
fn vertex_coeffs(field: &PhiField, k: u32, sigma: f64) -> [[Option<Vec<Cpx>>; 4]; 4] {
    let n = field.n();
    let mut c = Vec::with_capacity(n);
    let mut a = Vec::with_capacity(n);
    let mut ma = Vec::with_capacity(n);
    let mut b = Vec::with_capacity(n);
    let mut bc = Vec::with_capacity(n);
    for site in 0..n {
        let phi = field.phi(site, k);
        let s = field.sh(site, k);
        c.push(cpx(field.ch(site, k), 0.0));
        a.push(cpx(sigma * phi[2] * s, 0.0));
        ma.push(cpx(-sigma * phi[2] * s, 0.0));
        b.push(cpx(sigma * phi[0] * s, -sigma * phi[1] * s));
        bc.push(cpx(sigma * phi[0] * s, sigma * phi[1] * s));
    }
    [
        [Some(c.clone()), None, Some(a.clone()), Some(b.clone())],
        [None, Some(c.clone()), Some(bc.clone()), Some(ma.clone())],
        [Some(a), Some(b), Some(c.clone()), None],
        [Some(bc), Some(ma), None, Some(c)],
    ]
}

/// Capability set the sweep engine needs from a model's B-matrices.
///
/// For k2 > k1 every product runs over B(k2, k2−1) ⋯ B(k1+1, k1) including
/// the aggregated chemical-potential factor e^{±Δτ(k2−k1)μ}.
pub trait SlicePropagator {
    fn n4(&self) -> usize;
    fn m(&self) -> u32;
    fn left_mult_b(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat>;
    fn right_mult_b(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat>;
    fn left_mult_b_inv(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat>;
    fn right_mult_b_inv(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat>;
    /// Dense product, reference implementation for tests and debugging.
    fn dense_b(&self, k2: u32, k1: u32) -> CMat;
}

/// Borrowed view tying the hopping data to the current field configuration;
/// constructed afresh wherever the sweep needs propagation.
pub struct SdwBmat<'a> {
    pub lat: &'a SquareLattice,
    pub hop: &'a Hoppings,
    pub field: &'a PhiField,
    pub checkerboard: bool,
    pub mu: f64,
    pub dtau: f64,
}

impl<'a> SdwBmat<'a> {
    fn n(&self) -> usize {
        self.lat.n()
    }

    /// Dense single-slice propagator B(k, k−1).
    fn dense_slice(&self, k: u32) -> CMat {
        let n = self.n();
        let vc = vertex_coeffs(self.field, k, -1.0);
        let mut b = CMat::zeros(4 * n, 4 * n);
        for r in 0..4 {
            for j in 0..4 {
                if let Some(coef) = &vc[r][j] {
                    let p = &self.hop.prop_k[band_of_block(j)];
                    for site in 0..n {
                        let cf = coef[site];
                        for col in 0..n {
                            b[(r * n + site, j * n + col)] = cf * p[(site, col)];
                        }
                    }
                }
            }
        }
        b
    }

    /// Apply the checkerboard hopping exponential e^{sign·Δτ·K_hop,band} to
    /// the rows of an N×N block.
    fn cb_hop_rows(&self, block: &mut CMat, bandidx: usize, sign: f64) {
        let groups: [usize; 4] = if sign < 0.0 { [0, 1, 2, 3] } else { [3, 2, 1, 0] };
        let ncols = block.ncols();
        for g in groups {
            let (ch, sh0) = self.hop.group_factors(g, bandidx);
            let sh = -sign * sh0;
            for &(i, j) in &self.hop.bond_groups[g] {
                let (i, j) = (i as usize, j as usize);
                for col in 0..ncols {
                    let bi = block[(i, col)];
                    let bj = block[(j, col)];
                    block[(i, col)] = ch * bi + sh * bj;
                    block[(j, col)] = sh * bi + ch * bj;
                }
            }
        }
    }

    /// Same, acting on columns (right multiplication).
    fn cb_hop_cols(&self, block: &mut CMat, bandidx: usize, sign: f64) {
        let groups: [usize; 4] = if sign < 0.0 { [3, 2, 1, 0] } else { [0, 1, 2, 3] };
        let nrows = block.nrows();
        for g in groups {
            let (ch, sh0) = self.hop.group_factors(g, bandidx);
            let sh = -sign * sh0;
            for &(i, j) in &self.hop.bond_groups[g] {
                let (i, j) = (i as usize, j as usize);
                for row in 0..nrows {
                    let bi = block[(row, i)];
                    let bj = block[(row, j)];
                    block[(row, i)] = ch * bi + sh * bj;
                    block[(row, j)] = sh * bi + ch * bj;
                }
            }
        }
    }

    fn block_owned(a: &CMat, n: usize, r: usize, c: usize) -> CMat {
        a.view((r * n, c * n), (n, n)).into_owned()
    }

    /// B(k, k−1) · A via the checkerboard split: hopping exponential per
    /// source block row, then the site-diagonal vertex coefficients.
    fn cb_left_slice(&self, a: &CMat, k: u32) -> CMat {
        let n = self.n();
        let vc = vertex_coeffs(self.field, k, -1.0);
        let mut out = CMat::zeros(4 * n, 4 * n);
        for cb in 0..4 {
            let mut h: Vec<CMat> = (0..4).map(|j| Self::block_owned(a, n, j, cb)).collect();
            for (j, hj) in h.iter_mut().enumerate() {
                self.cb_hop_rows(hj, band_of_block(j), -1.0);
            }
            for r in 0..4 {
                for (j, hj) in h.iter().enumerate() {
                    if let Some(coef) = &vc[r][j] {
                        for site in 0..n {
                            let cf = coef[site];
                            for col in 0..n {
                                out[(r * n + site, cb * n + col)] += cf * hj[(site, col)];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// B(k, k−1)⁻¹ · A = e^{+ΔτK_hop} e^{+ΔτV} · A (μ handled by the caller).
    fn cb_left_slice_inv(&self, a: &CMat, k: u32) -> CMat {
        let n = self.n();
        let vc = vertex_coeffs(self.field, k, 1.0);
        let mut out = CMat::zeros(4 * n, 4 * n);
        for cb in 0..4 {
            let src: Vec<CMat> = (0..4).map(|j| Self::block_owned(a, n, j, cb)).collect();
            for r in 0..4 {
                let mut t = CMat::zeros(n, n);
                for (j, sj) in src.iter().enumerate() {
                    if let Some(coef) = &vc[r][j] {
                        for site in 0..n {
                            let cf = coef[site];
                            for col in 0..n {
                                t[(site, col)] += cf * sj[(site, col)];
                            }
                        }
                    }
                }
                self.cb_hop_rows(&mut t, band_of_block(r), 1.0);
                out.view_mut((r * n, cb * n), (n, n)).copy_from(&t);
            }
        }
        out
    }

    /// A · B(k, k−1): vertex coefficients on the columns, then the hopping
    /// exponential per destination block column.
    fn cb_right_slice(&self, a: &CMat, k: u32) -> CMat {
        let n = self.n();
        let vc = vertex_coeffs(self.field, k, -1.0);
        let mut out = CMat::zeros(4 * n, 4 * n);
        for rb in 0..4 {
            let src: Vec<CMat> = (0..4).map(|j| Self::block_owned(a, n, rb, j)).collect();
            for cdst in 0..4 {
                let mut t = CMat::zeros(n, n);
                for (j, sj) in src.iter().enumerate() {
                    if let Some(coef) = &vc[j][cdst] {
                        for site in 0..n {
                            let cf = coef[site];
                            for row in 0..n {
                                t[(row, site)] += sj[(row, site)] * cf;
                            }
                        }
                    }
                }
                self.cb_hop_cols(&mut t, band_of_block(cdst), -1.0);
                out.view_mut((rb * n, cdst * n), (n, n)).copy_from(&t);
            }
        }
        out
    }

    /// A · B(k, k−1)⁻¹ = A · e^{+ΔτK_hop} e^{+ΔτV}.
    fn cb_right_slice_inv(&self, a: &CMat, k: u32) -> CMat {
        let n = self.n();
        let vc = vertex_coeffs(self.field, k, 1.0);
        let mut out = CMat::zeros(4 * n, 4 * n);
        for rb in 0..4 {
            let mut h: Vec<CMat> = (0..4).map(|j| Self::block_owned(a, n, rb, j)).collect();
            for (j, hj) in h.iter_mut().enumerate() {
                self.cb_hop_cols(hj, band_of_block(j), 1.0);
            }
            for cdst in 0..4 {
                for (j, hj) in h.iter().enumerate() {
                    if let Some(coef) = &vc[j][cdst] {
                        for site in 0..n {
                            let cf = coef[site];
                            for row in 0..n {
                                out[(rb * n + row, cdst * n + site)] += hj[(row, site)] * cf;
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn mu_factor(&self, k2: u32, k1: u32, sign: f64) -> Cpx {
        cpx((sign * self.dtau * f64::from(k2 - k1) * self.mu).exp(), 0.0)
    }

    fn check_range(&self, k2: u32, k1: u32) {
        debug_assert!(k2 > k1, "empty B-matrix range");
        debug_assert!(k2 <= self.field.m());
    }
}

impl<'a> SlicePropagator for SdwBmat<'a> {
    fn n4(&self) -> usize {
        4 * self.n()
    }

    fn m(&self) -> u32 {
        self.field.m()
    }

    fn left_mult_b(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat> {
        self.check_range(k2, k1);
        if self.checkerboard {
            let mut result = self.cb_left_slice(a, k1 + 1);
            for k in k1 + 2..=k2 {
                result = self.cb_left_slice(&result, k);
            }
            Ok(result * self.mu_factor(k2, k1, 1.0))
        } else {
            Ok(self.dense_b(k2, k1) * a)
        }
    }

    fn right_mult_b(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat> {
        self.check_range(k2, k1);
        if self.checkerboard {
            let mut result = self.cb_right_slice(a, k2);
            for k in (k1 + 1..k2).rev() {
                result = self.cb_right_slice(&result, k);
            }
            Ok(result * self.mu_factor(k2, k1, 1.0))
        } else {
            Ok(a * self.dense_b(k2, k1))
        }
    }

    fn left_mult_b_inv(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat> {
        self.check_range(k2, k1);
        if self.checkerboard {
            let mut result = self.cb_left_slice_inv(a, k2);
            for k in (k1 + 1..k2).rev() {
                result = self.cb_left_slice_inv(&result, k);
            }
            Ok(result * self.mu_factor(k2, k1, -1.0))
        } else {
            let b = self.dense_b(k2, k1);
            b.lu()
                .solve(a)
                .ok_or_else(|| SimError::Numerical("singular B-matrix product".into()))
        }
    }

    fn right_mult_b_inv(&self, a: &CMat, k2: u32, k1: u32) -> Result<CMat> {
        self.check_range(k2, k1);
        if self.checkerboard {
            let mut result = self.cb_right_slice_inv(a, k1 + 1);
            for k in k1 + 2..=k2 {
                result = self.cb_right_slice_inv(&result, k);
            }
            Ok(result * self.mu_factor(k2, k1, -1.0))
        } else {
            // A·B⁻¹ = (Bᵀ⁻¹ Aᵀ)ᵀ
            let bt = self.dense_b(k2, k1).transpose();
            let xt = bt
                .lu()
                .solve(&a.transpose())
                .ok_or_else(|| SimError::Numerical("singular B-matrix product".into()))?;
            Ok(xt.transpose())
        }
    }

    fn dense_b(&self, k2: u32, k1: u32) -> CMat {
        if k2 == k1 {
            return crate::linalg::identity(self.n4());
        }
        self.check_range(k2, k1);
        let mut result = self.dense_slice(k2);
        for k in (k1 + 1..k2).rev() {
            result *= self.dense_slice(k);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{identity, max_abs_diff};
    use crate::rng::SimRng;

    fn setup(checkerboard: bool, dtau: f64) -> (SquareLattice, Hoppings, PhiField, bool, f64) {
        let lat = SquareLattice::new(4);
        let mu = 0.5;
        let hop = Hoppings::new(&lat, dtau, mu);
        let mut rng = SimRng::for_replica(77, 0, 0);
        let field = PhiField::random(lat.n(), 4, dtau, &mut rng);
        (lat, hop, field, checkerboard, mu)
    }

    fn bmat<'a>(
        lat: &'a SquareLattice,
        hop: &'a Hoppings,
        field: &'a PhiField,
        checkerboard: bool,
        mu: f64,
    ) -> SdwBmat<'a> {
        SdwBmat {
            lat,
            hop,
            field,
            checkerboard,
            mu,
            dtau: field.dtau(),
        }
    }

    #[test]
    fn vertex_matrix_times_inverse_is_identity() {
        let phi = [0.3, -0.2, 0.7];
        let (c, s) = crate::fields::cache_values(0.1, phi);
        let fwd = vertex_matrix(-1.0, phi, c, s);
        let bwd = vertex_matrix(1.0, phi, c, s);
        let prod = fwd * bwd;
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((prod[(i, j)] - cpx(expected, 0.0)).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn dense_left_and_right_mult_agree_with_products() {
        let (lat, hop, field, cb, mu) = setup(false, 0.1);
        let b = bmat(&lat, &hop, &field, cb, mu);
        let mut rng = SimRng::for_replica(3, 0, 0);
        let a = CMat::from_fn(b.n4(), b.n4(), |_, _| {
            cpx(rng.rand_range(-1.0, 1.0), rng.rand_range(-1.0, 1.0))
        });
        let dense = b.dense_b(3, 1);
        assert!(max_abs_diff(&b.left_mult_b(&a, 3, 1).unwrap(), &(&dense * &a)) < 1e-12);
        assert!(max_abs_diff(&b.right_mult_b(&a, 3, 1).unwrap(), &(&a * &dense)) < 1e-12);
    }

    #[test]
    fn dense_inverse_roundtrip() {
        let (lat, hop, field, cb, mu) = setup(false, 0.1);
        let b = bmat(&lat, &hop, &field, cb, mu);
        let eye = identity(b.n4());
        let fwd = b.left_mult_b(&eye, 4, 0).unwrap();
        let back = b.left_mult_b_inv(&fwd, 4, 0).unwrap();
        assert!(max_abs_diff(&back, &eye) < 1e-8);
        let fwd = b.right_mult_b(&eye, 4, 0).unwrap();
        let back = b.right_mult_b_inv(&fwd, 4, 0).unwrap();
        assert!(max_abs_diff(&back, &eye) < 1e-8);
    }

    #[test]
    fn checkerboard_inverse_roundtrip_is_tight() {
        let (lat, hop, field, cb, mu) = setup(true, 0.1);
        let b = bmat(&lat, &hop, &field, cb, mu);
        let eye = identity(b.n4());
        let fwd = b.left_mult_b(&eye, 4, 0).unwrap();
        let back = b.left_mult_b_inv(&fwd, 4, 0).unwrap();
        // bond factors invert exactly, so this only accumulates roundoff
        assert!(max_abs_diff(&back, &eye) < 1e-10);
        let fwd = b.right_mult_b(&eye, 3, 0).unwrap();
        let back = b.right_mult_b_inv(&fwd, 3, 0).unwrap();
        assert!(max_abs_diff(&back, &eye) < 1e-10);
    }

    #[test]
    fn checkerboard_matches_dense_within_trotter_error() {
        let (lat, hop, field, _, mu) = setup(true, 0.01);
        let b = bmat(&lat, &hop, &field, true, mu);
        let eye = identity(b.n4());
        let k = 3;
        let via_cb = b.left_mult_b(&eye, k, 0).unwrap();
        let dense = b.dense_b(k, 0);
        let err = crate::linalg::frobenius_diff(&via_cb, &dense);
        assert!(err < 1e-3 * f64::from(k), "Trotter split error too large: {err}");
    }

    #[test]
    fn checkerboard_left_right_consistency() {
        let (lat, hop, field, _, mu) = setup(true, 0.1);
        let b = bmat(&lat, &hop, &field, true, mu);
        let eye = identity(b.n4());
        let left = b.left_mult_b(&eye, 2, 0).unwrap();
        let right = b.right_mult_b(&eye, 2, 0).unwrap();
        assert!(max_abs_diff(&left, &right) < 1e-11);
    }
}
