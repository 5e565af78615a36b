//! Dense complex linear algebra for the sweep engine: UDV factorization of
//! B-matrix products and the stabilized recomputation of the equal-time
//! Green's function.
//!
//! A UDV triple holds U (unitary, from a Householder QR), D (positive
//! diagonal, the magnitudes of the R diagonal) and V (upper triangular with
//! unit-magnitude diagonal). Long products of B matrices develop singular
//! values spread over many orders of magnitude; keeping D separate is what
//! makes the Green recomputation below numerically safe.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SimError};

pub type Cpx = Complex<f64>;
pub type CMat = DMatrix<Cpx>;
pub type CVec = DVector<Cpx>;
pub type RMat = DMatrix<f64>;
pub type RVec = DVector<f64>;

#[inline]
pub fn cpx(re: f64, im: f64) -> Cpx {
    Complex::new(re, im)
}

pub fn identity(n: usize) -> CMat {
    CMat::identity(n, n)
}

/// U · diag(d) · V factorization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Udv {
    pub u: CMat,
    pub d: RVec,
    pub v: CMat,
}

impl Udv {
    pub fn identity(n: usize) -> Self {
        Self {
            u: identity(n),
            d: RVec::from_element(n, 1.0),
            v: identity(n),
        }
    }

    /// Reassemble the represented matrix (reference implementation for
    /// tests; production code never forms this product).
    pub fn matrix(&self) -> CMat {
        &self.u * scale_rows(&self.d, &self.v)
    }
}

/// diag(d) · a
pub fn scale_rows(d: &RVec, a: &CMat) -> CMat {
    let mut out = a.clone();
    for i in 0..out.nrows() {
        let s = cpx(d[i], 0.0);
        for j in 0..out.ncols() {
            out[(i, j)] *= s;
        }
    }
    out
}

/// a · diag(d)
pub fn scale_cols(a: &CMat, d: &RVec) -> CMat {
    let mut out = a.clone();
    for j in 0..out.ncols() {
        let s = cpx(d[j], 0.0);
        for i in 0..out.nrows() {
            out[(i, j)] *= s;
        }
    }
    out
}

/// QR-based UDV factorization of a square complex matrix.
pub fn udv_decompose(a: &CMat) -> Udv {
    let n = a.nrows();
    let qr = a.clone().qr();
    let u = qr.q();
    let r = qr.r();
    let mut d = RVec::zeros(n);
    let mut v = r;
    for i in 0..n {
        let di = v[(i, i)].norm();
        // An exactly singular row keeps its zeros; d = 1 leaves V consistent.
        let di = if di > 0.0 { di } else { 1.0 };
        d[i] = di;
        let inv = cpx(1.0 / di, 0.0);
        for j in i..n {
            v[(i, j)] *= inv;
        }
    }
    Udv { u, d, v }
}

/// Stable Green's function from a single product: G = (I + U·D·V)⁻¹.
///
/// Uses G = V⁻¹ (U† V⁻¹ + D)⁻¹ U† with the diagonal split D = D_big · D_small
/// (entries clamped at 1 from below resp. above) so that neither the huge nor
/// the tiny singular values swamp the additions.
pub fn green_from_udv(udv: &Udv) -> Result<CMat> {
    let n = udv.u.nrows();
    let uh = udv.u.adjoint();
    let eye = identity(n);
    let v_inv = udv
        .v
        .solve_upper_triangular(&eye)
        .ok_or_else(|| SimError::Numerical("singular V factor in UDV stack".into()))?;

    let d_big: RVec = udv.d.map(|x| x.max(1.0));
    let d_small: RVec = udv.d.map(|x| x.min(1.0));

    // M = D_big⁻¹ U† V⁻¹ + D_small
    let x = &uh * &v_inv;
    let mut mmat = CMat::zeros(n, n);
    for i in 0..n {
        let inv_big = 1.0 / d_big[i];
        for j in 0..n {
            mmat[(i, j)] = x[(i, j)] * inv_big;
        }
        mmat[(i, i)] += cpx(d_small[i], 0.0);
    }

    // rhs = D_big⁻¹ U†
    let d_big_inv: RVec = d_big.map(|x| 1.0 / x);
    let rhs = scale_rows(&d_big_inv, &uh);

    let inner = mmat
        .lu()
        .solve(&rhs)
        .ok_or_else(|| SimError::Numerical("singular matrix in Green recomputation".into()))?;
    let g = &v_inv * inner;
    if g.iter().any(|z| !z.re.is_finite() || !z.im.is_finite()) {
        return Err(SimError::Numerical(
            "non-finite entries in recomputed Green's function".into(),
        ));
    }
    Ok(g)
}

/// Stable Green's function at an interior slice from the two stack segments:
/// G(k) = (I + B(k,0)·B(m,k))⁻¹ with right = UDV of B(k,0) and
/// left = UDV of B(m,k).
pub fn green_from_udv_pair(left: &Udv, right: &Udv) -> Result<CMat> {
    // B(k,0)·B(m,k) = U_r · [d_r (V_r U_l) d_l] · V_l; re-decompose the
    // bracket so the combined product is again in UDV form.
    let mut inner = &right.v * &left.u;
    for i in 0..inner.nrows() {
        let ri = cpx(right.d[i], 0.0);
        for j in 0..inner.ncols() {
            inner[(i, j)] = ri * inner[(i, j)] * cpx(left.d[j], 0.0);
        }
    }
    let mid = udv_decompose(&inner);
    let combined = Udv {
        u: &right.u * &mid.u,
        d: mid.d,
        v: &mid.v * &left.v,
    };
    green_from_udv(&combined)
}

/// Entrywise maximum absolute difference.
pub fn max_abs_diff(a: &CMat, b: &CMat) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}

/// Entrywise maximum magnitude.
pub fn max_abs(a: &CMat) -> f64 {
    a.iter().map(|x| x.norm()).fold(0.0, f64::max)
}

/// Frobenius norm of the difference.
pub fn frobenius_diff(a: &CMat, b: &CMat) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm_sqr())
        .sum::<f64>()
        .sqrt()
}

/// e^{factor · K} for a real symmetric matrix K, by eigendecomposition.
pub fn sym_mat_exp_scaled(k: &RMat, factor: f64) -> RMat {
    let se = SymmetricEigen::new(k.clone());
    let exp_vals: RVec = se.eigenvalues.map(|l| (factor * l).exp());
    &se.eigenvectors * RMat::from_diagonal(&exp_vals) * se.eigenvectors.transpose()
}
