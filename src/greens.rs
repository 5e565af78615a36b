//! Equal-time Green's function bookkeeping: single-slice wraps between
//! stabilization points and UDV-stack re-stabilization at every s-th slice.
//!
//! The stack keeps two rings of factorizations over the time axis:
//! `udv_right[i]` holds B(i·s, 0) and is rebuilt chunk by chunk during up
//! sweeps, `udv_left[i]` holds B(m, i·s) and is rebuilt during down sweeps.
//! At a stabilization point the segment rebuilt this sweep meets the segment
//! stored by the previous sweep in the opposite direction, which is exactly
//! the full product needed for a fresh G(k) = (I + B(k,0)·B(m,k))⁻¹.

use serde::{Deserialize, Serialize};

use crate::bmat::SlicePropagator;
use crate::errors::Result;
use crate::linalg::{
    green_from_udv, green_from_udv_pair, identity, max_abs, max_abs_diff, scale_cols, scale_rows,
    udv_decompose, CMat, Udv,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    Up,
    Down,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreensEngine {
    n4: usize,
    m: u32,
    /// Stabilization interval in slices; divides m.
    s: u32,
    /// One Green's function per slice tag 0..=m; slice k holds G(k) for the
    /// sweep that last visited it.
    pub green: Vec<CMat>,
    udv_right: Vec<Udv>,
    udv_left: Vec<Udv>,
    /// Direction the next full sweep will take.
    pub next_direction: SweepDirection,
    /// Relative wrap-vs-fresh deviation seen at the latest stabilization.
    pub last_deviation: f64,
    /// (slice, relative deviation) records of the current sweep.
    #[serde(skip)]
    pub deviations: Vec<(u32, f64)>,
}

impl GreensEngine {
    pub fn new(n4: usize, m: u32, s: u32) -> Self {
        debug_assert!(s >= 1 && m % s == 0);
        let chunks = (m / s) as usize;
        Self {
            n4,
            m,
            s,
            green: vec![identity(n4); m as usize + 1],
            udv_right: vec![Udv::identity(n4); chunks + 1],
            udv_left: vec![Udv::identity(n4); chunks + 1],
            next_direction: SweepDirection::Up,
            last_deviation: 0.0,
            deviations: Vec::new(),
        }
    }

    #[inline]
    pub fn s(&self) -> u32 {
        self.s
    }

    /// Build the left stack and the initial Green's function from the
    /// current field configuration; the first sweep goes up.
    pub fn setup<B: SlicePropagator>(&mut self, b: &B) -> Result<()> {
        let chunks = (self.m / self.s) as usize;
        self.udv_left[chunks] = Udv::identity(self.n4);
        for i in (0..chunks).rev() {
            let k_hi = (i as u32 + 1) * self.s;
            let k_lo = i as u32 * self.s;
            let next = &self.udv_left[i + 1];
            let m1 = b.right_mult_b(&next.v, k_hi, k_lo)?;
            let mid = udv_decompose(&scale_rows(&next.d, &m1));
            self.udv_left[i] = Udv {
                u: &next.u * &mid.u,
                d: mid.d,
                v: mid.v,
            };
        }
        self.udv_right[0] = Udv::identity(self.n4);
        let g0 = green_from_udv(&self.udv_left[0])?;
        self.green[self.m as usize] = g0.clone();
        self.green[0] = g0;
        self.next_direction = SweepDirection::Up;
        Ok(())
    }

    /// G(k) = B(k, k−1) · G(k−1) · B(k, k−1)⁻¹
    pub fn wrap_up<B: SlicePropagator>(&mut self, b: &B, k: u32) -> Result<()> {
        let g = b.right_mult_b_inv(&self.green[k as usize - 1], k, k - 1)?;
        self.green[k as usize] = b.left_mult_b(&g, k, k - 1)?;
        Ok(())
    }

    /// G(k−1) = B(k, k−1)⁻¹ · G(k) · B(k, k−1)
    pub fn wrap_down<B: SlicePropagator>(&mut self, b: &B, k: u32) -> Result<()> {
        let g = b.left_mult_b_inv(&self.green[k as usize], k, k - 1)?;
        self.green[k as usize - 1] = b.right_mult_b(&g, k, k - 1)?;
        Ok(())
    }

    /// Re-stabilize at slice k = i·s during an up sweep: extend the right
    /// stack by the chunk just swept and replace the wrapped G(k) by a fresh
    /// recomputation. Returns the relative deviation that was accumulated.
    pub fn stabilize_up<B: SlicePropagator>(&mut self, b: &B, k: u32) -> Result<f64> {
        debug_assert!(k % self.s == 0 && k >= self.s);
        let i = (k / self.s) as usize;
        let prev = &self.udv_right[i - 1];
        let m1 = b.left_mult_b(&prev.u, k, k - self.s)?;
        let mid = udv_decompose(&scale_cols(&m1, &prev.d));
        let r_i = Udv {
            u: mid.u,
            d: mid.d,
            v: &mid.v * &prev.v,
        };
        let fresh = if k == self.m {
            green_from_udv(&r_i)?
        } else {
            green_from_udv_pair(&self.udv_left[i], &r_i)?
        };
        let dev = self.record_deviation(k, &fresh);
        self.green[k as usize] = fresh;
        self.udv_right[i] = r_i;
        Ok(dev)
    }

    /// Re-stabilize at slice k = i·s during a down sweep (after the wrap to
    /// k): extend the left stack downward and refresh G(k).
    pub fn stabilize_down<B: SlicePropagator>(&mut self, b: &B, k: u32) -> Result<f64> {
        debug_assert!(k % self.s == 0 && k < self.m);
        let i = (k / self.s) as usize;
        let next = &self.udv_left[i + 1];
        let m1 = b.right_mult_b(&next.v, k + self.s, k)?;
        let mid = udv_decompose(&scale_rows(&next.d, &m1));
        let l_i = Udv {
            u: &next.u * &mid.u,
            d: mid.d,
            v: mid.v,
        };
        let fresh = if i == 0 {
            green_from_udv(&l_i)?
        } else {
            green_from_udv_pair(&l_i, &self.udv_right[i])?
        };
        let dev = self.record_deviation(k, &fresh);
        self.green[k as usize] = fresh;
        self.udv_left[i] = l_i;
        Ok(dev)
    }

    fn record_deviation(&mut self, k: u32, fresh: &CMat) -> f64 {
        let scale = max_abs(fresh).max(f64::MIN_POSITIVE);
        let dev = max_abs_diff(&self.green[k as usize], fresh) / scale;
        self.last_deviation = dev;
        self.deviations.push((k, dev));
        dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmat::{Hoppings, SdwBmat};
    use crate::fields::PhiField;
    use crate::lattice::SquareLattice;
    use crate::rng::SimRng;

    struct Fixture {
        lat: SquareLattice,
        hop: Hoppings,
        field: PhiField,
    }

    fn fixture(m: u32, dtau: f64) -> Fixture {
        let lat = SquareLattice::new(4);
        let hop = Hoppings::new(&lat, dtau, 0.5);
        let mut rng = SimRng::for_replica(21, 0, 0);
        let field = PhiField::random(lat.n(), m, dtau, &mut rng);
        Fixture { lat, hop, field }
    }

    fn bmat(fx: &Fixture) -> SdwBmat<'_> {
        SdwBmat {
            lat: &fx.lat,
            hop: &fx.hop,
            field: &fx.field,
            checkerboard: false,
            mu: 0.5,
            dtau: fx.field.dtau(),
        }
    }

    #[test]
    fn setup_green_matches_direct_inverse() {
        let fx = fixture(4, 0.1);
        let b = bmat(&fx);
        let mut eng = GreensEngine::new(b.n4(), 4, 2);
        eng.setup(&b).unwrap();
        let dense = b.dense_b(4, 0);
        let direct = (identity(b.n4()) + dense)
            .lu()
            .solve(&identity(b.n4()))
            .unwrap();
        assert!(max_abs_diff(&eng.green[0], &direct) < 1e-10);
    }

    #[test]
    fn wrapped_green_stays_close_to_fresh_over_one_up_sweep() {
        let fx = fixture(6, 0.1);
        let b = bmat(&fx);
        let mut eng = GreensEngine::new(b.n4(), 6, 2);
        eng.setup(&b).unwrap();
        for k in 1..=6u32 {
            eng.wrap_up(&b, k).unwrap();
            if k % 2 == 0 {
                let dev = eng.stabilize_up(&b, k).unwrap();
                assert!(dev < 1e-8, "deviation {dev} at slice {k}");
            }
        }
    }

    #[test]
    fn down_sweep_follows_up_sweep_consistently() {
        let fx = fixture(6, 0.1);
        let b = bmat(&fx);
        let mut eng = GreensEngine::new(b.n4(), 6, 3);
        eng.setup(&b).unwrap();
        for k in 1..=6u32 {
            eng.wrap_up(&b, k).unwrap();
            if k % 3 == 0 {
                eng.stabilize_up(&b, k).unwrap();
            }
        }
        for k in (1..=6u32).rev() {
            eng.wrap_down(&b, k).unwrap();
            if (k - 1) % 3 == 0 && k - 1 < 6 {
                let dev = eng.stabilize_down(&b, k - 1).unwrap();
                assert!(dev < 1e-8, "deviation {dev} at slice {}", k - 1);
            }
        }
    }

    #[test]
    fn interior_stabilization_matches_direct_inverse() {
        let fx = fixture(4, 0.1);
        let b = bmat(&fx);
        let mut eng = GreensEngine::new(b.n4(), 4, 2);
        eng.setup(&b).unwrap();
        for k in 1..=2u32 {
            eng.wrap_up(&b, k).unwrap();
        }
        eng.stabilize_up(&b, 2).unwrap();
        let n4 = b.n4();
        let prod = b.dense_b(2, 0) * b.dense_b(4, 2);
        let direct = (identity(n4) + prod).lu().solve(&identity(n4)).unwrap();
        assert!(max_abs_diff(&eng.green[2], &direct) < 1e-9);
    }
}
