//! Two-stage centroid estimator: quickselect-median center-of-mass seed,
//! then a Levenberg-Marquardt Gaussian refinement around that seed.
//!
//! Grounded on `flydra-feature-detector`'s moment-based centroid (same
//! "subtract background, zero negatives, take the first moment" shape,
//! see `compute_slope`/`MomentState` in that crate) for the seed stage, and
//! on the `lstsq` crate's use of `nalgebra` for the linear-algebra backbone
//! of the refinement stage. `flydra-feature-detector` solves for an
//! ellipse via image moments and never performs a nonlinear fit, so the LM
//! solver itself has no direct analogue in the pack; it is hand-rolled
//! here with `nalgebra` matrices exactly as small LM solvers are commonly
//! written, with a finite-difference Jacobian rather than a symbolic one
//! since this is a six-parameter problem run at tens of hertz.

use nalgebra::{DMatrix, DVector};

pub const GUIDE_SIZE: usize = 32;
/// `0.5 / ln(2) * (2*sqrt(2*ln2))^-2`-style constant baked into the model;
/// carried over verbatim from spec.md section 4.2.
const WIDTH_DENOM: f64 = 0.180337;

/// One 32x32 unsigned-16 subraster, row-major.
#[derive(Debug, Clone)]
pub struct Subraster32 {
    pub data: Vec<u16>,
}

impl Subraster32 {
    pub fn from_rows(data: Vec<u16>) -> Self {
        assert_eq!(data.len(), GUIDE_SIZE * GUIDE_SIZE);
        Self { data }
    }

    #[inline]
    fn get(&self, x: usize, y: usize) -> u16 {
        self.data[y * GUIDE_SIZE + x]
    }
}

/// What the LM refinement holds fixed. Centroid-only guiding fixes the
/// widths and background to keep the problem well-conditioned at low SNR;
/// the one-shot FWHM measurement at guide start lets the widths float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitMode {
    CentroidOnly { width_x: f64, width_y: f64 },
    Fwhm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidResult {
    pub x: f64,
    pub y: f64,
    pub fwhm_x: f64,
    pub fwhm_y: f64,
}

/// Lomuto-partition quickselect for the element at `k`; used to find the
/// subraster's median without a full sort.
fn quickselect(values: &mut [u16], k: usize) -> u16 {
    let mut lo = 0usize;
    let mut hi = values.len() - 1;
    loop {
        if lo == hi {
            return values[lo];
        }
        let pivot = values[hi];
        let mut i = lo;
        for j in lo..hi {
            if values[j] < pivot {
                values.swap(i, j);
                i += 1;
            }
        }
        values.swap(i, hi);
        if k == i {
            return values[k];
        } else if k < i {
            hi = i - 1;
        } else {
            lo = i + 1;
        }
    }
}

/// The pixel-wise median of the subraster. Even element count (1024): per
/// spec.md this is the single quickselect result at the lower-middle
/// index, not an average of two middle elements.
pub fn median(sub: &Subraster32) -> f64 {
    let mut values = sub.data.clone();
    let n = values.len();
    quickselect(&mut values, n / 2) as f64
}

/// Center-of-mass seed over the full subraster, per spec.md section 4.2.
pub fn center_of_mass_seed(sub: &Subraster32) -> (f64, f64) {
    let med = median(sub);
    let mut sum_jv = 0.0f64;
    let mut sum_iv = 0.0f64;
    let mut sum_v = 0.0f64;
    for y in 0..GUIDE_SIZE {
        for x in 0..GUIDE_SIZE {
            let v = sub.get(x, y) as f64 - med;
            let v = v.max(0.0);
            sum_jv += x as f64 * v;
            sum_iv += y as f64 * v;
            sum_v += v;
        }
    }
    if sum_v > 0.0 {
        (sum_jv / sum_v, sum_iv / sum_v)
    } else {
        (GUIDE_SIZE as f64 / 2.0, GUIDE_SIZE as f64 / 2.0)
    }
}

struct SubSubraster {
    width: usize,
    height: usize,
    origin_x: usize,
    origin_y: usize,
    data: Vec<f64>,
}

fn extract_sub_subraster(sub: &Subraster32, seed_x: f64, seed_y: f64, half_width: i64) -> SubSubraster {
    let cx = seed_x.round() as i64;
    let cy = seed_y.round() as i64;
    let x0 = (cx - half_width).clamp(0, GUIDE_SIZE as i64) as usize;
    let x1 = (cx + half_width).clamp(0, GUIDE_SIZE as i64) as usize;
    let y0 = (cy - half_width).clamp(0, GUIDE_SIZE as i64) as usize;
    let y1 = (cy + half_width).clamp(0, GUIDE_SIZE as i64) as usize;
    let width = x1.saturating_sub(x0).max(1);
    let height = y1.saturating_sub(y0).max(1);
    let mut data = Vec::with_capacity(width * height);
    for y in y0..y0 + height {
        for x in x0..x0 + width {
            let xi = x.min(GUIDE_SIZE - 1);
            let yi = y.min(GUIDE_SIZE - 1);
            data.push(sub.get(xi, yi) as f64);
        }
    }
    SubSubraster { width, height, origin_x: x0, origin_y: y0, data }
}

/// Evaluates the Gaussian model at row `i`, column `j` for the full
/// parameter set `[x, y, width_x, width_y, amplitude, background]`, where
/// `x` is a column coordinate and `y` a row coordinate.
fn model(i: f64, j: f64, p: &[f64; 6]) -> f64 {
    let (px, py, wx, wy, amp, bg) = (p[0], p[1], p[2], p[3], p[4], p[5]);
    let ex = (j - px).powi(2) / (wx * wx * WIDTH_DENOM);
    let ey = (i - py).powi(2) / (wy * wy * WIDTH_DENOM);
    amp * (-0.5 * (ex + ey)).exp() + bg
}

/// Runs Levenberg-Marquardt over the free parameter indices listed in
/// `free`, holding everything else at its initial value, with a
/// finite-difference Jacobian.
fn levenberg_marquardt(ss: &SubSubraster, mut p: [f64; 6], free: &[usize]) -> [f64; 6] {
    let m = ss.width * ss.height;
    let n = free.len();
    let mut lambda = 1e-3f64;
    const MAX_ITERS: usize = 60;
    const EPS: f64 = 1e-6;

    let residuals = |p: &[f64; 6]| -> DVector<f64> {
        let mut r = DVector::zeros(m);
        let mut idx = 0;
        for y in 0..ss.height {
            for x in 0..ss.width {
                let i = (ss.origin_y + y) as f64;
                let j = (ss.origin_x + x) as f64;
                let predicted = model(i, j, p);
                r[idx] = ss.data[y * ss.width + x] - predicted;
                idx += 1;
            }
        }
        r
    };

    let mut cost = residuals(&p).norm_squared();

    for _ in 0..MAX_ITERS {
        let mut jac = DMatrix::<f64>::zeros(m, n);
        for (col, &pi) in free.iter().enumerate() {
            let mut p_plus = p;
            let h = (p[pi].abs() * 1e-4).max(1e-6);
            p_plus[pi] += h;
            let r0 = residuals(&p);
            let r1 = residuals(&p_plus);
            for row in 0..m {
                jac[(row, col)] = (r0[row] - r1[row]) / h;
            }
        }
        let r = residuals(&p);
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        let mut damped = jtj.clone();
        for k in 0..n {
            damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
        }

        let delta = match damped.clone().lu().solve(&jtr) {
            Some(d) => d,
            None => break,
        };

        let mut p_trial = p;
        for (k, &pi) in free.iter().enumerate() {
            p_trial[pi] += delta[k];
        }
        let trial_cost = residuals(&p_trial).norm_squared();

        if trial_cost < cost {
            let improved = cost - trial_cost;
            p = p_trial;
            cost = trial_cost;
            lambda = (lambda * 0.5).max(1e-12);
            if improved < EPS {
                break;
            }
        } else {
            lambda *= 2.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    p
}

/// Refines the center-of-mass seed with a Gaussian fit. Returns the
/// centroid in full-subraster coordinates with the source-extractor
/// `+0.5` convention applied, and (for `FitMode::Fwhm`) the fitted widths.
/// Falls back to the seed if the refined position is negative on either
/// axis.
pub fn refine(sub: &Subraster32, mode: FitMode) -> CentroidResult {
    let (seed_x, seed_y) = center_of_mass_seed(sub);
    let ss = extract_sub_subraster(sub, seed_x, seed_y, 8);
    let med = median(sub);

    let init_wx = match mode {
        FitMode::CentroidOnly { width_x, .. } => width_x,
        FitMode::Fwhm => 2.5,
    };
    let init_wy = match mode {
        FitMode::CentroidOnly { width_y, .. } => width_y,
        FitMode::Fwhm => 2.5,
    };

    let p0 = [
        seed_x - ss.origin_x as f64,
        seed_y - ss.origin_y as f64,
        init_wx,
        init_wy,
        12_800.0,
        med,
    ];

    let free: &[usize] = match mode {
        FitMode::CentroidOnly { .. } => &[0, 1, 4],
        FitMode::Fwhm => &[0, 1, 2, 3, 4],
    };

    let fit = levenberg_marquardt(&ss, p0, free);

    let x = ss.origin_x as f64 + fit[0];
    let y = ss.origin_y as f64 + fit[1];

    if x < 0.0 || y < 0.0 {
        return CentroidResult {
            x: seed_x + 0.5,
            y: seed_y + 0.5,
            fwhm_x: init_wx,
            fwhm_y: init_wy,
        };
    }

    CentroidResult {
        x: x + 0.5,
        y: y + 0.5,
        fwhm_x: fit[2],
        fwhm_y: fit[3],
    }
}
