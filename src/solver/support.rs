use crate::solver::ETA;
use crate::solver::linalg::dgesl;
use log::error;

// Error-weight and norm helpers plus the history-array interpolator.
// Everything here follows the 1-based array convention of the solver core.

/// Build the error-weight vector for the current solution `ycur`.
///
/// `itol` selects how `rtol` and `atol` are read, mirroring the four
/// documented tolerance modes:
/// 1 = scalar rtol, scalar atol; 2 = scalar rtol, array atol;
/// 3 = array rtol, scalar atol; 4 = array rtol, array atol.
/// Scalars live in element 1 of their slice.
///
/// The weight of component i is `rtol_i * |ycur_i| + atol_i`. The caller is
/// responsible for checking positivity and inverting before use in norms.
#[must_use]
pub fn ewset(ycur: &[f64], itol: i32, rtol: &[f64], atol: &[f64], n: usize) -> Vec<f64> {
    let mut ewt = vec![0.; n + 1];
    for i in 1..=n {
        let rtoli = if itol >= 3 { rtol[i] } else { rtol[1] };
        let atoli = if itol == 2 || itol == 4 { atol[i] } else { atol[1] };
        ewt[i] = rtoli * ycur[i].abs() + atoli;
    }
    ewt
}

/// Weighted max-norm of `v[1..=n]` with weights `w`: `max_i |v_i| * w_i`.
/// Used identically by the convergence test and the error test.
#[must_use]
pub fn vmnorm(n: usize, v: &[f64], w: &[f64]) -> f64 {
    let mut vm: f64 = 0.;
    for i in 1..=n {
        vm = vm.max(v[i].abs() * w[i]);
    }
    vm
}

/// Norm of the n-by-n matrix `a`, consistent with the weighted max-norm on
/// vectors given by [`vmnorm`]: `max_i ( w_i * sum_j |a_ij| / w_j )`.
/// `w` is the inverted error-weight vector.
#[must_use]
pub fn fnorm(n: usize, a: &[Vec<f64>], w: &[f64]) -> f64 {
    let mut an: f64 = 0.;
    for i in 1..=n {
        let mut sum = 0.;
        for j in 1..=n {
            sum += a[i][j].abs() / w[j];
        }
        an = an.max(sum * w[i]);
    }
    an
}

/// Why an interpolation request was rejected. Carries the classic codes the
/// controller folds into its interpolation-error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpError {
    /// The requested derivative order lies outside `[0, nq]` (code -1).
    IllegalOrder,
    /// The requested time lies outside `[tn - hu, tn]` (code -2).
    IllegalTimeWindow,
}

impl InterpError {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            InterpError::IllegalOrder => -1,
            InterpError::IllegalTimeWindow => -2,
        }
    }
}

/// Compute the k-th derivative of the interpolating polynomial at time `t`
/// from the Nordsieck history array `yh`, where `k = 0` yields the solution
/// itself.
///
/// `nq` is the current order, `tn` the time reached by the last step, `h`
/// the current step size and `hu` the size of the last accepted step. `t`
/// must lie within `[tn - hu, tn]`, up to a roundoff allowance. On success
/// the result is returned in the 1-based layout (element 0 unused).
///
/// The polynomial is evaluated by nested multiplication in the normalized
/// variable `s = (t - tn)/h`, then scaled by `h^(-k)`.
pub fn intdy(
    t: f64,
    k: usize,
    yh: &[Vec<f64>],
    n: usize,
    nq: usize,
    tn: f64,
    h: f64,
    hu: f64,
) -> Result<Vec<f64>, InterpError> {
    if k > nq {
        return Err(InterpError::IllegalOrder);
    }
    let tp = tn - hu - 100. * ETA * (tn + hu);
    if (t - tp) * (t - tn) > 0. {
        return Err(InterpError::IllegalTimeWindow);
    }

    let l = nq + 1;
    let s = (t - tn) / h;
    let mut dky = vec![0.; n + 1];

    let mut ic: usize = 1;
    for jj in (l - k)..=nq {
        ic *= jj;
    }
    #[allow(clippy::cast_precision_loss)]
    let mut c = ic as f64;
    for i in 1..=n {
        dky[i] = c * yh[l][i];
    }
    for j in (k..nq).rev() {
        let jp1 = j + 1;
        ic = 1;
        for jj in (jp1 - k)..=j {
            ic *= jj;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            c = ic as f64;
        }
        for i in 1..=n {
            dky[i] = c * yh[jp1][i] + s * dky[i];
        }
    }
    if k == 0 {
        return Ok(dky);
    }
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    let r = h.powi(-(k as i32));
    for i in 1..=n {
        dky[i] *= r;
    }
    Ok(dky)
}

/// Solve the corrector linear system in place against the factored
/// iteration matrix `wm`. The chord methods (miter 1 and 2) use the cached
/// LU factors; any other miter value leaves `b` untouched, since functional
/// iteration never reaches this routine.
pub fn solsy(b: &mut [f64], wm: &[Vec<f64>], n: usize, ipvt: &[usize], miter: i32) {
    if miter == 1 || miter == 2 {
        dgesl(wm, n, ipvt, b, 0);
    } else {
        error!("corrector solve requested with miter = {miter}");
    }
}
