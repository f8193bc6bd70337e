// Strided vector kernels and the dense LU pair used by the corrector.
//
// All routines follow the solver-wide 1-based convention: element 0 of every
// slice (and row/column 0 of every matrix) is unused padding. Sites that
// need the classic pointer-offset calls pass a subslice instead, so that
// index 1 of the argument lands on the intended first element. Negative or
// unequal strides are honored the way the classic BLAS kernels define
// them, and `n <= 0` degrades to a no-op.

/// Dot product of two strided vectors.
#[must_use]
pub fn ddot(n: i32, dx: &[f64], incx: i32, dy: &[f64], incy: i32) -> f64 {
    let mut dotprod = 0.;
    if n <= 0 {
        return dotprod;
    }

    // Unequal or nonpositive increments.
    if incx != incy || incx < 1 {
        let mut ix: i32 = 1;
        let mut iy: i32 = 1;
        if incx < 0 {
            ix = (-n + 1) * incx + 1;
        }
        if incy < 0 {
            iy = (-n + 1) * incy + 1;
        }
        for _ in 1..=n {
            dotprod += dx[ix as usize] * dy[iy as usize];
            ix += incx;
            iy += incy;
        }
        return dotprod;
    }

    // Both increments unit.
    if incx == 1 {
        for i in 1..=n as usize {
            dotprod += dx[i] * dy[i];
        }
        return dotprod;
    }

    // Equal positive nonunit increments.
    let mut i = 1;
    while i <= (n * incx) as usize {
        dotprod += dx[i] * dy[i];
        i += incx as usize;
    }
    dotprod
}

/// Scale a strided vector in place: `dx = da * dx`.
pub fn dscal(n: i32, da: f64, dx: &mut [f64], incx: i32) {
    if n <= 0 || incx <= 0 {
        return;
    }

    if incx != 1 {
        let mut i = 1;
        while i <= (n * incx) as usize {
            dx[i] *= da;
            i += incx as usize;
        }
        return;
    }

    for i in 1..=n as usize {
        dx[i] *= da;
    }
}

/// Strided AXPY: `dy = da * dx + dy`.
pub fn daxpy(n: i32, da: f64, dx: &[f64], incx: i32, dy: &mut [f64], incy: i32) {
    if n < 0 || da == 0. {
        return;
    }

    // Unequal or nonpositive increments.
    if incx != incy || incx < 1 {
        let mut ix: i32 = 1;
        let mut iy: i32 = 1;
        if incx < 0 {
            ix = (-n + 1) * incx + 1;
        }
        if incy < 0 {
            iy = (-n + 1) * incy + 1;
        }
        for _ in 1..=n {
            dy[iy as usize] += da * dx[ix as usize];
            ix += incx;
            iy += incy;
        }
        return;
    }

    // Both increments unit.
    if incx == 1 {
        for i in 1..=n as usize {
            dy[i] += da * dx[i];
        }
        return;
    }

    // Equal positive nonunit increments.
    let mut i = 1;
    while i <= (n * incx) as usize {
        dy[i] += da * dx[i];
        i += incx as usize;
    }
}

/// 1-based index of the element of largest magnitude; 0 when `n <= 0`.
/// A nonpositive increment falls back to the first element.
#[must_use]
pub fn idamax(n: i32, dx: &[f64], incx: i32) -> usize {
    if n <= 0 {
        return 0;
    }
    if n == 1 || incx <= 0 {
        return 1;
    }

    if incx != 1 {
        let mut dmax = dx[1].abs();
        let mut xindex = 1;
        let mut ii = 2;
        let mut i = (1 + incx) as usize;
        while i <= (n * incx) as usize {
            let xmag = dx[i].abs();
            if xmag > dmax {
                xindex = ii;
                dmax = xmag;
            }
            ii += 1;
            i += incx as usize;
        }
        return xindex;
    }

    let mut dmax = dx[1].abs();
    let mut xindex = 1;
    for i in 2..=n as usize {
        let xmag = dx[i].abs();
        if xmag > dmax {
            xindex = i;
            dmax = xmag;
        }
    }
    xindex
}

/// LU-factor the n-by-n matrix held in rows/columns `1..=n` of `a`, in
/// place, with partial pivoting.
///
/// On return `a` holds the factors and the multipliers used to obtain them,
/// and `ipvt[1..=n]` the pivot order. The returned flag is 0 on success, or
/// k when pivot k vanished: not an error here, but [`dgesl`] would divide
/// by zero if called with such factors.
pub fn dgefa(a: &mut [Vec<f64>], n: usize, ipvt: &mut [usize]) -> usize {
    let mut info = 0;
    let n_i32 = i32::try_from(n).unwrap_or(i32::MAX);

    for k in 1..n {
        let k_i32 = i32::try_from(k).unwrap_or(i32::MAX);
        // Pivot index: largest magnitude in a[k][k..=n].
        let j = idamax(n_i32 - k_i32 + 1, &a[k][k - 1..], 1) + k - 1;
        ipvt[k] = j;

        // A zero pivot means this part is already triangularized.
        if a[k][j] == 0. {
            info = k;
            continue;
        }

        if j != k {
            a[k].swap(j, k);
        }

        // Multipliers.
        let t = -1. / a[k][k];
        dscal(n_i32 - k_i32, t, &mut a[k][k..], 1);

        // Column elimination with row indexing.
        for i in k + 1..=n {
            let t = a[i][j];
            if j != k {
                a[i][j] = a[i][k];
                a[i][k] = t;
            }
            let (top, bottom) = a.split_at_mut(i);
            daxpy(n_i32 - k_i32, t, &top[k][k..], 1, &mut bottom[0][k..], 1);
        }
    }

    ipvt[n] = n;
    if a[n][n] == 0. {
        info = n;
    }
    info
}

/// Solve a linear system against the factors produced by [`dgefa`],
/// overwriting `b` with the solution. `job = 0` solves `A * x = b`, any
/// other value solves `transpose(A) * x = b`.
pub fn dgesl(a: &[Vec<f64>], n: usize, ipvt: &[usize], b: &mut [f64], job: i32) {
    let n_i32 = i32::try_from(n).unwrap_or(i32::MAX);

    if job == 0 {
        // Solve L * y = b.
        for k in 1..=n {
            let t = ddot(i32::try_from(k).unwrap_or(i32::MAX) - 1, &a[k], 1, b, 1);
            b[k] = (b[k] - t) / a[k][k];
        }
        // Solve U * x = y.
        for k in (1..n).rev() {
            let t = ddot(n_i32 - i32::try_from(k).unwrap_or(i32::MAX), &a[k][k..], 1, &b[k..], 1);
            b[k] += t;
            let j = ipvt[k];
            if j != k {
                b.swap(j, k);
            }
        }
        return;
    }

    // Solve transpose(U) * y = b.
    for k in 1..n {
        let j = ipvt[k];
        let t = b[j];
        if j != k {
            b[j] = b[k];
            b[k] = t;
        }
        daxpy(n_i32 - i32::try_from(k).unwrap_or(i32::MAX), t, &a[k][k..], 1, &mut b[k..], 1);
    }
    // Solve transpose(L) * x = y.
    for k in (1..=n).rev() {
        b[k] /= a[k][k];
        let t = -b[k];
        daxpy(i32::try_from(k).unwrap_or(i32::MAX) - 1, t, &a[k], 1, b, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_dot_product() {
        let dx = [0., 3.3, 5.5, 7.7, 9.9, 11.11];
        let dy = [0., 2.2, 4.4, 6.6, 8.8, 12.12];
        // n <= 0
        assert_eq!(0., ddot(-1, &dx, 1, &dy, 1));
        // the increments are not equal
        assert_eq!(dx[1] * dy[1] + dx[2] * dy[3], ddot(2, &dx, 1, &dy, 2));
        // the increments are negative
        assert_eq!(
            dx[5] * dy[5] + dx[3] * dy[3] + dx[1] * dy[1],
            ddot(3, &dx, -2, &dy, -2)
        );
        // the increments are unit
        let sum: f64 = (1..dx.len()).map(|i| dx[i] * dy[i]).sum();
        assert_eq!(sum, ddot(5, &dx, 1, &dy, 1));
        // the increments are equal but not unit
        assert_eq!(
            dx[1] * dy[1] + dx[3] * dy[3] + dx[5] * dy[5],
            ddot(3, &dx, 2, &dy, 2)
        );
    }

    #[test]
    fn find_max_magnitude() {
        let dx = [0., 7.7, 9.9, 11.11, 3.3, 5.5];
        // n <= 0
        assert_eq!(0, idamax(-2, &dx, 1));
        // the increment is negative
        assert_eq!(1, idamax(5, &dx, -2));
        // increments are not unit
        assert_eq!(2, idamax(3, &dx, 2));
        // increments are unit
        assert_eq!(3, idamax(3, &dx, 1));
    }

    #[test]
    fn scale_vector() {
        let a = 1.99;
        let dx = [0., 3.3, 5.5, 7.7, 9.9, 11.11, 13.13, 15.15, 17.17, 19.19];
        // increments are unit
        let mut got = dx;
        dscal(9, a, &mut got, 1);
        for i in 1..dx.len() {
            assert_eq!(a * dx[i], got[i]);
        }
        // increments are not unit: only odd entries scaled again
        dscal(5, a, &mut got, 2);
        for i in 1..dx.len() {
            // Scaling twice associates as a * (a * x), not (a * a) * x.
            let want = if i % 2 == 1 { a * (a * dx[i]) } else { a * dx[i] };
            assert_eq!(want, got[i]);
        }
        // n <= 0 is a no-op
        let before = got;
        dscal(0, a, &mut got, 1);
        assert_eq!(before, got);
    }

    #[test]
    fn calculate_ax_plus_y() {
        let dx = [0., 3.3, 5.5, 7.7, 9.9, 11.11];
        let dy = [0., 2.2, 4.4, 6.6, 8.8, 10.1];
        let a = 2.3;
        // a = 0 is a no-op
        let mut got = dy;
        daxpy(5, 0., &dx, 1, &mut got, 1);
        assert_eq!(dy, got);
        // nonpositive increments
        let mut got = dy;
        daxpy(3, a, &dx, -2, &mut got, -2);
        for i in 1..dx.len() {
            let want = if i % 2 == 0 { dy[i] } else { a * dx[i] + dy[i] };
            assert_eq!(want, got[i]);
        }
        // nonequal increments
        let mut got = dy;
        daxpy(2, a, &dx, 2, &mut got, 1);
        assert_eq!(a * dx[1] + dy[1], got[1]);
        assert_eq!(a * dx[3] + dy[2], got[2]);
        // increments are equal but not unit
        let mut got = dy;
        daxpy(3, a, &dx, 2, &mut got, 2);
        for i in 1..dx.len() {
            let want = if i % 2 == 1 { a * dx[i] + dy[i] } else { dy[i] };
            assert_eq!(want, got[i]);
        }
        // increments are unit, applied through a subslice offset
        let dx2 = [0., 3.3, 5.5, 7.7, 9.9, 11.11, 13.13, 15.15, 17.17, 19.19];
        let dy2 = [0., 2.2, 4.4, 6.6, 8.8, 10.1, 12.12, 14.14, 16.16, 18.18];
        let mut got = dy2;
        daxpy(8, a, &dx2[1..], 1, &mut got[1..], 1);
        assert_eq!(dy2[1], got[1]);
        for i in 2..dx2.len() {
            assert_eq!(a * dx2[i] + dy2[i], got[i]);
        }
    }

    #[test]
    fn perform_lu_decomposition_with_singular_matrix() {
        let mut arr1 = vec![
            vec![0., 0., 0., 0.],
            vec![0., 2., 1., 5.],
            vec![0., 4., 4., -4.],
            vec![0., 2., 1., 5.],
        ];
        let mut ipvt = vec![0_usize; 4];
        assert_ne!(0, dgefa(&mut arr1, 3, &mut ipvt));

        let mut arr2 = vec![
            vec![0., 0., 0., 0.],
            vec![0., 2., 4., 3.],
            vec![0., 0., 0., 0.],
            vec![0., 5., 3., 7.],
            vec![0., 2., 0., 1.],
        ];
        let mut ipvt = vec![0_usize; 4];
        assert_ne!(0, dgefa(&mut arr2, 3, &mut ipvt));
    }

    #[test]
    fn solve_linear_system() {
        let mut arr = vec![
            vec![0., 0., 0., 0.],
            vec![0., 1., -1., 3., 7.],
            vec![0., 10., -1., 0., -2.],
            vec![0., 100., 2., 2., 4.],
            vec![0., 5., 99., 2., 9.],
        ];
        let mut ipvt = vec![0_usize; 5];
        assert_eq!(0, dgefa(&mut arr, 4, &mut ipvt));

        let mut b = [0., 727.4, -175., 740.4, 1471.2];
        dgesl(&arr, 4, &ipvt, &mut b, 0);
        let analytical = [0., 3.1, 5.4, 9.2, 100.3];
        for i in 1..b.len() {
            assert!((b[i] - analytical[i]).abs() < 1e-12);
        }
    }
}
