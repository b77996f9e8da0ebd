//! Small dense solves for the normal equations of the fitters.

/// Inverse of a 2x2 matrix, `None` when numerically singular.
pub(crate) fn invert_2x2(m: [[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    let scale = (m[0][0] * m[1][1]).abs().max((m[0][1] * m[1][0]).abs());
    if !det.is_finite() || det == 0.0 || det.abs() <= scale * 1e-14 {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [m[1][1] * inv, -m[0][1] * inv],
        [-m[1][0] * inv, m[0][0] * inv],
    ])
}

/// Inverse of a symmetric positive (semi-)definite matrix by Gauss-Jordan
/// elimination with partial pivoting.
///
/// The matrix is first scaled to unit diagonal, so the singularity threshold
/// on the pivots does not depend on the units of the parameters. Returns
/// `None` for a singular or non-finite matrix.
pub(crate) fn invert_symmetric(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut scale = Vec::with_capacity(n);
    for (i, row) in a.iter().enumerate() {
        let diag = row[i];
        if !(diag.is_finite() && diag > 0.0) {
            return None;
        }
        scale.push(1.0 / diag.sqrt());
    }

    let mut aug = vec![vec![0.0; 2 * n]; n];
    for i in 0..n {
        for j in 0..n {
            aug[i][j] = a[i][j] * scale[i] * scale[j];
        }
        aug[i][n + i] = 1.0;
    }

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[col][col].abs();
        for row in (col + 1)..n {
            if aug[row][col].abs() > max_val {
                max_val = aug[row][col].abs();
                max_row = row;
            }
        }
        aug.swap(col, max_row);

        let pivot = aug[col][col];
        if !pivot.is_finite() || pivot.abs() < 1e-12 {
            return None;
        }
        for j in 0..(2 * n) {
            aug[col][j] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[row][col];
            for j in 0..(2 * n) {
                aug[row][j] -= factor * aug[col][j];
            }
        }
    }

    let mut inv = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            inv[i][j] = aug[i][n + j] * scale[i] * scale[j];
        }
    }
    Some(inv)
}

pub(crate) fn mat_vec(a: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
    a.iter()
        .map(|row| row.iter().zip(x).map(|(a, x)| a * x).sum())
        .collect()
}
