//! Row-major `f32` kernels shared by tensors and autograd functions.
//!
//! Every kernel works on flat slices with explicit dimensions. With the
//! `parallel` feature the row-independent kernels split work across rows with
//! rayon.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// `a (m×k) · b (k×n)`
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }

    #[cfg(feature = "parallel")]
    out.par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, out_row)| matmul_row(&a[i * k..(i + 1) * k], b, n, out_row));
    #[cfg(not(feature = "parallel"))]
    out.chunks_mut(n)
        .enumerate()
        .for_each(|(i, out_row)| matmul_row(&a[i * k..(i + 1) * k], b, n, out_row));

    out
}

fn matmul_row(a_row: &[f32], b: &[f32], n: usize, out_row: &mut [f32]) {
    for (p, &a_ip) in a_row.iter().enumerate() {
        let b_row = &b[p * n..(p + 1) * n];
        for (o, &b_pj) in out_row.iter_mut().zip(b_row) {
            *o += a_ip * b_pj;
        }
    }
}

/// Transpose of a `rows×cols` matrix
pub fn transpose(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * cols);
    let mut out = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = a[i * cols + j];
        }
    }
    out
}

/// Euclidean norm of every row
pub fn row_norms(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * cols);
    if cols == 0 {
        return vec![0.0; rows];
    }
    let norm = |row: &[f32]| row.iter().map(|v| v * v).sum::<f32>().sqrt();

    #[cfg(feature = "parallel")]
    let norms: Vec<f32> = a.par_chunks(cols).map(norm).collect();
    #[cfg(not(feature = "parallel"))]
    let norms: Vec<f32> = a.chunks(cols).map(norm).collect();

    norms
}

/// Row-wise `log(softmax(row))`, stabilized by the row maximum
pub fn log_softmax_rows(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * cols);
    let mut out = vec![0.0f32; rows * cols];
    if cols == 0 {
        return out;
    }
    for (row, out_row) in a.chunks(cols).zip(out.chunks_mut(cols)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        // work on the shifted row throughout; max is never added back
        let lse = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        for (o, &v) in out_row.iter_mut().zip(row) {
            *o = (v - max) - lse;
        }
    }
    out
}

/// Mean of every column
pub fn column_means(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * cols);
    let mut means = vec![0.0f32; cols];
    if rows == 0 || cols == 0 {
        return means;
    }
    for row in a.chunks(cols) {
        for (m, &v) in means.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut means {
        *m /= rows as f32;
    }
    means
}
