use rayon::prelude::*;

pub fn par_iter_mut0<F: Fn(usize) + Send + Sync>(n: usize, f: F) {
    (0..n).into_par_iter().for_each(|idx| {
        f(idx);
    });
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

/// Evaluates `f` for every index in `indices` in parallel and keeps the `Some` results in input order.
pub fn par_filter_map<X: Send, F: Fn(usize) -> Option<X> + Send + Sync>(indices: &[usize], f: F) -> Vec<X> {
    indices.par_iter().filter_map(|&idx| f(idx)).collect()
}

/// Parallel map over a slice, results in input order.
pub fn par_map<T: Sync, X: Send, F: Fn(&T) -> X + Send + Sync>(items: &[T], f: F) -> Vec<X> {
    items.par_iter().map(|item| f(item)).collect()
}
