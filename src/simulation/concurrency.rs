use rayon::prelude::*;

use crate::thread_safe_ptr::ScatterPtr;

pub const RADIX_BITS: u32 = 8;
pub const RADIX_BUCKETS: usize = 1 << RADIX_BITS;
pub const RADIX_PASSES: u32 = 4;

/// Bulk operations below this many elements per chunk are not split any further.
const MIN_CHUNK_LEN: usize = 2048;

/**
 * The bulk primitives every simulation stage is written against: elementwise updates, reductions,
 * prefix sums, a stable sort by key and gathers.
 *
 * Within one call the closures must not depend on each other's writes, which is exactly the
 * ordering rule the stages already obey.
 */
pub trait ExecutionSurface: Copy + Send + Sync {
    /// Number of independent chunks a bulk operation over `n` elements is split into.
    fn chunk_count(&self, n: usize) -> usize;

    fn for_each_index<F: Fn(usize) + Send + Sync>(&self, n: usize, f: F);

    fn for_each<T1: Send, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F);

    fn for_each2<T1: Send, T2: Send, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    );

    fn for_each3<T1: Send, T2: Send, T3: Send, F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    );

    fn for_each4<
        T1: Send,
        T2: Send,
        T3: Send,
        T4: Send,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    );

    fn reduce<
        T: Sync,
        X: Send,
        I: Fn() -> X + Send + Sync,
        C: Fn(X, X) -> X + Send + Sync,
        F: Fn(usize, &T) -> X + Send + Sync,
    >(
        &self,
        arr: &[T],
        identity: I,
        combine: C,
        f: F,
    ) -> X;

    /// Writes the exclusive prefix sum of `input` into `output` and returns the total.
    fn exclusive_scan(&self, input: &[u32], output: &mut [u32]) -> u32 {
        assert_eq!(input.len(), output.len());
        let n = input.len();
        if n == 0 {
            return 0;
        }

        let chunk_len = chunk_len(n, self.chunk_count(n));
        let mut out_chunks: Vec<&mut [u32]> = output.chunks_mut(chunk_len).collect();
        let mut bases: Vec<u32> = vec![0; out_chunks.len()];

        self.for_each(&mut bases, |c, base| {
            *base = input[chunk_range(c, chunk_len, n)]
                .iter()
                .fold(0u32, |acc, &x| acc.wrapping_add(x));
        });

        let mut total = 0u32;
        for base in bases.iter_mut() {
            let chunk_sum = *base;
            *base = total;
            total = total.wrapping_add(chunk_sum);
        }

        self.for_each2(&mut out_chunks, &mut bases, |c, out, base| {
            let mut acc = *base;
            for (o, &x) in out.iter_mut().zip(&input[chunk_range(c, chunk_len, n)]) {
                *o = acc;
                acc = acc.wrapping_add(x);
            }
        });

        total
    }

    /// `dst[i] = src[indices[i]]`
    fn gather<T: Copy + Send + Sync>(&self, src: &[T], indices: &[u32], dst: &mut [T]) {
        assert_eq!(indices.len(), dst.len());
        self.for_each(dst, |i, d| {
            *d = src[indices[i] as usize];
        });
    }

    /// Stable sort of `keys`, applying the same permutation to `values`.
    fn sort_by_key(&self, keys: &mut Vec<u32>, values: &mut Vec<u32>) {
        radix_sort_by_key(self, keys, values);
    }
}

fn chunk_len(n: usize, chunk_count: usize) -> usize {
    let chunk_count = chunk_count.max(1);
    ((n + chunk_count - 1) / chunk_count).max(1)
}

fn chunk_range(c: usize, chunk_len: usize, n: usize) -> std::ops::Range<usize> {
    (c * chunk_len).min(n)..((c + 1) * chunk_len).min(n)
}

#[inline(always)]
fn digit(key: u32, shift: u32) -> usize {
    ((key >> shift) as usize) & (RADIX_BUCKETS - 1)
}

/**
 * Least significant digit radix sort with `RADIX_PASSES` passes over `RADIX_BITS` wide digits.
 *
 * Every pass builds one histogram per chunk, turns the digit-major histogram table into write cursors
 * with a single exclusive scan and scatters each chunk in input order. Chunks are processed
 * independently, the scan makes their destinations disjoint and keeps equal digits in input order.
 */
pub fn radix_sort_by_key<E: ExecutionSurface + ?Sized>(surface: &E, keys: &mut Vec<u32>, values: &mut Vec<u32>) {
    assert_eq!(keys.len(), values.len());
    let n = keys.len();
    if n < 2 {
        return;
    }

    let chunk_len = chunk_len(n, surface.chunk_count(n));
    let chunk_count = (n + chunk_len - 1) / chunk_len;

    let mut keys_tmp: Vec<u32> = vec![0; n];
    let mut values_tmp: Vec<u32> = vec![0; n];
    let mut cursors: Vec<[u32; RADIX_BUCKETS]> = vec![[0; RADIX_BUCKETS]; chunk_count];
    let mut counts: Vec<u32> = vec![0; RADIX_BUCKETS * chunk_count];
    let mut offsets: Vec<u32> = vec![0; RADIX_BUCKETS * chunk_count];

    for pass in 0..RADIX_PASSES {
        let shift = pass * RADIX_BITS;

        {
            let keys_in: &[u32] = keys;
            surface.for_each(&mut cursors, |c, histogram| {
                histogram.fill(0);
                for &key in &keys_in[chunk_range(c, chunk_len, n)] {
                    histogram[digit(key, shift)] += 1;
                }
            });
        }

        for (c, histogram) in cursors.iter().enumerate() {
            for d in 0..RADIX_BUCKETS {
                counts[d * chunk_count + c] = histogram[d];
            }
        }
        surface.exclusive_scan(&counts, &mut offsets);
        for (c, cursor) in cursors.iter_mut().enumerate() {
            for d in 0..RADIX_BUCKETS {
                cursor[d] = offsets[d * chunk_count + c];
            }
        }

        {
            let keys_in: &[u32] = keys;
            let values_in: &[u32] = values;
            let keys_out = ScatterPtr::new(&mut keys_tmp);
            let values_out = ScatterPtr::new(&mut values_tmp);
            surface.for_each(&mut cursors, |c, cursor| {
                for i in chunk_range(c, chunk_len, n) {
                    let key = keys_in[i];
                    let d = digit(key, shift);
                    let dst = cursor[d] as usize;
                    cursor[d] += 1;
                    // SAFETY: the scanned cursors hand out every destination exactly once
                    unsafe {
                        keys_out.write(dst, key);
                        values_out.write(dst, values_in[i]);
                    }
                }
            });
        }

        std::mem::swap(keys, &mut keys_tmp);
        std::mem::swap(values, &mut values_tmp);
    }
}

/// Runs every primitive on the calling thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialSurface;

impl ExecutionSurface for SerialSurface {
    fn chunk_count(&self, _n: usize) -> usize {
        1
    }

    fn for_each_index<F: Fn(usize) + Send + Sync>(&self, n: usize, f: F) {
        (0..n).for_each(|idx| {
            f(idx);
        });
    }

    fn for_each<T1: Send, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F) {
        arr1.iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    fn for_each2<T1: Send, T2: Send, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }

    fn for_each3<T1: Send, T2: Send, T3: Send, F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    ) {
        assert!(arr1.len() == arr2.len() && arr1.len() == arr3.len());
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .zip(arr3.iter_mut())
            .enumerate()
            .for_each(|(idx, ((v1, v2), v3))| {
                f(idx, v1, v2, v3);
            });
    }

    fn for_each4<
        T1: Send,
        T2: Send,
        T3: Send,
        T4: Send,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    ) {
        assert!(arr1.len() == arr2.len() && arr1.len() == arr3.len() && arr1.len() == arr4.len());
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .zip(arr3.iter_mut())
            .zip(arr4.iter_mut())
            .enumerate()
            .for_each(|(idx, (((v1, v2), v3), v4))| {
                f(idx, v1, v2, v3, v4);
            });
    }

    fn reduce<
        T: Sync,
        X: Send,
        I: Fn() -> X + Send + Sync,
        C: Fn(X, X) -> X + Send + Sync,
        F: Fn(usize, &T) -> X + Send + Sync,
    >(
        &self,
        arr: &[T],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr.iter()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .fold(identity(), |acc, value| combine(acc, value))
    }
}

/// Runs every primitive on the rayon thread pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParallelSurface;

impl ExecutionSurface for ParallelSurface {
    fn chunk_count(&self, n: usize) -> usize {
        (n / MIN_CHUNK_LEN).clamp(1, rayon::current_num_threads() * 4)
    }

    fn for_each_index<F: Fn(usize) + Send + Sync>(&self, n: usize, f: F) {
        (0..n).into_par_iter().for_each(|idx| {
            f(idx);
        });
    }

    fn for_each<T1: Send, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F) {
        arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    fn for_each2<T1: Send, T2: Send, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.into_par_iter()
            .zip(arr2.into_par_iter())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }

    fn for_each3<T1: Send, T2: Send, T3: Send, F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    ) {
        assert!(arr1.len() == arr2.len() && arr1.len() == arr3.len());
        arr1.into_par_iter()
            .zip(arr2.into_par_iter())
            .zip(arr3.into_par_iter())
            .enumerate()
            .for_each(|(idx, ((v1, v2), v3))| {
                f(idx, v1, v2, v3);
            });
    }

    fn for_each4<
        T1: Send,
        T2: Send,
        T3: Send,
        T4: Send,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    ) {
        assert!(arr1.len() == arr2.len() && arr1.len() == arr3.len() && arr1.len() == arr4.len());
        arr1.into_par_iter()
            .zip(arr2.into_par_iter())
            .zip(arr3.into_par_iter())
            .zip(arr4.into_par_iter())
            .enumerate()
            .for_each(|(idx, (((v1, v2), v3), v4))| {
                f(idx, v1, v2, v3, v4);
            });
    }

    fn reduce<
        T: Sync,
        X: Send,
        I: Fn() -> X + Send + Sync,
        C: Fn(X, X) -> X + Send + Sync,
        F: Fn(usize, &T) -> X + Send + Sync,
    >(
        &self,
        arr: &[T],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr.par_iter()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .reduce(identity, combine)
    }
}

#[cfg(test)]
fn pseudo_random_keys(n: usize, modulo: u32) -> Vec<u32> {
    // xorshift, good enough to spread keys over all digits
    let mut state: u32 = 0x9E37_79B9;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state % modulo
        })
        .collect()
}

#[cfg(test)]
fn check_sort<E: ExecutionSurface>(surface: E, n: usize, modulo: u32) {
    let original = pseudo_random_keys(n, modulo);
    let mut keys = original.clone();
    let mut values: Vec<u32> = (0..n as u32).collect();
    surface.sort_by_key(&mut keys, &mut values);

    let mut expected: Vec<(u32, u32)> = original.iter().copied().zip(0..n as u32).collect();
    // std's sort is stable as well
    expected.sort_by_key(|&(k, _)| k);

    let actual: Vec<(u32, u32)> = keys.into_iter().zip(values).collect();
    assert_eq!(actual, expected);
}

#[test]
fn radix_sort_is_stable_serial() {
    check_sort(SerialSurface, 0, 7);
    check_sort(SerialSurface, 1, 7);
    check_sort(SerialSurface, 1000, 7);
    check_sort(SerialSurface, 5000, u32::MAX);
}

#[test]
fn radix_sort_is_stable_parallel() {
    check_sort(ParallelSurface, 1000, 13);
    check_sort(ParallelSurface, 100_000, 300);
    check_sort(ParallelSurface, 100_000, u32::MAX);
}

#[test]
fn exclusive_scan_matches_sequential_sum() {
    let input = pseudo_random_keys(50_000, 100);
    let mut expected = vec![0u32; input.len()];
    let mut acc = 0;
    for (e, &x) in expected.iter_mut().zip(&input) {
        *e = acc;
        acc += x;
    }

    for total in [
        SerialSurface.exclusive_scan(&input, &mut vec![0; input.len()]),
        ParallelSurface.exclusive_scan(&input, &mut vec![0; input.len()]),
    ] {
        assert_eq!(total, acc);
    }

    let mut output = vec![0u32; input.len()];
    ParallelSurface.exclusive_scan(&input, &mut output);
    assert_eq!(output, expected);

    assert_eq!(SerialSurface.exclusive_scan(&[], &mut []), 0);
}

#[test]
fn gather_and_reduce_agree_between_surfaces() {
    let src: Vec<u32> = (0..10_000).map(|x| x * 3).collect();
    let indices: Vec<u32> = (0..10_000).rev().collect();

    let mut a = vec![0; src.len()];
    let mut b = vec![0; src.len()];
    SerialSurface.gather(&src, &indices, &mut a);
    ParallelSurface.gather(&src, &indices, &mut b);
    assert_eq!(a, b);
    assert_eq!(a[0], 9999 * 3);

    let max_serial = SerialSurface.reduce(&src, || 0, u32::max, |_, &x| x);
    let max_parallel = ParallelSurface.reduce(&src, || 0, u32::max, |_, &x| x);
    assert_eq!(max_serial, 9999 * 3);
    assert_eq!(max_parallel, max_serial);
}
