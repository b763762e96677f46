//! Clay code geometry.
//!
//! A Clay code with parameters `(k, m)` arranges the `n = k + m` chunks on
//! a `q x t` grid with `q = m` and `t = ceil(n / q)` (the grid may carry
//! `q*t - n` virtual chunks at the tail). Every chunk subdivides into
//! `w = q^t` sub-chunks. Repairing chunk `(x, y)` (`x = i % q`,
//! `y = i / q`) reads, from every survivor, exactly the sub-chunks whose
//! index has `x` as its `y`-th base-`q` digit: `w / q` sub-chunks grouped
//! into `q^y` contiguous runs of `q^(t-1-y)`.

use crate::codec::{ErasureError, Result};
use stripeio_common::EcParam;

/// Sub-chunk count `w` for the supported Clay parameter table.
pub fn clay_sub_chunk_count(k: EcParam, m: EcParam) -> Result<usize> {
    match (k, m) {
        (4, 2) => Ok(8),
        (6, 3) => Ok(27),
        (8, 4) => Ok(64),
        (10, 4) => Ok(256),
        _ => Err(ErasureError::InvalidParams(format!(
            "unsupported clay parameters k={k} m={m}"
        ))),
    }
}

/// The minimum sub-chunk set read from each survivor to repair
/// `failed_index`, as `(start, count)` runs of sub-chunk indices.
///
/// The runs cover `w / q` sub-chunks in total; the same set applies to
/// every survivor.
pub fn repair_sub_chunk_ranges(
    k: EcParam,
    m: EcParam,
    failed_index: usize,
) -> Result<Vec<(usize, usize)>> {
    let w = clay_sub_chunk_count(k, m)?;
    let n = (k + m) as usize;
    if failed_index >= n {
        return Err(ErasureError::InvalidParams(format!(
            "failed index {failed_index} out of range for n={n}"
        )));
    }
    let q = m as usize;
    let t = n.div_ceil(q);
    debug_assert_eq!(q.pow(t as u32), w);

    let x_lost = failed_index % q;
    let y_lost = failed_index / q;
    let run_len = q.pow((t - 1 - y_lost) as u32);
    let num_runs = q.pow(y_lost as u32);

    let mut runs = Vec::with_capacity(num_runs);
    let mut index = x_lost * run_len;
    for _ in 0..num_runs {
        runs.push((index, run_len));
        index += q * run_len;
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_chunk_table() {
        assert_eq!(clay_sub_chunk_count(4, 2).unwrap(), 8);
        assert_eq!(clay_sub_chunk_count(6, 3).unwrap(), 27);
        assert_eq!(clay_sub_chunk_count(8, 4).unwrap(), 64);
        assert_eq!(clay_sub_chunk_count(10, 4).unwrap(), 256);
        assert!(clay_sub_chunk_count(3, 2).is_err());
    }

    #[test]
    fn repair_reads_w_over_q_sub_chunks() {
        for (k, m) in [(4, 2), (6, 3), (8, 4), (10, 4)] {
            let w = clay_sub_chunk_count(k, m).unwrap();
            let q = m as usize;
            for failed in 0..(k + m) as usize {
                let runs = repair_sub_chunk_ranges(k, m, failed).unwrap();
                let total: usize = runs.iter().map(|(_, c)| c).sum();
                assert_eq!(total, w / q, "k={k} m={m} failed={failed}");
                for (start, count) in runs {
                    assert!(start + count <= w);
                }
            }
        }
    }

    #[test]
    fn repair_runs_for_4_2() {
        // n=6, q=2, t=3, w=8. Failed chunk 3 sits at (x=1, y=1):
        // two runs of two sub-chunks.
        let runs = repair_sub_chunk_ranges(4, 2, 3).unwrap();
        assert_eq!(runs, vec![(2, 2), (6, 2)]);
        // Failed chunk 0 at (0, 0): one run of four.
        let runs = repair_sub_chunk_ranges(4, 2, 0).unwrap();
        assert_eq!(runs, vec![(0, 4)]);
    }

    #[test]
    fn failed_index_bounds_checked() {
        assert!(repair_sub_chunk_ranges(4, 2, 6).is_err());
    }
}
