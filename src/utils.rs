// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

lazy_static! {
    static ref INVALID_PATH_CHARS: Regex = Regex::new(r#"[\\'|/:*?"<>]"#).unwrap();
}

/// Log-sum-exp over a raw slice. Does not assume the slice is sorted.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp with the maximum already known.
pub fn log_sum_exp_known_max(values: &[f64], max: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Normalise log weights into probabilities.
pub fn exp_normalize(log_weights: &[f64]) -> Vec<f64> {
    let max = log_weights
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    let unnormed: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let total: f64 = unnormed.iter().sum();
    unnormed.into_iter().map(|w| w / total).collect()
}

pub fn logit(p: f64) -> f64 {
    p.ln() - (1.0 - p).ln()
}

pub fn expit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Shuffled sequence of the indices `[min, max)`.
pub fn random_sequence<R: Rng>(min: usize, max: usize, rng: &mut R) -> Vec<usize> {
    assert!(min < max);
    let mut indices: Vec<usize> = (min..max).collect();
    indices.shuffle(rng);
    indices
}

/// Probability that at least one of the listed outcomes is never drawn in
/// `draws` iid draws from the given (normalised) probabilities. Evaluated by
/// inclusion-exclusion over the subsets of outcomes.
pub fn prob_any_missing(probs: &[f64], draws: usize) -> f64 {
    let n = probs.len();
    if n == 0 {
        return 0.0;
    }
    // fewer draws than outcomes cannot cover the support
    if draws < n {
        return 1.0;
    }
    let mut result = 0.0;
    for subset in 1u64..(1u64 << n) {
        let mut mass = 0.0;
        for (i, p) in probs.iter().enumerate() {
            if subset & (1 << i) != 0 {
                mass += p;
            }
        }
        let sign = if subset.count_ones() % 2 == 1 { 1.0 } else { -1.0 };
        result += sign * (1.0 - mass).powi(draws as i32);
    }
    result.max(0.0).min(1.0)
}

/// Generator over the k-combinations of `0..n`, in lexicographic order.
pub struct CombinationIndices {
    n: usize,
    k: usize,
    current: Vec<usize>,
    completed: bool,
}

impl CombinationIndices {
    pub fn new(n: usize, k: usize) -> Self {
        CombinationIndices {
            n,
            k,
            current: (0..k).collect(),
            completed: k > n || k == 0,
        }
    }
}

impl Iterator for CombinationIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.completed {
            return None;
        }
        let result = self.current.clone();
        // advance to the next combination
        let mut i = self.k;
        loop {
            if i == 0 {
                self.completed = true;
                break;
            }
            i -= 1;
            if self.current[i] < self.n - self.k + i {
                self.current[i] += 1;
                for j in i + 1..self.k {
                    self.current[j] = self.current[j - 1] + 1;
                }
                break;
            }
        }
        Some(result)
    }
}

/// Iterate the mixed-radix grid `[1..=radix]^digits`, e.g. all assignments of
/// generation counts to parents.
pub struct MixedRadix {
    radix: usize,
    current: Vec<usize>,
    exhausted: bool,
}

impl MixedRadix {
    pub fn new(radix: usize, digits: usize) -> Self {
        MixedRadix {
            radix,
            current: vec![1; digits],
            exhausted: radix == 0,
        }
    }
}

impl Iterator for MixedRadix {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.exhausted {
            return None;
        }
        let result = self.current.clone();
        let mut i = 0;
        loop {
            if i == self.current.len() {
                self.exhausted = true;
                break;
            }
            if self.current[i] < self.radix {
                self.current[i] += 1;
                break;
            }
            self.current[i] = 1;
            i += 1;
        }
        // zero digits: yield the empty assignment exactly once
        if self.current.is_empty() {
            self.exhausted = true;
        }
        Some(result)
    }
}

/// Replace characters that are unsafe in path components.
pub fn sanitize_path_component(input: &str) -> String {
    INVALID_PATH_CHARS.replace_all(input, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log_sum_exp() {
        let values = [0.0f64.ln(), 1.0f64.ln(), 2.0f64.ln()];
        assert_relative_eq!(log_sum_exp(&values), 3.0f64.ln(), epsilon = 1e-12);
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_exp_normalize_dominant() {
        let out = exp_normalize(&[1.0, -10.0, 1000.0]);
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[2], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_prob_any_missing_two_outcomes() {
        // two equally likely outcomes, two draws: both drawn w.p. 1/2
        assert_relative_eq!(prob_any_missing(&[0.5, 0.5], 2), 0.5, epsilon = 1e-12);
        // a single draw cannot cover two outcomes
        assert_relative_eq!(prob_any_missing(&[0.5, 0.5], 1), 1.0, epsilon = 1e-12);
        assert_relative_eq!(prob_any_missing(&[1.0], 1), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_combinations() {
        let combos: Vec<_> = CombinationIndices::new(4, 2).collect();
        assert_eq!(
            combos,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(CombinationIndices::new(2, 3).count(), 0);
    }

    #[test]
    fn test_mixed_radix() {
        let grid: Vec<_> = MixedRadix::new(2, 2).collect();
        assert_eq!(
            grid,
            vec![vec![1, 1], vec![2, 1], vec![1, 2], vec![2, 2]]
        );
        // zero digits yields a single empty assignment
        assert_eq!(MixedRadix::new(3, 0).count(), 1);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_path_component("inf/01:a"), "inf_01_a");
    }
}
