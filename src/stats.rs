//! Rank correlation between paired variables, split by condition.

use ndarray::{Array3, ArrayViewD, Axis, Ix4};

use crate::types::StatsError;

/// Spearman coefficients per signal, frequency and condition.
#[derive(Debug, Clone, PartialEq)]
pub struct RankCorrelation {
    /// Distinct condition labels in ascending order
    pub conditions: Vec<i64>,
    /// Correlation coefficients
    /// - Shape: [num_signals, num_frequencies, num_conditions]
    pub rho: Array3<f64>,
}

/// Computes the Spearman rank correlation of two paired variables.
///
/// `block` is shaped `[signals, repetitions, 2]` or
/// `[signals, repetitions, frequencies, 2]`; the two entries of the trailing
/// axis are the variables being correlated. `conditions` labels every
/// repetition, and each coefficient only uses the repetitions of one
/// condition. A 3-D block yields a single frequency.
///
/// Ties get average ranks. Conditions with fewer than two repetitions give
/// `NaN`.
pub fn spearman_by_condition(
    block: ArrayViewD<'_, f64>,
    conditions: &[i64],
) -> Result<RankCorrelation, StatsError> {
    let ndim = block.ndim();
    let block = match ndim {
        3 => block.insert_axis(Axis(2)),
        4 => block,
        n => return Err(StatsError::Dimensionality(n)),
    };
    let block = block
        .into_dimensionality::<Ix4>()
        .map_err(|_| StatsError::Dimensionality(ndim))?;

    let (signals, repetitions, frequencies, variables) = block.dim();
    if variables != 2 {
        return Err(StatsError::TrailingDimension(variables));
    }
    if conditions.len() != repetitions {
        return Err(StatsError::ConditionLength {
            expected: repetitions,
            found: conditions.len(),
        });
    }

    let mut labels = conditions.to_vec();
    labels.sort_unstable();
    labels.dedup();

    let groups: Vec<Vec<usize>> = labels
        .iter()
        .map(|&label| {
            conditions
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c == label)
                .map(|(repetition, _)| repetition)
                .collect()
        })
        .collect();

    let rho = Array3::from_shape_fn((signals, frequencies, labels.len()), |(s, f, c)| {
        let x: Vec<f64> = groups[c].iter().map(|&r| block[[s, r, f, 0]]).collect();
        let y: Vec<f64> = groups[c].iter().map(|&r| block[[s, r, f, 1]]).collect();
        spearman(&x, &y)
    });

    Ok(RankCorrelation {
        conditions: labels,
        rho,
    })
}

/// rho = 1 - 6 Σd² / (n (n² - 1)) over the rank differences d.
fn spearman(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 {
        return f64::NAN;
    }

    let rx = average_ranks(x);
    let ry = average_ranks(y);
    let d2: f64 = rx.iter().zip(&ry).map(|(a, b)| (a - b).powi(2)).sum();

    let n = n as f64;
    1.0 - 6.0 * d2 / (n * (n * n - 1.0))
}

/// 1-based ranks; tied values share the mean of the ranks they span.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then_with(|| a.cmp(&b)));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]].total_cmp(&values[order[start]]).is_eq() {
            end += 1;
        }

        let rank = 0.5 * ((start + 1) as f64 + end as f64);
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }

    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array4};

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn ties_share_average_rank() {
        assert_eq!(
            average_ranks(&[3.0, 1.0, 1.0, 2.0, 3.0, 3.0]),
            vec![5.0, 1.5, 1.5, 3.0, 5.0, 5.0]
        );
    }

    #[test]
    fn matches_hand_computed_coefficient() {
        // rank differences 0, 0, -0.5, -1, 1.5 sum to 3.5 when squared
        assert_close(
            spearman(&[1.0, 2.0, 3.0, 4.0, 5.0], &[5.0, 6.0, 7.0, 8.0, 7.0]),
            1.0 - 6.0 * 3.5 / 120.0,
        );
    }

    #[test]
    fn conditions_are_correlated_separately() {
        // signal 0: condition 1 increasing together, condition 2 opposed
        let x = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        let y = [1.0, 30.0, 2.0, 20.0, 3.0, 10.0];
        let block = Array::from_shape_fn((1, 6, 2), |(_, r, v)| if v == 0 { x[r] } else { y[r] });

        let result = spearman_by_condition(block.view().into_dyn(), &[1, 2, 1, 2, 1, 2]).unwrap();

        assert_eq!(result.conditions, vec![1, 2]);
        assert_eq!(result.rho.dim(), (1, 1, 2));
        assert_close(result.rho[[0, 0, 0]], 1.0);
        assert_close(result.rho[[0, 0, 1]], -1.0);
    }

    #[test]
    fn four_dimensional_block_keeps_frequencies() {
        let block = Array4::from_shape_fn((2, 4, 3, 2), |(s, r, f, v)| {
            let r = r as f64;
            match (s, v) {
                (0, _) => r * (f + 1) as f64,
                (_, 0) => r,
                _ => -r,
            }
        });

        let result = spearman_by_condition(block.view().into_dyn(), &[7; 4]).unwrap();

        assert_eq!(result.rho.dim(), (2, 3, 1));
        for f in 0..3 {
            assert_close(result.rho[[0, f, 0]], 1.0);
            assert_close(result.rho[[1, f, 0]], -1.0);
        }
    }

    #[test]
    fn single_repetition_gives_nan() {
        let block = Array::from_elem((1, 3, 2), 1.0);
        let result = spearman_by_condition(block.view().into_dyn(), &[0, 0, 1]).unwrap();

        assert!(result.rho[[0, 0, 1]].is_nan());
    }

    #[test]
    fn trailing_dimension_must_be_two() {
        let block = Array::from_elem((1, 3, 3), 1.0);
        let err = spearman_by_condition(block.view().into_dyn(), &[0, 0, 0]).unwrap_err();

        assert!(matches!(err, StatsError::TrailingDimension(3)));
    }

    #[test]
    fn two_dimensional_block_is_rejected() {
        let block = Array::from_elem((3, 2), 1.0);
        let err = spearman_by_condition(block.view().into_dyn(), &[0, 0, 0]).unwrap_err();

        assert!(matches!(err, StatsError::Dimensionality(2)));
    }

    #[test]
    fn every_repetition_needs_a_condition() {
        let block = Array::from_elem((1, 3, 2), 1.0);
        let err = spearman_by_condition(block.view().into_dyn(), &[0, 0]).unwrap_err();

        assert!(matches!(
            err,
            StatsError::ConditionLength {
                expected: 3,
                found: 2
            }
        ));
    }
}
