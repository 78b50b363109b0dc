/// Arithmetic mean; 0.0 for an empty input.
pub fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Compute score metrics (mean, median, 25th percentile, 75th percentile) from samples
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean(samples.iter().copied()), median, p25, p75))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(Vec::new()), 0.0);
        assert_eq!(mean([0.5, 1.0, 0.0]), 0.5);
    }

    #[test]
    fn quartiles_pick_sorted_positions() {
        let (mean, median, p25, p75) = compute_metrics(&[1.0, 0.0, 0.5, 0.25]).unwrap();
        assert!((mean - 0.4375).abs() < 1e-12);
        assert_eq!(median, 0.5);
        assert_eq!(p25, 0.25);
        assert_eq!(p75, 1.0);
        assert!(compute_metrics(&[]).is_none());
    }
}
