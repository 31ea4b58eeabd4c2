//! Small numeric helpers shared by the rollups and the cache analyzers.

/// Continuous percentile (linear interpolation between closest ranks), the
/// `PERCENTILE_CONT` contract. `p` in [0, 1]. Returns None on empty input.
pub fn percentile_cont(values: &[i64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<i64> = values.to_vec();
    sorted.sort_unstable();

    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower] as f64);
    }
    let weight = rank - lower as f64;
    Some(sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight)
}

/// Percentile rounded to an integer column value.
pub fn percentile_cont_int(values: &[i64], p: f64) -> Option<i64> {
    percentile_cont(values, p).map(|v| v.round() as i64)
}

/// Integer-cast average, None on empty input.
pub fn avg_int(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().sum();
    Some((sum as f64 / values.len() as f64).round() as i64)
}

/// Percentile rank of `value` in `distribution`:
/// `count(values <= value) / total * 100`, clamped to [0, 100].
/// An empty distribution ranks everything at the median.
pub fn percentile_rank(value: f64, distribution: &[f64]) -> f64 {
    if distribution.is_empty() {
        return 50.0;
    }
    let at_or_below = distribution.iter().filter(|v| **v <= value).count();
    let rank = at_or_below as f64 / distribution.len() as f64 * 100.0;
    rank.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [100, 450, 500];
        assert_eq!(percentile_cont(&values, 0.5), Some(450.0));
        // p95 of three values: rank 1.9 -> 450 + 0.9 * 50
        assert_eq!(percentile_cont(&values, 0.95), Some(495.0));
        assert_eq!(percentile_cont(&values, 0.0), Some(100.0));
        assert_eq!(percentile_cont(&values, 1.0), Some(500.0));
        assert_eq!(percentile_cont(&[], 0.5), None);
    }

    #[test]
    fn single_value_is_every_percentile() {
        assert_eq!(percentile_cont(&[42], 0.5), Some(42.0));
        assert_eq!(percentile_cont(&[42], 0.99), Some(42.0));
    }

    #[test]
    fn avg_int_rounds() {
        assert_eq!(avg_int(&[100, 500, 450]), Some(350));
        assert_eq!(avg_int(&[1, 2]), Some(2)); // 1.5 rounds away from zero
        assert_eq!(avg_int(&[]), None);
    }

    #[test]
    fn percentile_rank_counts_at_or_below() {
        let dist = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_rank(30.0, &dist), 75.0);
        assert_eq!(percentile_rank(5.0, &dist), 0.0);
        assert_eq!(percentile_rank(100.0, &dist), 100.0);
        assert_eq!(percentile_rank(1.0, &[]), 50.0);
    }
}
