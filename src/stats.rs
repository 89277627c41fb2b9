//! Small statistics helpers used by the synthesizer and the residual
//! post-processing.

pub fn compute_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn compute_mean_absolute_deviation(values: &[f64], mean: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| (v - mean).abs()).collect();
    compute_mean(&deviations)
}

/// Median via partial selection.
///
/// For even-length input the result is the average of the middle element
/// and the maximum of the lower half after the selection pass, not the
/// textbook average of the two central order statistics.
pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut tmp = values.to_vec();
    let middle = tmp.len() / 2;
    tmp.select_nth_unstable_by(middle, |a, b| a.total_cmp(b));
    let mut median = tmp[middle];
    if tmp.len() % 2 == 0 {
        let left_middle = tmp[..middle]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        median = (left_middle + median) / 2.0;
    }
    median
}

pub fn compute_median_absolute_deviation(values: &[f64], median: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    compute_median(&deviations)
}
