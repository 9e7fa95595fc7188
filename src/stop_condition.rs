use statrs::function::erf::erf;

/// Slope of the least squares line through the series (x-coordinates are 0, 1, 2, ...) and the
/// variance of that slope estimate.
fn slope_and_variance(series: &[f64]) -> (f64, f64) {
    assert!(series.len() >= 3);

    // y = a + b*x + e
    let mut xsum = 0.0;
    let mut ysum = 0.0;
    let mut xysum = 0.0;
    let mut x2sum = 0.0;

    for (idx, v) in series.iter().enumerate() {
        let x = idx as f64;
        xsum += x;
        x2sum += x * x;
        ysum += v;
        xysum += x * v;
    }

    let n: f64 = series.len() as f64;
    let b = (n * xysum - xsum * ysum) / (n * x2sum - xsum * xsum);
    let a = ysum / n - (xsum / n) * b;

    let mut residuals: f64 = 0.0;
    for (idx, v) in series.iter().enumerate() {
        let prediction = a + b * idx as f64;
        residuals += (v - prediction) * (v - prediction);
    }
    let var = residuals / (n - 2.0);

    (b, (12.0 * var) / (n * n * n - n))
}

/// Probability that the series is trending upwards, P(slope > 0) with the slope modeled as a
/// gaussian around its least squares estimate.
///
/// Series shorter than 3 points say nothing and give 0.5.
pub fn series_is_trending_up(series: &[f64]) -> f64 {
    if series.len() < 3 {
        return 0.5;
    }
    let (m, var) = slope_and_variance(series);
    if var == 0.0 {
        // perfectly straight line
        return if m > 0.0 {
            1.0
        } else if m < 0.0 {
            0.0
        } else {
            0.5
        };
    }
    0.5 * (1.0 + erf(m / (var.sqrt() * (2.0_f64).sqrt())))
}
