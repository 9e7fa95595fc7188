/*
 * Scalar helpers shared by the RBM sampler and the recurrent conditioner.
 *
 * Everything that ends up inside a log() goes through clamp_probability() first; sigmoid outputs
 * of exactly 0.0 or 1.0 are common once the weights grow a bit.
 */

/// Probabilities are kept this far away from 0 and 1 before taking logarithms.
pub const PROBABILITY_EPSILON: f64 = 1e-7;

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// log(1 + exp(x)) without overflowing for large x.
#[inline]
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Derivative of tanh, given the already computed output y = tanh(x).
#[inline]
pub fn tanh_derivative_from_output(y: f64) -> f64 {
    1.0 - y * y
}

/// Derivative of the logistic sigmoid, given the already computed output y = sigmoid(x).
#[inline]
pub fn sigmoid_derivative_from_output(y: f64) -> f64 {
    y * (1.0 - y)
}

#[inline]
pub fn clamp_probability(p: f64) -> f64 {
    num::clamp(p, PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// x * log(y), defined as 0 when x is 0 (even if y is 0 too).
#[inline]
pub fn xlogy0(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x * y.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    quickcheck! {
        fn sigmoid_stays_in_unit_interval(x: f64) -> bool {
            if !x.is_finite() {
                return true;
            }
            let y = sigmoid(x);
            y >= 0.0 && y <= 1.0
        }
    }

    quickcheck! {
        fn softplus_matches_naive_for_moderate_inputs(x: f64) -> bool {
            if !x.is_finite() || x.abs() > 30.0 {
                return true;
            }
            (softplus(x) - (1.0 + x.exp()).ln()).abs() < 1e-9
        }
    }

    #[test]
    fn softplus_does_not_overflow() {
        assert!((softplus(1000.0) - 1000.0).abs() < 1e-9);
        assert!(softplus(-1000.0) >= 0.0);
        assert!(softplus(-1000.0) < 1e-300);
    }

    #[test]
    fn sigmoid_is_symmetric() {
        for x in &[0.0, 0.5, 3.0, 40.0, 800.0] {
            assert!((sigmoid(*x) + sigmoid(-*x) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn clamped_probabilities_have_finite_logs() {
        assert!(clamp_probability(0.0).ln().is_finite());
        assert!((1.0 - clamp_probability(1.0)).ln().is_finite());
        assert_eq!(clamp_probability(0.25), 0.25);
    }

    #[test]
    fn xlogy0_ignores_zero_weight() {
        assert_eq!(xlogy0(0.0, 0.0), 0.0);
        assert!((xlogy0(2.0, 1.0)).abs() < 1e-12);
        assert!(xlogy0(1.0, 0.5) < 0.0);
    }
}
