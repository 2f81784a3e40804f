use ndarray::Array2;

use super::layers::softmax_rows;

/// Class-weighted cross-entropy over logits.
///
/// `loss = Σ w[y_i] * -log p(y_i) / Σ w[y_i]`; returns the loss and its
/// gradient w.r.t. the logits. An empty `weights` slice means uniform weights.
pub fn weighted_cross_entropy(
    logits: &Array2<f32>,
    targets: &[usize],
    weights: &[f32],
) -> (f32, Array2<f32>) {
    let probs = softmax_rows(logits);
    let mut grad = probs.clone();
    let mut total = 0.0f32;
    let mut mass = 0.0f32;

    for (i, &y) in targets.iter().enumerate() {
        let w = weights.get(y).copied().unwrap_or(1.0);
        total -= w * probs[[i, y]].max(f32::MIN_POSITIVE).ln();
        mass += w;
        grad[[i, y]] -= 1.0;
        grad.row_mut(i).mapv_inplace(|g| g * w);
    }

    if mass <= 0.0 {
        return (0.0, Array2::zeros(logits.raw_dim()));
    }
    grad.mapv_inplace(|g| g / mass);
    (total / mass, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn uniform_logits_give_log_k() {
        let logits = Array2::zeros((2, 4));
        let (loss, _) = weighted_cross_entropy(&logits, &[0, 3], &[]);
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let logits = array![[0.2f32, -0.1, 0.5], [1.0, 0.0, -1.0]];
        let targets = [2, 0];
        let weights = [1.0, 2.0, 0.5];
        let (_, grad) = weighted_cross_entropy(&logits, &targets, &weights);

        let eps = 1e-3;
        for i in 0..2 {
            for j in 0..3 {
                let mut plus = logits.clone();
                plus[[i, j]] += eps;
                let mut minus = logits.clone();
                minus[[i, j]] -= eps;
                let (lp, _) = weighted_cross_entropy(&plus, &targets, &weights);
                let (lm, _) = weighted_cross_entropy(&minus, &targets, &weights);
                let numeric = (lp - lm) / (2.0 * eps);
                assert!(
                    (numeric - grad[[i, j]]).abs() < 1e-3,
                    "d/dlogit[{i},{j}]: numeric {numeric} vs analytic {}",
                    grad[[i, j]]
                );
            }
        }
    }

    #[test]
    fn zero_weight_batch_has_no_gradient() {
        let logits = array![[1.0f32, 2.0]];
        let (loss, grad) = weighted_cross_entropy(&logits, &[1], &[1.0, 0.0]);
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));
    }
}
