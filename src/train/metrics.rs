/// Fraction of predictions equal to their target. Empty input gives 0.
pub fn accuracy(predictions: &[usize], targets: &[usize]) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(targets)
        .filter(|(p, t)| p == t)
        .count();
    correct as f32 / targets.len() as f32
}

/// Unweighted mean of per-class F1 over classes that occur in either
/// `predictions` or `targets`.
pub fn macro_f1(predictions: &[usize], targets: &[usize], num_classes: usize) -> f32 {
    let mut tp = vec![0usize; num_classes];
    let mut fp = vec![0usize; num_classes];
    let mut fn_ = vec![0usize; num_classes];
    for (&p, &t) in predictions.iter().zip(targets) {
        if p == t {
            tp[t] += 1;
        } else {
            if p < num_classes {
                fp[p] += 1;
            }
            fn_[t] += 1;
        }
    }

    let scores: Vec<f32> = (0..num_classes)
        .filter(|&c| tp[c] + fp[c] + fn_[c] > 0)
        .map(|c| {
            let denom = 2 * tp[c] + fp[c] + fn_[c];
            2.0 * tp[c] as f32 / denom as f32
        })
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    }
}
