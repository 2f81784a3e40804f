use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::layers::Parameter;

/// Optimiser and LR-schedule settings carried by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub lr: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Multiply the LR by this factor when `val_loss` plateaus.
    pub plateau_factor: f32,
    pub plateau_patience: usize,
    pub min_lr: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            plateau_factor: 0.75,
            plateau_patience: 5,
            min_lr: 1e-6,
        }
    }
}

/// Adam with L2 weight decay folded into the gradient.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    m: Vec<Array2<f32>>,
    v: Vec<Array2<f32>>,
    t: i32,
}

impl Adam {
    pub fn new(config: &OptimConfig) -> Self {
        Self {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            weight_decay: config.weight_decay,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn step(&mut self, params: &mut [&mut Parameter]) {
        self.t += 1;

        // Initialize state if needed
        if self.m.len() != params.len() {
            self.m = params.iter().map(|p| Array2::zeros(p.value.raw_dim())).collect();
            self.v = params.iter().map(|p| Array2::zeros(p.value.raw_dim())).collect();
        }

        let (lr, beta1, beta2, eps, wd) = (
            self.lr,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
        );
        let bc1 = 1.0 - beta1.powi(self.t);
        let bc2 = 1.0 - beta2.powi(self.t);

        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let Parameter { value, grad } = &mut **p;
            if grad.raw_dim() != value.raw_dim() {
                continue;
            }
            ndarray::Zip::from(value)
                .and(&*grad)
                .and(m)
                .and(v)
                .for_each(|w, &g, m, v| {
                    let g = g + wd * *w;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let total = params
        .iter()
        .map(|p| p.grad.iter().map(|g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt();
    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        for p in params.iter_mut() {
            p.grad.mapv_inplace(|g| g * scale);
        }
    }
    total
}

/// Reduce the learning rate when a monitored loss stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f32,
    patience: usize,
    min_lr: f32,
    threshold: f32,
    best: f32,
    bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: &OptimConfig) -> Self {
        Self {
            factor: config.plateau_factor,
            patience: config.plateau_patience,
            min_lr: config.min_lr,
            threshold: 1e-4,
            best: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Feed one epoch's metric; returns the new LR when it changes.
    pub fn step(&mut self, metric: f32, current_lr: f32) -> Option<f32> {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
            return None;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            let new_lr = (current_lr * self.factor).max(self.min_lr);
            if new_lr < current_lr {
                return Some(new_lr);
            }
        }
        None
    }
}
