use ndarray::{Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A trainable matrix and its accumulated gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub value: Array2<f32>,
    #[serde(skip)]
    pub grad: Array2<f32>,
}

impl Parameter {
    pub fn new(value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self { value, grad }
    }

    /// Reset the gradient to zeros shaped like the value.
    pub fn zero_grad(&mut self) {
        if self.grad.raw_dim() == self.value.raw_dim() {
            self.grad.fill(0.0);
        } else {
            self.grad = Array2::zeros(self.value.raw_dim());
        }
    }

    pub fn accumulate_grad(&mut self, grad: &Array2<f32>) {
        if self.grad.raw_dim() != self.value.raw_dim() {
            self.grad = Array2::zeros(self.value.raw_dim());
        }
        self.grad += grad;
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// Fully-connected layer: `y = x W + b`, `W` is `[in, out]`, `b` is `[1, out]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Linear {
    /// Xavier-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = (6.0 / (in_features + out_features) as f32).sqrt();
        let weight = Array2::from_shape_fn((in_features, out_features), |_| {
            rng.gen_range(-bound..=bound)
        });
        Self {
            weight: Parameter::new(weight),
            bias: Parameter::new(Array2::zeros((1, out_features))),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.ncols()
    }

    /// `[batch, in] -> [batch, out]`
    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.weight.value) + &self.bias.value
    }

    /// Accumulate weight/bias gradients and return the gradient w.r.t. `input`.
    pub fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
        // grad_w = input^T @ grad_output: [in, batch] @ [batch, out] = [in, out]
        self.weight.accumulate_grad(&input.t().dot(grad_output));
        self.bias
            .accumulate_grad(&grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)));
        // grad_input = grad_output @ W^T: [batch, out] @ [out, in] = [batch, in]
        grad_output.dot(&self.weight.value.t())
    }

    pub fn parameters_mut(&mut self) -> [&mut Parameter; 2] {
        [&mut self.weight, &mut self.bias]
    }

    pub fn zero_grad(&mut self) {
        self.weight.zero_grad();
        self.bias.zero_grad();
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Row-wise softmax, numerically stabilised by the row max.
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}
