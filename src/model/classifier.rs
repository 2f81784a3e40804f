use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array2, Axis, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::layers::{relu, softmax_rows, Linear, Parameter};
use super::loss::weighted_cross_entropy;
use super::optim::OptimConfig;
use crate::error::{Result, SimsError};

/// Architecture and optimisation settings of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Rank of the attentive transformer that produces the feature mask.
    pub attention_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub optim: OptimConfig,
    /// Seed for weight initialisation.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            attention_dim: 32,
            hidden_dims: vec![256, 128],
            optim: OptimConfig::default(),
            seed: 0,
        }
    }
}

/// Intermediate activations of one forward pass, kept for backprop.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// `tanh` output of the attention bottleneck, `[batch, attention_dim]`.
    attention: Array2<f32>,
    /// Softmax feature mask, rows sum to one, `[batch, features]`.
    pub mask: Array2<f32>,
    /// Input scaled by `features * mask`.
    masked: Array2<f32>,
    hidden_pre: Vec<Array2<f32>>,
    hidden: Vec<Array2<f32>>,
    pub logits: Array2<f32>,
}

/// Output of a training or evaluation step on one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
}

/// Attention classifier for single-cell expression profiles.
///
/// An attentive transformer turns each cell into a softmax mask over the
/// features; the masked profile feeds a ReLU MLP. The mask doubles as the
/// per-cell explanation returned by [`SimsClassifier::explain`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimsClassifier {
    input_dim: usize,
    output_dim: usize,
    config: ModelConfig,
    class_weights: Vec<f32>,
    attention_in: Linear,
    attention_out: Linear,
    hidden: Vec<Linear>,
    head: Linear,
}

impl SimsClassifier {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        weights: Option<Vec<f32>>,
        config: ModelConfig,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(SimsError::InvalidConfig(format!(
                "model dimensions must be positive (input {input_dim}, output {output_dim})"
            )));
        }
        if config.attention_dim == 0 || config.hidden_dims.contains(&0) {
            return Err(SimsError::InvalidConfig(
                "attention_dim and hidden_dims must be positive".into(),
            ));
        }
        let class_weights = weights.unwrap_or_default();
        if !class_weights.is_empty() && class_weights.len() != output_dim {
            return Err(SimsError::ShapeMismatch(format!(
                "{} class weights for {output_dim} classes",
                class_weights.len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let attention_in = Linear::new(input_dim, config.attention_dim, &mut rng);
        let attention_out = Linear::new(config.attention_dim, input_dim, &mut rng);
        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        let mut width = input_dim;
        for &dim in &config.hidden_dims {
            hidden.push(Linear::new(width, dim, &mut rng));
            width = dim;
        }
        let head = Linear::new(width, output_dim, &mut rng);

        Ok(Self {
            input_dim,
            output_dim,
            config,
            class_weights,
            attention_in,
            attention_out,
            hidden,
            head,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn class_weights(&self) -> &[f32] {
        &self.class_weights
    }

    pub fn num_parameters(&self) -> usize {
        self.layers().map(|l| l.weight.numel() + l.bias.numel()).sum()
    }

    fn layers(&self) -> impl Iterator<Item = &Linear> {
        [&self.attention_in, &self.attention_out]
            .into_iter()
            .chain(self.hidden.iter())
            .chain(std::iter::once(&self.head))
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = Vec::with_capacity(2 * (self.hidden.len() + 3));
        params.extend(self.attention_in.parameters_mut());
        params.extend(self.attention_out.parameters_mut());
        for layer in &mut self.hidden {
            params.extend(layer.parameters_mut());
        }
        params.extend(self.head.parameters_mut());
        params
    }

    pub fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn check_input(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.input_dim {
            return Err(SimsError::ShapeMismatch(format!(
                "model expects {} features, got {}",
                self.input_dim,
                x.ncols()
            )));
        }
        Ok(())
    }

    pub fn forward(&self, x: &Array2<f32>) -> Result<ForwardPass> {
        self.check_input(x)?;
        let attention = self.attention_in.forward(x).mapv(f32::tanh);
        let mask = softmax_rows(&self.attention_out.forward(&attention));
        let scale = self.input_dim as f32;
        let masked = Zip::from(x)
            .and(&mask)
            .map_collect(|&v, &m| v * m * scale);

        let mut hidden_pre = Vec::with_capacity(self.hidden.len());
        let mut hidden = Vec::with_capacity(self.hidden.len());
        for layer in &self.hidden {
            let pre = layer.forward(hidden.last().unwrap_or(&masked));
            hidden.push(relu(&pre));
            hidden_pre.push(pre);
        }
        let logits = self.head.forward(hidden.last().unwrap_or(&masked));

        Ok(ForwardPass {
            attention,
            mask,
            masked,
            hidden_pre,
            hidden,
            logits,
        })
    }

    /// Accumulate parameter gradients for `grad_logits`.
    pub fn backward(&mut self, x: &Array2<f32>, pass: &ForwardPass, grad_logits: &Array2<f32>) {
        let last = pass.hidden.last().unwrap_or(&pass.masked);
        let mut grad = self.head.backward(last, grad_logits);

        for i in (0..self.hidden.len()).rev() {
            Zip::from(&mut grad)
                .and(&pass.hidden_pre[i])
                .for_each(|g, &pre| {
                    if pre <= 0.0 {
                        *g = 0.0;
                    }
                });
            let input = if i == 0 { &pass.masked } else { &pass.hidden[i - 1] };
            grad = self.hidden[i].backward(input, &grad);
        }

        // masked = scale * x * mask
        let scale = self.input_dim as f32;
        let grad_mask = Zip::from(&grad).and(x).map_collect(|&g, &v| g * v * scale);

        // softmax backward: ds = m * (dm - sum(dm * m))
        let dot = (&grad_mask * &pass.mask).sum_axis(Axis(1)).insert_axis(Axis(1));
        let grad_scores = &pass.mask * &(&grad_mask - &dot);

        let grad_attention = self.attention_out.backward(&pass.attention, &grad_scores);
        let grad_pre_tanh = Zip::from(&grad_attention)
            .and(&pass.attention)
            .map_collect(|&g, &a| g * (1.0 - a * a));
        self.attention_in.backward(x, &grad_pre_tanh);
    }

    /// Forward + weighted loss + backward on one batch. Gradients accumulate.
    pub fn training_step(&mut self, x: &Array2<f32>, y: &[usize]) -> Result<StepOutput> {
        let pass = self.forward(x)?;
        let (loss, grad) = weighted_cross_entropy(&pass.logits, y, &self.class_weights);
        self.backward(x, &pass, &grad);
        Ok(StepOutput {
            loss,
            correct: count_correct(&pass.logits, y),
            total: y.len(),
        })
    }

    /// Loss and accuracy counts without touching gradients.
    pub fn evaluate(&self, x: &Array2<f32>, y: &[usize]) -> Result<(StepOutput, Vec<usize>)> {
        let pass = self.forward(x)?;
        let (loss, _) = weighted_cross_entropy(&pass.logits, y, &self.class_weights);
        let predictions = argmax_rows(&pass.logits);
        let correct = predictions.iter().zip(y).filter(|(p, t)| p == t).count();
        Ok((
            StepOutput {
                loss,
                correct,
                total: y.len(),
            },
            predictions,
        ))
    }

    /// Class probabilities, `[cells, classes]`.
    pub fn predict_proba(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(softmax_rows(&self.forward(x)?.logits))
    }

    /// Most likely class index per cell.
    pub fn predict(&self, x: &Array2<f32>) -> Result<Vec<usize>> {
        Ok(argmax_rows(&self.forward(x)?.logits))
    }

    /// Per-cell feature attention masks, `[cells, features]`, rows sum to one.
    pub fn explain(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.forward(x)?.mask)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| SimsError::io(path, e))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SimsError::io(path, e))?;
        let mut model: Self = serde_json::from_reader(BufReader::new(file))?;
        model.zero_grad();
        Ok(model)
    }
}

pub fn argmax_rows(x: &Array2<f32>) -> Vec<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

fn count_correct(logits: &Array2<f32>, y: &[usize]) -> usize {
    argmax_rows(logits)
        .iter()
        .zip(y)
        .filter(|(p, t)| p == t)
        .count()
}
