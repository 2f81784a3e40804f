//! Attention classifier, its layers and the optimisation primitives that train it.

pub mod classifier;
pub mod layers;
pub mod loss;
pub mod optim;

pub use classifier::{ModelConfig, SimsClassifier, StepOutput};
pub use optim::{Adam, OptimConfig, ReduceLrOnPlateau};
