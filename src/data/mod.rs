//! Data layer: matrix types, loading, label encoding, splitting and batching.
//!
//! Architecture:
//! ```text
//!  .parquet / .csv / .h5ad (+ labels)  in-memory AnnotatedMatrix
//!        │                                   │
//!        ▼                                   │
//!   ┌──────────┐                             │
//!   │  loader   │  parse file → AnnotatedMatrix
//!   └──────────┘                             │
//!        │◄──────────────────────────────────┘
//!        ▼
//!   ┌────────────┐
//!   │ DataModule  │  pool, subset, normalise, encode, split
//!   └────────────┘
//!        │
//!        ▼
//!   ┌────────────┐
//!   │ DataLoader  │  mini-batches of (x, y)
//!   └────────────┘
//! ```

pub mod encoder;
#[cfg(feature = "h5ad")]
pub mod h5ad;
pub mod loader;
pub mod model;
pub mod module;
pub mod split;

pub use encoder::LabelEncoder;
pub use model::{AnnotatedMatrix, DatasetList, DatasetRef, MetadataValue};
pub use module::{Batch, DataLoader, DataModule, DataModuleConfig};
pub use split::{subsample, Splits};
