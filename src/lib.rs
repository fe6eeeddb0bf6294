//! # tiermix
//!
//! Hierarchical multi-modal mixture models fit by expectation-maximization.
//!
//! Each data point is a bag of discrete items (category ids with
//! multiplicities) and continuous items (feature vectors). A cluster is a
//! root-to-leaf path through a tree of nodes; every node carries a categorical
//! distribution over categories and a diagonal Gaussian over features. An item
//! in a point is explained by one level of the point's cluster path, chosen
//! through per-level ("vertical") weights.
//!
//! ```text
//! P(point | c) = Π_d  Σ_l v[l] · P(w_d | node(c, l))
//!              · Π_i  Σ_l v[l] · N(x_i | node(c, l))
//! P(point)     = Σ_c  a[c] · P(point | c)
//! ```
//!
//! How discrete and continuous items of a point relate is decided by the
//! correspondence model ([`CorrespondenceModel`]): independently, through
//! shared level responsibilities, or through an explicit item matching.
//!
//! Training is driven by [`EmEngine`]; [`get_cluster_membership`] scores data
//! against a fitted model without changing it.
//!
//! With the `parallel` feature, scoring passes run on rayon workers.

/// Error types used across `tiermix`.
pub mod error;

pub mod config;
pub mod correspondence;
pub mod data;
pub mod em;
pub mod inference;
pub mod matching;
pub mod model;
pub mod numeric;
pub mod scratch;
pub mod topology;


pub use config::{
    ConvergenceCriterion, CorrespondenceModel, EmConfig, MapPriors, TrainingOptions, VerticalWeightMode,
};
pub use correspondence::{strategy_for, CorrespondenceStrategy};
pub use data::{ClusterData, ContinuousItem, DiscreteItem, FeatureNormalization, Point};
pub use em::{EmEngine, HaltSignal, IterationReport, StopReason, TrainingOutcome};
pub use error::{Error, Result};
pub use inference::{get_cluster_membership, InferenceOptions, LevelPosteriors, Membership};
pub use matching::{get_matches, Matches};
pub use model::{Complexity, InitState, Model, ValidationReport, VerticalWeights};
pub use numeric::Diagnostics;
pub use topology::Topology;
