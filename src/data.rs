//! Point collections: discrete items, continuous items, and their weights.
//!
//! A point (a captioned image, say) carries two kinds of observations:
//!
//! - **discrete items**: category ids with a multiplicity (words and counts)
//! - **continuous items**: fixed-length feature vectors (region descriptors),
//!   where individual features may be marked missing
//!
//! Points also carry an optional weight, an optional fixed group (which pins
//! the point to one cluster), and an optional adjacency prior between their
//! continuous items, used to bias hard level-block assignment.
//!
//! Two reshaping helpers sit next to the collection:
//!
//! - [`ClusterData::split`] separates training points from held-out points.
//! - [`ClusterData::with_discrete_nulls`] appends a null category and gives
//!   every point one null item, so a model can park discrete mass that no
//!   real category explains. [`Model::subtract_discrete_nulls`] removes it
//!   again after training.
//!
//! [`Model::subtract_discrete_nulls`]: crate::model::Model::subtract_discrete_nulls

use crate::error::{Error, Result};
use ndarray::Array2;

/// A discrete observation: a category id and how many times it occurs.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteItem {
    /// Category id in `[0, num_categories)`.
    pub category: usize,
    /// Multiplicity weight (an occurrence count, or a fractional weight).
    pub multiplicity: f64,
}

/// A continuous observation: a feature vector with optional missing marks.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousItem {
    /// Feature values.
    pub features: Vec<f64>,
    /// Per-feature missing marks; empty when nothing is missing.
    pub missing: Vec<bool>,
    /// Item weight (1 unless set).
    pub weight: f64,
}

impl ContinuousItem {
    /// A fully observed feature vector.
    pub fn new(features: Vec<f64>) -> Self {
        Self {
            features,
            missing: Vec::new(),
            weight: 1.0,
        }
    }

    /// A feature vector where `missing[f]` marks feature `f` as unobserved.
    pub fn with_missing(features: Vec<f64>, missing: Vec<bool>) -> Self {
        Self {
            features,
            missing,
            weight: 1.0,
        }
    }

    /// Whether feature `f` is observed.
    #[inline]
    pub fn is_present(&self, f: usize) -> bool {
        self.missing.get(f).map_or(true, |m| !m)
    }

    /// Whether any feature is missing.
    #[inline]
    pub fn has_missing(&self) -> bool {
        self.missing.iter().any(|&m| m)
    }
}

/// One data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Discrete items.
    pub discrete: Vec<DiscreteItem>,
    /// Continuous items.
    pub continuous: Vec<ContinuousItem>,
    /// Point weight.
    pub weight: f64,
    /// Fixed cluster, if the point is pinned.
    pub group: Option<usize>,
    /// Adjacency prior between continuous items (C×C, non-negative).
    pub adjacency: Option<Array2<f64>>,
}

impl Default for Point {
    fn default() -> Self {
        Self::new()
    }
}

impl Point {
    /// An empty point with weight 1.
    pub fn new() -> Self {
        Self {
            discrete: Vec::new(),
            continuous: Vec::new(),
            weight: 1.0,
            group: None,
            adjacency: None,
        }
    }

    /// Add a discrete item.
    pub fn with_discrete(mut self, category: usize, multiplicity: f64) -> Self {
        self.discrete.push(DiscreteItem {
            category,
            multiplicity,
        });
        self
    }

    /// Add a fully observed continuous item.
    pub fn with_continuous(mut self, features: Vec<f64>) -> Self {
        self.continuous.push(ContinuousItem::new(features));
        self
    }

    /// Add a continuous item.
    pub fn with_continuous_item(mut self, item: ContinuousItem) -> Self {
        self.continuous.push(item);
        self
    }

    /// Set the point weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Pin the point to a cluster.
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = Some(group);
        self
    }

    /// Set the continuous-item adjacency prior.
    pub fn with_adjacency(mut self, adjacency: Array2<f64>) -> Self {
        self.adjacency = Some(adjacency);
        self
    }

    /// Number of discrete items.
    pub fn num_discrete(&self) -> usize {
        self.discrete.len()
    }

    /// Number of continuous items.
    pub fn num_continuous(&self) -> usize {
        self.continuous.len()
    }

    /// Sum of discrete multiplicities.
    pub fn discrete_mass(&self) -> f64 {
        self.discrete.iter().map(|d| d.multiplicity).sum()
    }
}

/// Per-feature statistics used to standardize continuous features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureNormalization {
    /// Feature means before normalization.
    pub mean: Vec<f64>,
    /// Feature variances before normalization.
    pub var: Vec<f64>,
    /// Target standard deviation after normalization.
    pub norm_stdev: f64,
}

/// A collection of points sharing a category space and a feature dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterData {
    num_categories: usize,
    num_features: usize,
    points: Vec<Point>,
    max_num_dis_items: usize,
    max_num_dis_items_with_multiplicity: f64,
    max_num_con_items: usize,
}

/// Incremental builder for [`ClusterData`].
#[derive(Debug, Clone)]
pub struct ClusterDataBuilder {
    num_categories: usize,
    num_features: usize,
    points: Vec<Point>,
}

impl ClusterDataBuilder {
    /// Append a point.
    pub fn add_point(mut self, point: Point) -> Self {
        self.points.push(point);
        self
    }

    /// Append several points.
    pub fn extend<I: IntoIterator<Item = Point>>(mut self, points: I) -> Self {
        self.points.extend(points);
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<ClusterData> {
        ClusterData::new(self.num_categories, self.num_features, self.points)
    }
}

impl ClusterData {
    /// Start building a collection.
    pub fn builder(num_categories: usize, num_features: usize) -> ClusterDataBuilder {
        ClusterDataBuilder {
            num_categories,
            num_features,
            points: Vec::new(),
        }
    }

    /// Create a collection from points, validating every item.
    pub fn new(num_categories: usize, num_features: usize, points: Vec<Point>) -> Result<Self> {
        let mut data = Self {
            num_categories,
            num_features,
            points,
            max_num_dis_items: 0,
            max_num_dis_items_with_multiplicity: 0.0,
            max_num_con_items: 0,
        };
        data.validate()?;
        data.update_max_item_counts();
        Ok(data)
    }

    /// Check item shapes, category ranges and weights.
    pub fn validate(&self) -> Result<()> {
        if self.points.is_empty() {
            return Err(Error::EmptyInput);
        }
        for (p, point) in self.points.iter().enumerate() {
            if !(point.weight.is_finite() && point.weight >= 0.0) {
                return Err(Error::InvalidParameter {
                    name: "point.weight",
                    message: "must be finite and non-negative",
                });
            }
            for item in &point.discrete {
                if item.category >= self.num_categories {
                    return Err(Error::CategoryOutOfRange {
                        point: p,
                        category: item.category,
                        num_categories: self.num_categories,
                    });
                }
                if !(item.multiplicity.is_finite() && item.multiplicity >= 0.0) {
                    return Err(Error::InvalidParameter {
                        name: "discrete.multiplicity",
                        message: "must be finite and non-negative",
                    });
                }
            }
            for item in &point.continuous {
                if item.features.len() != self.num_features {
                    return Err(Error::DimensionMismatch {
                        expected: self.num_features,
                        found: item.features.len(),
                    });
                }
                if !item.missing.is_empty() && item.missing.len() != self.num_features {
                    return Err(Error::DimensionMismatch {
                        expected: self.num_features,
                        found: item.missing.len(),
                    });
                }
                let bad_value = item
                    .features
                    .iter()
                    .enumerate()
                    .any(|(f, x)| item.is_present(f) && !x.is_finite());
                if bad_value {
                    return Err(Error::InvalidParameter {
                        name: "continuous.features",
                        message: "observed features must be finite",
                    });
                }
                if !(item.weight.is_finite() && item.weight >= 0.0) {
                    return Err(Error::InvalidParameter {
                        name: "continuous.weight",
                        message: "must be finite and non-negative",
                    });
                }
            }
            if let Some(adj) = &point.adjacency {
                let c = point.num_continuous();
                if adj.dim() != (c, c) {
                    return Err(Error::ShapeMismatch {
                        expected: format!("{c}x{c} adjacency"),
                        actual: format!("{}x{}", adj.nrows(), adj.ncols()),
                    });
                }
                if adj.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                    return Err(Error::InvalidParameter {
                        name: "point.adjacency",
                        message: "entries must be finite and non-negative",
                    });
                }
            }
        }
        Ok(())
    }

    fn update_max_item_counts(&mut self) {
        self.max_num_dis_items = self.points.iter().map(Point::num_discrete).max().unwrap_or(0);
        self.max_num_dis_items_with_multiplicity = self
            .points
            .iter()
            .map(Point::discrete_mass)
            .fold(0.0, f64::max);
        self.max_num_con_items = self.points.iter().map(Point::num_continuous).max().unwrap_or(0);
    }

    /// Number of points.
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Size of the discrete category space.
    pub fn num_categories(&self) -> usize {
        self.num_categories
    }

    /// Continuous feature dimension.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// All points.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// One point.
    pub fn point(&self, p: usize) -> &Point {
        &self.points[p]
    }

    /// Largest discrete item count over points.
    pub fn max_num_dis_items(&self) -> usize {
        self.max_num_dis_items
    }

    /// Largest total discrete multiplicity over points.
    pub fn max_num_dis_items_with_multiplicity(&self) -> f64 {
        self.max_num_dis_items_with_multiplicity
    }

    /// Largest continuous item count over points.
    pub fn max_num_con_items(&self) -> usize {
        self.max_num_con_items
    }

    /// Sum of point weights.
    pub fn total_weight(&self) -> f64 {
        self.points.iter().map(|p| p.weight).sum()
    }

    /// Whether any point has discrete items.
    pub fn has_discrete(&self) -> bool {
        self.max_num_dis_items > 0
    }

    /// Whether any point has continuous items.
    pub fn has_continuous(&self) -> bool {
        self.max_num_con_items > 0 && self.num_features > 0
    }

    /// Mean of each observed continuous feature over all items.
    pub fn feature_means(&self) -> Vec<f64> {
        self.feature_moments().0
    }

    fn feature_moments(&self) -> (Vec<f64>, Vec<f64>) {
        let d = self.num_features;
        let mut n = vec![0.0; d];
        let mut s1 = vec![0.0; d];
        let mut s2 = vec![0.0; d];
        for item in self.points.iter().flat_map(|p| p.continuous.iter()) {
            for f in 0..d {
                if item.is_present(f) {
                    let x = item.features[f];
                    n[f] += 1.0;
                    s1[f] += x;
                    s2[f] += x * x;
                }
            }
        }
        let mean: Vec<f64> = (0..d)
            .map(|f| if n[f] > 0.0 { s1[f] / n[f] } else { 0.0 })
            .collect();
        let var: Vec<f64> = (0..d)
            .map(|f| {
                if n[f] > 0.0 {
                    (s2[f] / n[f] - mean[f] * mean[f]).max(0.0)
                } else {
                    0.0
                }
            })
            .collect();
        (mean, var)
    }

    /// Split into `(training, held_out)`.
    ///
    /// Points listed in `training` go to the first collection in the listed
    /// order; every other point goes to the second in its original order.
    /// Indices must be in range and distinct, and both sides must be
    /// non-empty.
    pub fn split(&self, training: &[usize]) -> Result<(ClusterData, ClusterData)> {
        let n = self.num_points();
        let mut in_training = vec![false; n];
        for &p in training {
            if p >= n {
                return Err(Error::InvalidParameter {
                    name: "training",
                    message: "point index out of range",
                });
            }
            if in_training[p] {
                return Err(Error::InvalidParameter {
                    name: "training",
                    message: "point index listed twice",
                });
            }
            in_training[p] = true;
        }
        let train = training.iter().map(|&p| self.points[p].clone()).collect();
        let held_out = self
            .points
            .iter()
            .zip(&in_training)
            .filter(|(_, t)| !**t)
            .map(|(point, _)| point.clone())
            .collect();
        Ok((
            ClusterData::new(self.num_categories, self.num_features, train)?,
            ClusterData::new(self.num_categories, self.num_features, held_out)?,
        ))
    }

    /// A copy with one extra category, id `num_categories()`, and one null
    /// item of multiplicity 1 appended to every point.
    pub fn with_discrete_nulls(&self) -> Result<ClusterData> {
        let null = self.num_categories;
        let points = self
            .points
            .iter()
            .map(|point| point.clone().with_discrete(null, 1.0))
            .collect();
        ClusterData::new(null + 1, self.num_features, points)
    }

    /// Standardize every continuous feature to mean 0 and standard deviation
    /// `norm_stdev`. Missing entries are left untouched; constant features
    /// are only centered.
    pub fn normalize_continuous_features(&mut self, norm_stdev: f64) -> Result<FeatureNormalization> {
        if !(norm_stdev.is_finite() && norm_stdev > 0.0) {
            return Err(Error::InvalidParameter {
                name: "norm_stdev",
                message: "must be finite and > 0",
            });
        }
        let (mean, var) = self.feature_moments();
        for item in self.points.iter_mut().flat_map(|p| p.continuous.iter_mut()) {
            for f in 0..self.num_features {
                if !item.is_present(f) {
                    continue;
                }
                let centered = item.features[f] - mean[f];
                item.features[f] = if var[f] > 0.0 {
                    centered * norm_stdev / var[f].sqrt()
                } else {
                    centered
                };
            }
        }
        Ok(FeatureNormalization {
            mean,
            var,
            norm_stdev,
        })
    }
}
