//! Model invariant checking.
//!
//! Verifies the invariants every iteration is supposed to preserve:
//! - probabilities finite and non-negative
//! - priors, categorical rows, level distributions and membership rows sum to one
//! - variances finite, positive, and at or above the floor
//! - cached normalizers finite
//!
//! # Example
//!
//! ```rust,ignore
//! let report = outcome.model.validate_with_var_floor(config.var_offset);
//! if !report.is_healthy() {
//!     for issue in &report.issues {
//!         eprintln!("{issue}");
//!     }
//! }
//! ```

use std::collections::HashMap;

use super::{Model, VerticalWeights};

/// Tolerance on membership, prior and categorical row sums.
pub const ROW_SUM_TOLERANCE: f64 = 1e-4;

/// Tolerance on level-distribution sums.
pub const LEVEL_SUM_TOLERANCE: f64 = 1e-3;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational, not a problem.
    Info,
    /// Something unusual but not necessarily wrong.
    Warning,
    /// A broken invariant.
    Error,
    /// Non-finite values that will poison the next iteration.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// `(level, node)` involved, if any.
    pub node: Option<(usize, usize)>,
    /// Point involved, if any.
    pub point: Option<usize>,
}

impl ValidationIssue {
    /// Create a new validation issue.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            node: None,
            point: None,
        }
    }

    /// Attach a `(level, node)`.
    pub fn with_node(mut self, level: usize, node: usize) -> Self {
        self.node = Some((level, node));
        self
    }

    /// Attach a point.
    pub fn with_point(mut self, point: usize) -> Self {
        self.point = Some(point);
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some((level, node)) = self.node {
            write!(f, " (level {level}, node {node})")?;
        }
        if let Some(p) = self.point {
            write!(f, " (point {p})")?;
        }
        Ok(())
    }
}

/// Issues found by [`Model::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// All issues found.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Add an issue to the report.
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// No errors or critical issues.
    pub fn is_healthy(&self) -> bool {
        !self.issues.iter().any(|i| i.severity >= Severity::Error)
    }

    /// No issues at all.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues of a specific severity or higher.
    pub fn issues_at_level(&self, min_severity: Severity) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity >= min_severity)
            .collect()
    }

    /// Count issues by severity.
    pub fn counts(&self) -> HashMap<Severity, usize> {
        let mut counts = HashMap::new();
        for issue in &self.issues {
            *counts.entry(issue.severity).or_default() += 1;
        }
        counts
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_clean() {
            return write!(f, "model is valid");
        }
        let counts = self.counts();
        let parts: Vec<String> = [
            (Severity::Critical, "critical"),
            (Severity::Error, "errors"),
            (Severity::Warning, "warnings"),
            (Severity::Info, "info"),
        ]
        .iter()
        .filter_map(|(sev, name)| counts.get(sev).map(|c| format!("{c} {name}")))
        .collect();
        writeln!(f, "model validation: {}", parts.join(", "))?;
        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

fn check_distribution(
    values: impl Iterator<Item = f64>,
    tolerance: f64,
    what: &str,
) -> Option<ValidationIssue> {
    let mut sum = 0.0;
    for v in values {
        if !v.is_finite() {
            return Some(ValidationIssue::new(Severity::Critical, format!("{what}: non-finite entry")));
        }
        if v < 0.0 {
            return Some(ValidationIssue::new(Severity::Error, format!("{what}: negative entry {v}")));
        }
        sum += v;
    }
    if (sum - 1.0).abs() > tolerance {
        return Some(ValidationIssue::new(
            Severity::Error,
            format!("{what}: sums to {sum}"),
        ));
    }
    None
}

impl Model {
    /// Check the model's probability and variance invariants.
    pub fn validate(&self) -> ValidationReport {
        self.validate_with_var_floor(0.0)
    }

    /// [`Model::validate`], also requiring every variance to reach `var_floor`.
    pub fn validate_with_var_floor(&self, var_floor: f64) -> ValidationReport {
        let mut report = ValidationReport::new();

        if let Some(issue) = check_distribution(
            self.priors.iter().copied(),
            ROW_SUM_TOLERANCE,
            "cluster priors",
        ) {
            report.add(issue);
        }

        for (p, row) in self.membership.rows().into_iter().enumerate() {
            if let Some(issue) =
                check_distribution(row.iter().copied(), ROW_SUM_TOLERANCE, "membership")
            {
                report.add(issue.with_point(p));
            }
        }

        match &self.vertical {
            VerticalWeights::Global(v) => {
                for (c, col) in v.columns().into_iter().enumerate() {
                    if let Some(issue) = check_distribution(
                        col.iter().copied(),
                        LEVEL_SUM_TOLERANCE,
                        &format!("level weights of cluster {c}"),
                    ) {
                        report.add(issue);
                    }
                }
            }
            VerticalWeights::PerPoint(v) => {
                for (p, row) in v.rows().into_iter().enumerate() {
                    if let Some(issue) = check_distribution(
                        row.iter().copied(),
                        LEVEL_SUM_TOLERANCE,
                        "level weights",
                    ) {
                        report.add(issue.with_point(p));
                    }
                }
            }
            VerticalWeights::PerPointPerCluster(v) => {
                let (n, k, _) = v.dim();
                for p in 0..n {
                    for c in 0..k {
                        let row = v.slice(ndarray::s![p, c, ..]);
                        if let Some(issue) = check_distribution(
                            row.iter().copied(),
                            LEVEL_SUM_TOLERANCE,
                            &format!("level weights of cluster {c}"),
                        ) {
                            report.add(issue.with_point(p));
                        }
                    }
                }
            }
        }

        for l in self.topology.levels() {
            let nodes = &self.levels[l];
            for node in 0..nodes.num_nodes() {
                if self.num_categories > 0 {
                    if let Some(issue) = check_distribution(
                        nodes.categorical.row(node).iter().copied(),
                        ROW_SUM_TOLERANCE,
                        "categorical",
                    ) {
                        report.add(issue.with_node(l, node));
                    }
                }
                for f in 0..self.num_features {
                    let (m, v) = (nodes.mean[[node, f]], nodes.var[[node, f]]);
                    if !m.is_finite() || !v.is_finite() {
                        report.add(
                            ValidationIssue::new(
                                Severity::Critical,
                                format!("feature {f}: non-finite mean or variance"),
                            )
                            .with_node(l, node),
                        );
                    } else if v <= 0.0 || v < var_floor {
                        report.add(
                            ValidationIssue::new(
                                Severity::Error,
                                format!("feature {f}: variance {v} below floor {var_floor}"),
                            )
                            .with_node(l, node),
                        );
                    }
                }
                if !nodes.log_sqrt_det[node].is_finite() {
                    report.add(
                        ValidationIssue::new(Severity::Critical, "non-finite log_sqrt_det")
                            .with_node(l, node),
                    );
                }
            }
        }

        if self.priors.iter().any(|&a| a == 0.0) {
            report.add(ValidationIssue::new(Severity::Warning, "a cluster has zero prior mass"));
        }
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::VerticalWeightMode;
    use crate::topology::Topology;

    #[test]
    fn test_fresh_model_is_healthy() {
        let topo = Topology::from_fan_outs(&[2, 2], 0, 3).unwrap();
        let m = Model::new(&topo, 3, 2, VerticalWeightMode::PerPointPerCluster, 4).unwrap();
        let report = m.validate();
        assert!(report.is_clean(), "{report}");
    }

    #[test]
    fn test_detects_bad_rows_and_low_variance() {
        let topo = Topology::flat(2).unwrap();
        let mut m = Model::new(&topo, 2, 1, VerticalWeightMode::Global, 2).unwrap();
        m.levels[1].categorical[[0, 0]] = 0.9;
        m.membership[[1, 0]] = f64::NAN;
        let report = m.validate_with_var_floor(2.0);
        assert!(!report.is_healthy());
        assert!(report.issues.iter().any(|i| i.node == Some((1, 0)) && i.message.contains("categorical")));
        assert!(report.issues.iter().any(|i| i.point == Some(1) && i.severity == Severity::Critical));
        assert_eq!(
            report
                .issues
                .iter()
                .filter(|i| i.message.contains("below floor"))
                .count(),
            2
        );
    }
}
