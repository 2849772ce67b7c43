//! Depth-histogram occlusion reasoning.
//!
//! A target is considered occluded when near-range mass in its depth
//! histogram dominates the region while the appearance response collapses,
//! and visible again once both conditions reverse.

use serde::{Deserialize, Serialize};

/// Per-bin pixel mass, ordered by ascending depth (nearest bin first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthHistogram {
    bins: Vec<f64>,
}

impl DepthHistogram {
    /// Negative masses are clamped to zero.
    pub fn new(bins: Vec<f64>) -> Self {
        Self {
            bins: bins.into_iter().map(|b| b.max(0.)).collect(),
        }
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }
}

impl From<Vec<f64>> for DepthHistogram {
    fn from(bins: Vec<f64>) -> Self {
        Self::new(bins)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionKwargs {
    /// λ_occ: occluder ratio separating occluded from visible.
    pub lambda_occ: f64,
    /// λ_r1: response below which a target may be occluded.
    pub lambda_r1: f64,
    /// λ_r2: response above which a target may be visible.
    pub lambda_r2: f64,
}

impl Default for OcclusionKwargs {
    fn default() -> Self {
        Self {
            lambda_occ: 0.35,
            lambda_r1: 0.4,
            lambda_r2: 0.2,
        }
    }
}

/// Fraction of the sampled area lying in bins nearer than `object_bin`.
///
/// The bins must be sorted by ascending depth: accumulation stops at the first
/// index `>= object_bin`. `total` overrides the denominator, which otherwise is
/// the histogram total. A zero denominator yields `0.0`.
pub fn occluder_ratio(histogram: &DepthHistogram, object_bin: usize, total: Option<f64>) -> f64 {
    let occluder: f64 = histogram.bins().iter().take(object_bin).sum();
    let total = total.unwrap_or_else(|| histogram.total());

    if total <= 0. {
        return 0.;
    }

    occluder / total
}

pub fn evaluate_occlusion(
    kwargs: &OcclusionKwargs,
    histogram: &DepthHistogram,
    object_bin: usize,
    max_response: f64,
) -> bool {
    max_response < kwargs.lambda_r1
        && occluder_ratio(histogram, object_bin, None) > kwargs.lambda_occ
}

pub fn evaluate_visibility(
    kwargs: &OcclusionKwargs,
    histogram: &DepthHistogram,
    object_bin: usize,
    max_response: f64,
) -> bool {
    max_response > kwargs.lambda_r2
        && occluder_ratio(histogram, object_bin, None) < kwargs.lambda_occ
}

/// Advisory occlusion signals computed by the last `detect`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OcclusionSignals {
    pub object_bin: usize,
    pub occluder_ratio: f64,
    pub max_response: f64,
    pub occluded: bool,
    pub visible: bool,
}

impl OcclusionSignals {
    pub fn evaluate(
        kwargs: &OcclusionKwargs,
        histogram: &DepthHistogram,
        object_bin: usize,
        max_response: f64,
    ) -> Self {
        Self {
            object_bin,
            occluder_ratio: occluder_ratio(histogram, object_bin, None),
            max_response,
            occluded: evaluate_occlusion(kwargs, histogram, object_bin, max_response),
            visible: evaluate_visibility(kwargs, histogram, object_bin, max_response),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn test_occluder_ratio() {
        let h = DepthHistogram::from(vec![10., 10., 80.]);

        assert_relative_eq!(occluder_ratio(&h, 2, None), 0.2);
        assert_relative_eq!(occluder_ratio(&h, 0, None), 0.);
        assert_relative_eq!(occluder_ratio(&h, 3, None), 1.);
        assert_relative_eq!(occluder_ratio(&h, 1, Some(50.)), 0.2);
    }

    #[test]
    fn test_occluder_ratio_empty() {
        let h = DepthHistogram::default();

        assert_relative_eq!(occluder_ratio(&h, 0, None), 0.);
        assert_relative_eq!(occluder_ratio(&DepthHistogram::from(vec![0., 0.]), 1, None), 0.);
    }

    #[test]
    fn test_near_mass_below_threshold_is_not_occlusion() {
        let kwargs = OcclusionKwargs::default();
        let h = DepthHistogram::from(vec![10., 10., 80.]);

        for response in [0., 0.1, 0.39, 0.9] {
            assert!(!evaluate_occlusion(&kwargs, &h, 2, response));
        }
    }

    #[test]
    fn test_near_mass_with_low_response_is_occlusion() {
        let kwargs = OcclusionKwargs::default();
        let h = DepthHistogram::from(vec![40., 40., 20.]);

        assert!(evaluate_occlusion(&kwargs, &h, 2, 0.1));
        assert!(!evaluate_occlusion(&kwargs, &h, 2, 0.5));
    }

    #[test]
    fn test_visibility() {
        let kwargs = OcclusionKwargs::default();
        let clear = DepthHistogram::from(vec![10., 10., 80.]);
        let blocked = DepthHistogram::from(vec![40., 40., 20.]);

        assert!(evaluate_visibility(&kwargs, &clear, 2, 0.3));
        assert!(!evaluate_visibility(&kwargs, &clear, 2, 0.1));
        assert!(!evaluate_visibility(&kwargs, &blocked, 2, 0.9));
    }

    #[test]
    fn test_signals() {
        let kwargs = OcclusionKwargs::default();
        let h = DepthHistogram::from(vec![40., 40., 20.]);
        let s = OcclusionSignals::evaluate(&kwargs, &h, 2, 0.1);

        assert!(s.occluded);
        assert!(!s.visible);
        assert_relative_eq!(s.occluder_ratio, 0.8);
    }

    #[test]
    fn test_negative_mass_is_clamped() {
        let h = DepthHistogram::new(vec![-5., 10.]);

        assert_eq!(h.bins(), &[0., 10.]);
        assert_relative_eq!(h.total(), 10.);
    }
}
