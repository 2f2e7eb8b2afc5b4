//! Query-vs-gallery matching under a Euclidean tolerance.
//!
//! The scan is linear over the whole gallery (O(N·D)). Fine for a single
//! site's registry; there is no ANN index.

use crate::types::{Embedding, Enrollment, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default match tolerance (maximum Euclidean distance).
///
/// ArcFace embeddings are unit length, so a distance `d` corresponds to a
/// cosine similarity of `1 - d²/2`. 0.6 therefore demands cosine ≥ 0.82. A
/// cosine threshold of 0.40 would be a distance of about 1.095.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Cosine similarity equivalent to a Euclidean `tolerance` between
/// unit-length embeddings.
pub fn cosine_equivalent(tolerance: f32) -> f32 {
    1.0 - tolerance * tolerance / 2.0
}

/// Which qualifying gallery entry wins when several clear the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// First entry in gallery order whose distance is within tolerance.
    #[default]
    First,
    /// Entry with the minimum distance within tolerance; ties go to the earlier entry.
    Best,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "best" => Ok(Self::Best),
            other => Err(format!("unknown match policy {other:?} (expected \"first\" or \"best\")")),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Best => f.write_str("best"),
        }
    }
}

/// Outcome of matching one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        user_id: UserId,
        name: String,
        distance: f32,
    },
    NoMatch {
        /// Smallest distance seen, if any gallery entry was comparable.
        closest: Option<f32>,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Strategy for comparing a query embedding against a gallery of registered faces.
pub trait Matcher {
    fn find(&self, query: &Embedding, gallery: &[Enrollment], tolerance: f32) -> MatchResult;
}

/// Euclidean-distance matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    pub policy: MatchPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for EuclideanMatcher {
    fn find(&self, query: &Embedding, gallery: &[Enrollment], tolerance: f32) -> MatchResult {
        let mut closest: Option<f32> = None;
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(distance) = query.euclidean_distance(&entry.embedding) else {
                tracing::warn!(
                    user_id = entry.user_id,
                    stored_dim = entry.embedding.dim(),
                    query_dim = query.dim(),
                    "skipping enrollment with mismatched embedding dimension"
                );
                continue;
            };

            if closest.map_or(true, |c| distance < c) {
                closest = Some(distance);
            }
            if distance > tolerance {
                continue;
            }

            match self.policy {
                MatchPolicy::First => {
                    best = Some((i, distance));
                    break;
                }
                MatchPolicy::Best => {
                    if best.map_or(true, |(_, d)| distance < d) {
                        best = Some((i, distance));
                    }
                }
            }
        }

        match best {
            Some((idx, distance)) => MatchResult::Matched {
                user_id: gallery[idx].user_id,
                name: gallery[idx].name.clone(),
                distance,
            },
            None => MatchResult::NoMatch { closest },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: UserId, name: &str, values: Vec<f32>) -> Enrollment {
        Enrollment {
            user_id: id,
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    fn gallery() -> Vec<Enrollment> {
        vec![
            entry(1, "far", vec![1.0, 0.0, 0.0]),
            entry(2, "near", vec![0.0, 0.5, 0.0]),
            entry(3, "nearest", vec![0.0, 0.1, 0.0]),
        ]
    }

    #[test]
    fn test_first_match_returns_earliest_qualifying_entry() {
        let query = Embedding::new(vec![0.0, 0.0, 0.0]);
        let result = EuclideanMatcher::new(MatchPolicy::First).find(&query, &gallery(), 0.6);
        match result {
            MatchResult::Matched { user_id, name, distance } => {
                assert_eq!(user_id, 2);
                assert_eq!(name, "near");
                assert!((distance - 0.5).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_best_match_returns_closest_entry() {
        let query = Embedding::new(vec![0.0, 0.0, 0.0]);
        let result = EuclideanMatcher::new(MatchPolicy::Best).find(&query, &gallery(), 0.6);
        match result {
            MatchResult::Matched { user_id, .. } => assert_eq!(user_id, 3),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let g = vec![entry(7, "edge", vec![0.0, 0.5])];
        let result = EuclideanMatcher::default().find(&query, &g, 0.5);
        assert!(result.is_match());
    }

    #[test]
    fn test_no_match_reports_closest_distance() {
        let query = Embedding::new(vec![0.0, 0.0, 5.0]);
        let result = EuclideanMatcher::default().find(&query, &gallery(), 0.6);
        match result {
            MatchResult::NoMatch { closest } => {
                let c = closest.unwrap();
                assert!(c > 0.6);
            }
            other => panic!("expected no match, got {other:?}"),
        }
    }

    #[test]
    fn test_default_tolerance_is_cosine_082() {
        assert!((cosine_equivalent(DEFAULT_TOLERANCE) - 0.82).abs() < 1e-6);
        assert!((cosine_equivalent(1.095) - 0.40).abs() < 1e-3);

        // Two unit vectors at cosine 0.82 sit exactly on the default tolerance.
        let angle = 0.82f32.acos();
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![angle.cos(), angle.sin()]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - DEFAULT_TOLERANCE).abs() < 1e-4, "d = {d}");
    }

    #[test]
    fn test_empty_gallery() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::default().find(&query, &[], DEFAULT_TOLERANCE);
        assert_eq!(result, MatchResult::NoMatch { closest: None });
    }

    #[test]
    fn test_mismatched_dimension_is_skipped() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let g = vec![
            entry(1, "legacy", vec![0.0, 0.0, 0.0]),
            entry(2, "current", vec![0.1, 0.0]),
        ];
        match EuclideanMatcher::default().find(&query, &g, DEFAULT_TOLERANCE) {
            MatchResult::Matched { user_id, .. } => assert_eq!(user_id, 2),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("first".parse::<MatchPolicy>().unwrap(), MatchPolicy::First);
        assert_eq!(" BEST ".parse::<MatchPolicy>().unwrap(), MatchPolicy::Best);
        assert!("closest".parse::<MatchPolicy>().is_err());
        assert_eq!(MatchPolicy::Best.to_string(), "best");
    }
}
