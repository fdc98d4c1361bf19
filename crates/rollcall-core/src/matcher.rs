//! Nearest-neighbour search over face vectors.

use crate::types::FaceVector;
use std::fmt;

/// Closest candidate found by a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<K> {
    pub id: K,
    /// Cosine distance in [0, 2].
    pub distance: f32,
}

impl<K> Match<K> {
    pub fn confidence(&self) -> f32 {
        confidence(self.distance)
    }
}

/// Reported confidence for a distance: `1 - distance`, rounded to 4 decimals.
pub fn confidence(distance: f32) -> f32 {
    ((1.0 - distance) * 10_000.0).round() / 10_000.0
}

/// Strategy for finding the closest gallery entry to a query vector.
///
/// The gallery is an ordered sequence of `(id, vector)` pairs; callers supply a
/// stable order (ascending id) so ties resolve deterministically. An indexed
/// implementation can replace [`CosineMatcher`] without changing this contract.
pub trait Matcher: Send + Sync {
    /// Closest comparable candidate, ignoring any threshold.
    ///
    /// Returns `None` when the gallery is empty or no candidate is comparable.
    fn nearest<'g, K, I>(&self, query: &FaceVector, gallery: I) -> Option<Match<K>>
    where
        K: fmt::Debug,
        I: IntoIterator<Item = (K, &'g FaceVector)>;

    /// Closest candidate whose distance is strictly below `threshold`.
    fn find_match<'g, K, I>(&self, query: &FaceVector, gallery: I, threshold: f32) -> Option<Match<K>>
    where
        K: fmt::Debug,
        I: IntoIterator<Item = (K, &'g FaceVector)>,
    {
        self.nearest(query, gallery)
            .filter(|m| m.distance < threshold)
    }
}

/// Linear-scan cosine matcher.
///
/// Compares the query against every gallery entry. Ties keep the first entry
/// encountered. Entries with a mismatched dimension are skipped and logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn nearest<'g, K, I>(&self, query: &FaceVector, gallery: I) -> Option<Match<K>>
    where
        K: fmt::Debug,
        I: IntoIterator<Item = (K, &'g FaceVector)>,
    {
        let mut best: Option<Match<K>> = None;

        for (id, candidate) in gallery {
            let distance = match query.cosine_distance(candidate) {
                Ok(d) if d.is_finite() => d,
                Ok(_) => {
                    tracing::warn!(candidate = ?id, "skipping candidate with non-finite distance");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        candidate = ?id,
                        query_dim = e.query,
                        candidate_dim = e.candidate,
                        "skipping candidate with mismatched embedding dimension"
                    );
                    continue;
                }
            };

            let is_better = match &best {
                None => true,
                Some(prev) => distance < prev.distance,
            };
            if is_better {
                best = Some(Match { id, distance });
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> FaceVector {
        FaceVector::new(values.to_vec())
    }

    #[test]
    fn test_cosine_matcher_scans_whole_gallery() {
        // Best match is the last entry.
        let query = v(&[1.0, 0.0, 0.0]);
        let gallery = [
            (1i64, v(&[0.0, 1.0, 0.0])),
            (2, v(&[0.0, 0.0, 1.0])),
            (3, v(&[1.0, 0.0, 0.0])),
        ];

        let m = CosineMatcher
            .find_match(&query, gallery.iter().map(|(id, fv)| (*id, fv)), 0.5)
            .unwrap();
        assert_eq!(m.id, 3);
        assert!(m.distance.abs() < 1e-6);
        assert!((m.confidence() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_no_match() {
        let query = v(&[1.0, 0.0, 0.0]);
        let gallery = [(1i64, v(&[0.0, 1.0, 0.0]))];

        let m = CosineMatcher.find_match(&query, gallery.iter().map(|(id, fv)| (*id, fv)), 0.5);
        assert!(m.is_none());

        // The threshold-free form still reports the closest candidate.
        let nearest = CosineMatcher
            .nearest(&query, gallery.iter().map(|(id, fv)| (*id, fv)))
            .unwrap();
        assert_eq!(nearest.id, 1);
        assert!((nearest.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_empty_gallery() {
        let query = v(&[1.0, 0.0]);
        let gallery: Vec<(i64, FaceVector)> = Vec::new();
        assert!(CosineMatcher
            .find_match(&query, gallery.iter().map(|(id, fv)| (*id, fv)), 0.5)
            .is_none());
        assert!(CosineMatcher
            .nearest(&query, gallery.iter().map(|(id, fv)| (*id, fv)))
            .is_none());
    }

    #[test]
    fn test_threshold_is_strict() {
        let query = v(&[1.0, 0.0]);
        let gallery = [(1i64, v(&[0.0, 1.0]))]; // distance exactly 1.0
        let iter = || gallery.iter().map(|(id, fv)| (*id, fv));
        assert!(CosineMatcher.find_match(&query, iter(), 1.0).is_none());
        assert!(CosineMatcher.find_match(&query, iter(), 1.01).is_some());
    }

    #[test]
    fn test_tie_keeps_first_in_order() {
        let query = v(&[1.0, 0.0]);
        let gallery = [
            (10i64, v(&[0.0, 1.0])),
            (11, v(&[2.0, 0.0])),
            (12, v(&[1.0, 0.0])),
        ];
        let m = CosineMatcher
            .find_match(&query, gallery.iter().map(|(id, fv)| (*id, fv)), 0.5)
            .unwrap();
        assert_eq!(m.id, 11);
    }

    #[test]
    fn test_dimension_mismatch_is_skipped() {
        let query = v(&[1.0, 0.0, 0.0]);
        let gallery = [
            (1i64, v(&[1.0, 0.0])),
            (2, v(&[0.9, 0.1, 0.0])),
            (3, v(&[1.0, 0.0, 0.0, 0.0])),
        ];
        let m = CosineMatcher
            .find_match(&query, gallery.iter().map(|(id, fv)| (*id, fv)), 0.5)
            .unwrap();
        assert_eq!(m.id, 2);

        // Nothing comparable at all.
        let only_bad = [(1i64, v(&[1.0, 0.0]))];
        assert!(CosineMatcher
            .nearest(&query, only_bad.iter().map(|(id, fv)| (*id, fv)))
            .is_none());
    }

    #[test]
    fn test_small_perturbation_matches_registered_identity() {
        // 128-dim vector with alternating components: adding +0.001 to every
        // component gives a cosine distance of about 0.0099.
        let a = 0.01f32 / 2.0f32.sqrt();
        let registered: Vec<f32> = (0..128).map(|i| if i % 2 == 0 { a } else { -a }).collect();
        let other: Vec<f32> = (0..128).map(|i| if i % 4 < 2 { a } else { -a }).collect();
        let query: Vec<f32> = registered.iter().map(|x| x + 0.001).collect();

        let gallery = [(1i64, v(&registered)), (2, v(&other))];
        let m = CosineMatcher
            .find_match(&v(&query), gallery.iter().map(|(id, fv)| (*id, fv)), 0.5)
            .unwrap();

        assert_eq!(m.id, 1);
        assert!(m.distance > 0.009 && m.distance < 0.011, "got {}", m.distance);
        assert!((m.confidence() - 0.99).abs() < 0.001, "got {}", m.confidence());
    }

    #[test]
    fn test_confidence_rounding() {
        assert_eq!(confidence(0.0), 1.0);
        assert_eq!(confidence(0.123456), 0.8765);
        assert_eq!(confidence(1.5), -0.5);
    }
}
