use crate::catalog::EmbeddingCatalog;
use crate::types::Embedding;
use thiserror::Error;

/// Distance below which the live loop accepts a match.
pub const DEFAULT_TOLERANCE: f32 = 0.4;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("invalid probe: {0}")]
    InvalidProbe(String),
}

/// Result of matching a probe embedding against the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Match {
        identity_id: String,
        name: String,
        /// Euclidean distance to the closest reference.
        distance: f32,
        /// Flat position of the closest reference.
        reference: usize,
    },
    NoMatch {
        /// Distance to the closest reference, if the catalog had any.
        closest: Option<f32>,
    },
}

impl MatchOutcome {
    pub fn identity_id(&self) -> Option<&str> {
        match self {
            MatchOutcome::Match { identity_id, .. } => Some(identity_id),
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against the enrolled catalog.
pub trait Matcher {
    fn best_match(
        &self,
        probe: &Embedding,
        catalog: &EmbeddingCatalog,
        tolerance: f32,
    ) -> Result<MatchOutcome, MatchError>;
}

/// Nearest-reference matcher over Euclidean distance.
///
/// The tolerance is exclusive: a reference exactly `tolerance` away is
/// rejected. Equal distances resolve to the first reference in catalog order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        catalog: &EmbeddingCatalog,
        tolerance: f32,
    ) -> Result<MatchOutcome, MatchError> {
        if probe.values.is_empty() {
            return Err(MatchError::InvalidProbe("zero-length embedding".into()));
        }
        if !probe.is_well_formed() {
            return Err(MatchError::InvalidProbe("non-finite component".into()));
        }
        if let Some(dim) = catalog.dim() {
            if probe.dim() != dim {
                return Err(MatchError::InvalidProbe(format!(
                    "expected {dim}-dim embedding, got {}",
                    probe.dim()
                )));
            }
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, _, reference) in catalog.references() {
            let distance = probe.euclidean_distance(reference);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return Ok(MatchOutcome::NoMatch { closest: None });
        };

        match catalog.lookup_group(idx) {
            Some(identity) if best_distance < tolerance => Ok(MatchOutcome::Match {
                identity_id: identity.id.clone(),
                name: identity.name.clone(),
                distance: best_distance,
                reference: idx,
            }),
            _ => Ok(MatchOutcome::NoMatch {
                closest: Some(best_distance),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOptions;
    use crate::types::Identity;

    fn ident(id: &str, refs: &[&[f32]]) -> Identity {
        Identity {
            id: id.to_string(),
            name: format!("Student {id}"),
            references: refs.iter().map(|r| Embedding::new(r.to_vec())).collect(),
        }
    }

    fn catalog(identities: Vec<Identity>) -> EmbeddingCatalog {
        EmbeddingCatalog::from_identities(identities, CatalogOptions::default()).unwrap()
    }

    #[test]
    fn test_closest_reference_wins() {
        let catalog = catalog(vec![
            ident("S1", &[&[0.0, 0.0], &[0.3, 0.0]]),
            ident("S2", &[&[1.0, 0.0], &[0.55, 0.0]]),
        ]);
        let probe = Embedding::new(vec![0.5, 0.0]);

        let outcome = EuclideanMatcher.best_match(&probe, &catalog, 0.4).unwrap();
        match outcome {
            MatchOutcome::Match { identity_id, reference, distance, .. } => {
                assert_eq!(identity_id, "S2");
                assert_eq!(reference, 3);
                assert!((distance - 0.05).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_tolerance_is_exclusive() {
        let catalog = catalog(vec![ident("S1", &[&[0.0, 0.0]])]);
        let at_boundary = Embedding::new(vec![0.5, 0.0]);

        let outcome = EuclideanMatcher.best_match(&at_boundary, &catalog, 0.5).unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch { closest: Some(0.5) });

        let inside = Embedding::new(vec![0.5 - 1e-3, 0.0]);
        let outcome = EuclideanMatcher.best_match(&inside, &catalog, 0.5).unwrap();
        assert_eq!(outcome.identity_id(), Some("S1"));
    }

    #[test]
    fn test_ties_resolve_to_first_reference() {
        let catalog = catalog(vec![ident("S1", &[&[1.0, 0.0]]), ident("S2", &[&[-1.0, 0.0]])]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        let outcome = EuclideanMatcher.best_match(&probe, &catalog, 2.0).unwrap();
        assert_eq!(outcome.identity_id(), Some("S1"));
    }

    #[test]
    fn test_empty_catalog_never_matches() {
        let probe = Embedding::new(vec![0.1, 0.2]);
        let outcome = EuclideanMatcher
            .best_match(&probe, &EmbeddingCatalog::empty(), 10.0)
            .unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch { closest: None });
    }

    #[test]
    fn test_invalid_probes() {
        let catalog = catalog(vec![ident("S1", &[&[0.0, 0.0]])]);
        for probe in [
            Embedding::new(vec![]),
            Embedding::new(vec![f32::NAN, 0.0]),
            Embedding::new(vec![0.0, 0.0, 0.0]),
        ] {
            assert!(matches!(
                EuclideanMatcher.best_match(&probe, &catalog, 0.4),
                Err(MatchError::InvalidProbe(_))
            ));
        }
    }

    #[test]
    fn test_deterministic_for_fixed_inputs() {
        let catalog = catalog(vec![ident("S1", &[&[0.1, 0.2]]), ident("S2", &[&[0.2, 0.1]])]);
        let probe = Embedding::new(vec![0.15, 0.19]);
        let first = EuclideanMatcher.best_match(&probe, &catalog, 0.4).unwrap();
        for _ in 0..10 {
            assert_eq!(EuclideanMatcher.best_match(&probe, &catalog, 0.4).unwrap(), first);
        }
    }
}
