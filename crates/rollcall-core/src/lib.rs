//! rollcall-core — Embedding catalog and matcher for live attendance.
//!
//! Face detection and embedding are an external capability reached
//! through [`provider::FaceProvider`]; this crate owns the index of
//! enrolled identities and the nearest-reference decision.

pub mod catalog;
pub mod matcher;
pub mod provider;
pub mod types;

pub use catalog::{CatalogError, CatalogHandle, CatalogOptions, EmbeddingCatalog, IdentitySource};
pub use matcher::{EuclideanMatcher, MatchError, MatchOutcome, Matcher};
pub use provider::{FaceProvider, ProviderError, SidecarProvider};
pub use types::{BoundingBox, Embedding, Identity};

/// Share of the roster recognized during a session, as a percentage.
///
/// Recognized identities outside the roster do not count. An empty roster
/// yields 0.
pub fn recognition_accuracy<'a, R, S>(recognized: R, roster: S) -> f32
where
    R: IntoIterator<Item = &'a str>,
    S: IntoIterator<Item = &'a str>,
{
    let roster: std::collections::HashSet<&str> = roster.into_iter().collect();
    if roster.is_empty() {
        return 0.0;
    }
    let recognized: std::collections::HashSet<&str> = recognized.into_iter().collect();
    let correct = recognized.intersection(&roster).count();
    correct as f32 / roster.len() as f32 * 100.0
}
