//! In-memory index of enrolled identities and their reference embeddings.
//!
//! A catalog is immutable once built. Roster changes produce a new catalog
//! that is swapped into a [`CatalogHandle`]; readers holding the previous
//! `Arc` finish their frame against a consistent index.

use crate::types::{Embedding, Identity};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Reference embeddings captured per identity at enrollment.
pub const DEFAULT_GROUP_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog storage unavailable: {0}")]
    Unavailable(String),
    #[error("identity {identity}: reference has {actual} dimensions, catalog has {expected}")]
    Dimension {
        identity: String,
        expected: usize,
        actual: usize,
    },
    #[error("group size must be at least 1")]
    InvalidGroupSize,
}

/// Anything that can produce the persisted identity records.
pub trait IdentitySource {
    fn load_identities(&self) -> Result<Vec<Identity>, CatalogError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogOptions {
    /// Maximum references kept per identity, and the stride of legacy
    /// flat model files.
    pub group_size: usize,
    /// Fail on a reference dimension mismatch instead of skipping the
    /// offending identity.
    pub strict: bool,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            strict: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct EmbeddingCatalog {
    identities: Vec<Identity>,
    /// Flat reference position → index into `identities`.
    owners: Vec<usize>,
    dim: Option<usize>,
}

impl EmbeddingCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the catalog from persisted identity records.
    pub fn load(
        source: &dyn IdentitySource,
        options: CatalogOptions,
    ) -> Result<Self, CatalogError> {
        let identities = source.load_identities()?;
        let catalog = Self::from_identities(identities, options)?;
        tracing::info!(
            identities = catalog.len(),
            references = catalog.reference_count(),
            dim = ?catalog.dim(),
            "embedding catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_identities(
        identities: Vec<Identity>,
        options: CatalogOptions,
    ) -> Result<Self, CatalogError> {
        if options.group_size == 0 {
            return Err(CatalogError::InvalidGroupSize);
        }

        let mut seen = HashSet::new();
        let mut kept: Vec<Identity> = Vec::with_capacity(identities.len());
        let mut owners = Vec::new();
        let mut dim: Option<usize> = None;

        for mut identity in identities {
            if !seen.insert(identity.id.clone()) {
                tracing::warn!(
                    identity = %identity.id,
                    "duplicate identity record; keeping the first"
                );
                continue;
            }

            identity.references.retain(Embedding::is_well_formed);
            if identity.references.is_empty() {
                tracing::warn!(
                    identity = %identity.id,
                    "identity has no usable references; skipping"
                );
                continue;
            }
            if identity.references.len() > options.group_size {
                tracing::debug!(
                    identity = %identity.id,
                    references = identity.references.len(),
                    group_size = options.group_size,
                    "truncating references to group size"
                );
                identity.references.truncate(options.group_size);
            }

            let expected = dim.unwrap_or_else(|| identity.references[0].dim());
            if let Some(actual) = identity
                .references
                .iter()
                .map(Embedding::dim)
                .find(|&d| d != expected)
            {
                if options.strict {
                    return Err(CatalogError::Dimension {
                        identity: identity.id.clone(),
                        expected,
                        actual,
                    });
                }
                tracing::warn!(
                    identity = %identity.id,
                    expected,
                    actual,
                    "reference dimension mismatch; skipping identity"
                );
                continue;
            }
            dim = Some(expected);

            let owner = kept.len();
            owners.extend(std::iter::repeat(owner).take(identity.references.len()));
            kept.push(identity);
        }

        Ok(Self {
            identities: kept,
            owners,
            dim,
        })
    }

    /// Import the legacy flat layout: `group_size` consecutive encodings per
    /// enrollment, in enrollment order. A model file must be uniform, so
    /// dimension mismatches are errors here.
    pub fn from_flat(
        encodings: Vec<Embedding>,
        enrollments: &[String],
        group_size: usize,
    ) -> Result<Self, CatalogError> {
        if group_size == 0 {
            return Err(CatalogError::InvalidGroupSize);
        }

        let owned = enrollments.len() * group_size;
        if encodings.len() > owned {
            tracing::warn!(
                dropped = encodings.len() - owned,
                "flat model has encodings without an owning enrollment"
            );
        }

        let mut identities: Vec<Identity> = enrollments
            .iter()
            .map(|id| Identity {
                id: id.clone(),
                name: id.clone(),
                references: Vec::with_capacity(group_size),
            })
            .collect();

        for (i, encoding) in encodings.into_iter().enumerate() {
            let Some(identity) = identities.get_mut(i / group_size) else {
                break;
            };
            identity.references.push(encoding);
        }

        Self::from_identities(
            identities,
            CatalogOptions {
                group_size,
                strict: true,
            },
        )
    }

    /// Map a flat reference position back to its owning identity.
    pub fn lookup_group(&self, flat_index: usize) -> Option<&Identity> {
        self.owners
            .get(flat_index)
            .and_then(|&owner| self.identities.get(owner))
    }

    /// All references in flat order, with their owning identity.
    pub fn references(&self) -> impl Iterator<Item = (usize, &Identity, &Embedding)> {
        self.identities
            .iter()
            .flat_map(|identity| identity.references.iter().map(move |r| (identity, r)))
            .enumerate()
            .map(|(i, (identity, r))| (i, identity, r))
    }

    pub fn identity(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.owners.len()
    }

    /// Embedding dimension shared by every reference, if any are loaded.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }
}

/// Shared, swappable pointer to the current catalog.
#[derive(Clone, Default)]
pub struct CatalogHandle {
    inner: Arc<RwLock<Arc<EmbeddingCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: EmbeddingCatalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub fn current(&self) -> Arc<EmbeddingCatalog> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Swap in a freshly loaded catalog.
    pub fn replace(&self, catalog: EmbeddingCatalog) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(catalog);
    }
}
