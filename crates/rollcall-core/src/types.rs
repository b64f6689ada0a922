use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the dlib-style encoders
/// the roster was enrolled with).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and every component is finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must compare equal-length vectors; extra components of the
    /// longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// An enrolled person and their reference embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Enrollment number.
    pub id: String,
    pub name: String,
    pub references: Vec<Embedding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_3_4_5() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_well_formed() {
        assert!(Embedding::new(vec![0.1, 0.2]).is_well_formed());
        assert!(!Embedding::new(vec![]).is_well_formed());
        assert!(!Embedding::new(vec![0.1, f32::NAN]).is_well_formed());
        assert!(!Embedding::new(vec![f32::INFINITY]).is_well_formed());
    }

    #[test]
    fn test_embedding_serializes_as_plain_array() {
        let e = Embedding::new(vec![1.0, 2.5]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[1.0,2.5]");
        let back: Embedding = serde_json::from_str("[1.0,2.5]").unwrap();
        assert_eq!(back, e);
    }
}
