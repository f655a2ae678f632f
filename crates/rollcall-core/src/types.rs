use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Database identifier of an enrolled identity. Lower ids win exact ties.
pub type IdentityId = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("encoding is empty")]
    Empty,
    #[error("encoding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("encoding value at index {0} is not finite")]
    NonFinite(usize),
    #[error("encoding blob length {0} is not a multiple of 4")]
    BlobLength(usize),
}

/// Bounding box for a detected face, in pixels of the frame handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face encoding vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding {
    pub values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check that the vector is usable as a reference encoding of `dim` dimensions.
    pub fn validate(&self, dim: usize) -> Result<(), EncodingError> {
        if self.values.is_empty() {
            return Err(EncodingError::Empty);
        }
        if self.values.len() != dim {
            return Err(EncodingError::Dimension {
                expected: dim,
                actual: self.values.len(),
            });
        }
        if let Some(idx) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(EncodingError::NonFinite(idx));
        }
        Ok(())
    }

    /// Compute Euclidean distance between two encodings.
    pub fn euclidean_distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine distance in [0, 2]: `1 - cos(a, b)`. A zero vector reports 1.0.
    pub fn cosine_distance(&self, other: &Encoding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            1.0 - dot / denom
        } else {
            1.0
        }
    }

    /// Element-wise mean of several samples. `None` if there are no samples or
    /// their dimensions disagree.
    pub fn mean(samples: &[Encoding]) -> Option<Encoding> {
        let first = samples.first()?;
        let dim = first.len();
        if samples.iter().any(|s| s.len() != dim) {
            return None;
        }

        let mut acc = vec![0.0f64; dim];
        for sample in samples {
            for (slot, v) in acc.iter_mut().zip(&sample.values) {
                *slot += f64::from(*v);
            }
        }
        let n = samples.len() as f64;
        Some(Encoding::new(acc.into_iter().map(|v| (v / n) as f32).collect()))
    }

    /// Little-endian f32 blob, as stored in the identities table.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(blob: &[u8]) -> Result<Self, EncodingError> {
        if blob.len() % 4 != 0 {
            return Err(EncodingError::BlobLength(blob.len()));
        }
        let values = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values })
    }
}

/// An enrolled person and their reference encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    /// Optional external key, unique among identities when present.
    pub roll_number: Option<String>,
    pub encoding: Encoding,
    pub enrolled_at: DateTime<Utc>,
}

/// One face found in one frame. Consumed by the matcher and never persisted.
#[derive(Debug, Clone)]
pub struct Detection {
    pub encoding: Encoding,
    pub frame_timestamp: DateTime<Utc>,
    pub bbox: BoundingBox,
}

/// Result of matching one detection against the enrolled candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` for an unknown face.
    pub identity_id: Option<IdentityId>,
    /// Distance to the nearest candidate (infinite when there were none).
    pub distance: f32,
    pub timestamp: DateTime<Utc>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Encoding, b: &Encoding) -> f32 {
        match self {
            Self::Euclidean => a.euclidean_distance(b),
            Self::Cosine => a.cosine_distance(b),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Strategy for matching a detection against a snapshot of enrolled identities.
pub trait Matcher {
    fn compare(&self, detection: &Detection, candidates: &[Identity]) -> MatchResult;
}

/// Nearest-neighbour matcher with a distance threshold.
///
/// Every candidate is compared; the minimum distance wins and exact ties go to
/// the lowest identity id, so results never depend on snapshot order.
/// Candidates whose encoding length differs from the query are skipped.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
}

impl DistanceMatcher {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }
}

impl Matcher for DistanceMatcher {
    fn compare(&self, detection: &Detection, candidates: &[Identity]) -> MatchResult {
        let query = &detection.encoding;
        let mut best: Option<(f32, IdentityId)> = None;

        for candidate in candidates {
            if candidate.encoding.len() != query.len() {
                continue;
            }
            let dist = self.metric.distance(query, &candidate.encoding);
            if dist.is_nan() {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_dist, best_id)) => {
                    dist < best_dist || (dist == best_dist && candidate.id < best_id)
                }
            };
            if better {
                best = Some((dist, candidate.id));
            }
        }

        match best {
            Some((dist, id)) if dist <= self.threshold => MatchResult {
                identity_id: Some(id),
                distance: dist,
                timestamp: detection.frame_timestamp,
            },
            Some((dist, _)) => MatchResult {
                identity_id: None,
                distance: dist,
                timestamp: detection.frame_timestamp,
            },
            None => MatchResult {
                identity_id: None,
                distance: f32::INFINITY,
                timestamp: detection.frame_timestamp,
            },
        }
    }
}
