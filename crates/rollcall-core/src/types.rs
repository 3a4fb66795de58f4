use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum Euclidean distance between two unit-norm ArcFace embeddings that
/// still counts as the same person (≈ cosine similarity 0.40).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("name is empty")]
    Empty,
    #[error("name cannot be used as a file name: {0:?}")]
    InvalidCharacters(String),
}

/// Case-normalized name of an enrolled person.
///
/// Doubles as the file stem of the person's reference image, so it never
/// contains path separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Trim and lowercase `name`, rejecting anything that is not a usable file stem.
    pub fn new(name: &str) -> Result<Self, IdentityError> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(IdentityError::Empty);
        }
        if normalized == "."
            || normalized == ".."
            || normalized.contains(['/', '\\', '\0'])
        {
            return Err(IdentityError::InvalidCharacters(normalized));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel rectangle `(x, y, width, height)` clipped to an image of
    /// the given size. `None` when nothing of the box lies inside the image.
    pub fn clamped_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.max(0.0).floor() as u32;
        let y1 = self.y.max(0.0).floor() as u32;
        let x2 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y2 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);

        if x1 >= x2 || y1 >= y2 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity with the embedding recomputed from its reference image.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Result of matching a candidate embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest gallery entry (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// Identity of the matched entry (if any).
    pub identity: Option<Identity>,
    /// Gallery position of the closest entry, matched or not.
    pub best_index: Option<usize>,
}

/// Distance from `candidate` to every gallery entry, in gallery order.
pub fn face_distances(gallery: &[GalleryEntry], candidate: &Embedding) -> Vec<f32> {
    gallery
        .iter()
        .map(|entry| entry.embedding.euclidean_distance(candidate))
        .collect()
}

/// Whether each gallery entry is within `threshold` of `candidate`, in gallery order.
pub fn compare_faces(gallery: &[GalleryEntry], candidate: &Embedding, threshold: f32) -> Vec<bool> {
    face_distances(gallery, candidate)
        .into_iter()
        .map(|d| d <= threshold)
        .collect()
}

/// Strategy for comparing a candidate embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_match(&self, candidate: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance with a fixed threshold.
///
/// Ties resolve to the earliest gallery entry.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    threshold: f32,
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl DistanceMatcher {
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    #[cfg(test)]
    pub(crate) fn with_threshold(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for DistanceMatcher {
    fn best_match(&self, candidate: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let distances = face_distances(gallery, candidate);

        let mut best: Option<(usize, f32)> = None;
        for (i, &d) in distances.iter().enumerate() {
            match best {
                Some((_, best_d)) if d >= best_d => {}
                _ => best = Some((i, d)),
            }
        }

        match best {
            Some((idx, d)) if d <= self.threshold => MatchResult {
                matched: true,
                distance: d,
                identity: Some(gallery[idx].identity.clone()),
                best_index: Some(idx),
            },
            Some((idx, d)) => MatchResult {
                matched: false,
                distance: d,
                identity: None,
                best_index: Some(idx),
            },
            None => MatchResult {
                matched: false,
                distance: f32::INFINITY,
                identity: None,
                best_index: None,
            },
        }
    }
}
