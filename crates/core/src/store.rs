use crate::models::IndexEntry;
use crate::StoreError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine similarity in `[-1, 1]`.
    #[default]
    Cosine,
    /// `1 / (1 + d)` for Euclidean distance `d`, in `(0, 1]`.
    Euclidean,
}

impl DistanceMetric {
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_similarity(a, b),
            Self::Euclidean => {
                let distance = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub entry_count: usize,
    pub document_count: usize,
    pub created_at: DateTime<Utc>,
}

/// What the store remembers about one indexed document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source_path: String,
    pub content_hash: String,
    pub chunk_ids: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn from_entries(
        document_id: impl Into<String>,
        source_path: impl Into<String>,
        content_hash: impl Into<String>,
        entries: &[IndexEntry],
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source_path: source_path.into(),
            content_hash: content_hash.into(),
            chunk_ids: entries.iter().map(|entry| entry.id().to_string()).collect(),
            indexed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
    /// Ingestion order inside the collection.
    pub sequence: u64,
}

/// Score descending, then ingestion order ascending.
pub fn rank(hits: &mut [ScoredEntry]) {
    hits.sort_by(|left, right| match right.score.total_cmp(&left.score) {
        Ordering::Equal => left.sequence.cmp(&right.sequence),
        other => other,
    });
}

pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").ok());

    match pattern {
        Some(pattern) if pattern.is_match(name) && !name.contains("..") => Ok(()),
        _ => Err(StoreError::InvalidCollectionName(name.to_string())),
    }
}

/// Stores `Vec<f32>` as base64 of little-endian bytes so vectors survive a
/// restart bit for bit.
pub mod vector_codec {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(vector: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = vector
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<u8>>();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(D::Error::custom("vector byte length is not a multiple of 4"));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}
