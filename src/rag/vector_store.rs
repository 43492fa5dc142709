//! Similarity Index
//!
//! Exact nearest-neighbour search over record-summary embeddings. Vectors are
//! L2-normalized on insert, so Euclidean distance ranks the same way cosine
//! similarity does. Linear scan is fine for the corpus sizes this serves
//! (low thousands); swap in an approximate index behind `search` if that
//! changes.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// Identifier and description of one grouped set of measurements.
/// Produced by ingestion, copied into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: String,
    pub summary: String,
    /// Geospatial or temporal anchor, kept for traceability
    #[serde(default)]
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record: RecordSummary,
    pub vector: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: RecordSummary,
    pub distance: f32,
}

/// On-disk layout: vectors and metadata are stored side by side and must
/// have the same length.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dimension: usize,
    vectors: Vec<Embedding>,
    metadata: Vec<RecordSummary>,
}

/// Append-only in-memory index with a dimension fixed at creation
pub struct SimilarityIndex {
    dimension: usize,
    entries: RwLock<Vec<IndexEntry>>,
}

impl SimilarityIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panicking writer leaves the Vec intact (push is the only mutation),
    // so a poisoned lock is still safe to read.
    fn read(&self) -> RwLockReadGuard<'_, Vec<IndexEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<IndexEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, record: RecordSummary, vector: Embedding) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let vector = normalize(vector);
        self.write().push(IndexEntry { record, vector });
        Ok(())
    }

    /// Insert a batch under one exclusive lock. Nothing is inserted if any
    /// vector has the wrong dimension.
    pub fn insert_batch(&self, items: Vec<(RecordSummary, Embedding)>) -> Result<()> {
        if let Some((_, bad)) = items.iter().find(|(_, v)| v.len() != self.dimension) {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        let mut entries = self.write();
        for (record, vector) in items {
            entries.push(IndexEntry {
                record,
                vector: normalize(vector),
            });
        }
        Ok(())
    }

    /// The `k` closest entries by Euclidean distance, nearest first.
    /// Equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let entries = self.read();
        if entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query = normalize(query.to_vec());
        let mut scored: Vec<(usize, f32)> = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, euclidean_distance(&query, &entry.vector)))
            .collect();

        // sort_by is stable, so ties stay in insertion order
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, distance)| SearchHit {
                record: entries[position].record.clone(),
                distance,
            })
            .collect())
    }

    /// Write the index to `path` as JSON. The file is written next to the
    /// target and renamed into place.
    pub fn persist(&self, path: &Path) -> Result<()> {
        // Exclusive for the duration of the write so no insert interleaves
        let entries = self.write();
        let persisted = PersistedIndex {
            dimension: self.dimension,
            vectors: entries.iter().map(|e| e.vector.clone()).collect(),
            metadata: entries.iter().map(|e| e.record.clone()).collect(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer(&mut writer, &persisted)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), entries = entries.len(), "Persisted similarity index");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let persisted: PersistedIndex = serde_json::from_reader(reader)
            .map_err(|e| EngineError::CorruptIndex(format!("{}: {}", path.display(), e)))?;

        if persisted.vectors.len() != persisted.metadata.len() {
            return Err(EngineError::CorruptIndex(format!(
                "{} vectors but {} metadata records",
                persisted.vectors.len(),
                persisted.metadata.len()
            )));
        }
        if persisted.dimension == 0 {
            return Err(EngineError::CorruptIndex("Stored dimension is zero".to_string()));
        }

        let mut entries = Vec::with_capacity(persisted.vectors.len());
        for (vector, record) in persisted.vectors.into_iter().zip(persisted.metadata) {
            if vector.len() != persisted.dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: persisted.dimension,
                    actual: vector.len(),
                });
            }
            // Stored vectors are already normalized; keep them bit-exact
            entries.push(IndexEntry { record, vector });
        }

        debug!(path = %path.display(), entries = entries.len(), "Loaded similarity index");
        Ok(Self {
            dimension: persisted.dimension,
            entries: RwLock::new(entries),
        })
    }

    /// Load `path` if it exists, otherwise start empty. A file whose
    /// dimension differs from `dimension` is a configuration error.
    pub fn open_or_create(path: &Path, dimension: usize) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(dimension));
        }
        let index = Self::load(path)?;
        if index.dimension != dimension {
            return Err(EngineError::DimensionMismatch {
                expected: dimension,
                actual: index.dimension,
            });
        }
        Ok(index)
    }
}

fn normalize(mut vector: Embedding) -> Embedding {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, summary: &str) -> RecordSummary {
        RecordSummary {
            id: id.to_string(),
            summary: summary.to_string(),
            anchor: None,
        }
    }

    #[test]
    fn test_empty_index_search_is_empty() {
        let index = SimilarityIndex::new(3);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let index = SimilarityIndex::new(3);
        let err = index.insert(record("a", "x"), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_sorted_and_bounded() {
        let index = SimilarityIndex::new(2);
        index.insert(record("far", "far"), vec![-1.0, 0.0]).unwrap();
        index.insert(record("near", "near"), vec![1.0, 0.1]).unwrap();
        index.insert(record("mid", "mid"), vec![0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, "near");
        assert_eq!(hits[1].record.id, "mid");
        assert!(hits[0].distance <= hits[1].distance);

        assert_eq!(index.search(&[1.0, 0.0], 10).unwrap().len(), 3);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let index = SimilarityIndex::new(2);
        index.insert(record("first", "a"), vec![0.0, 2.0]).unwrap();
        index.insert(record("second", "b"), vec![0.0, 1.0]).unwrap();

        let hits = index.search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(hits[0].record.id, "first");
        assert_eq!(hits[1].record.id, "second");
        assert_eq!(hits[0].distance, hits[1].distance);
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = SimilarityIndex::new(3);
        index
            .insert(
                RecordSummary {
                    id: "6904092_12".to_string(),
                    summary: "Float 6904092 cycle 12 in the Arabian Sea".to_string(),
                    anchor: Some("15.2N 65.1E 2023-10-01".to_string()),
                },
                vec![0.3, 0.1, 0.7],
            )
            .unwrap();
        index.insert(record("b", "second"), vec![0.0, 1.0, 0.0]).unwrap();
        index.persist(&path).unwrap();

        let loaded = SimilarityIndex::load(&path).unwrap();
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(*loaded.read(), *index.read());
    }

    #[test]
    fn test_load_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(
            &path,
            r#"{"dimension": 2, "vectors": [[1.0, 0.0], [0.0, 1.0]], "metadata": [{"id": "a", "summary": "x"}]}"#,
        )
        .unwrap();

        assert!(matches!(SimilarityIndex::load(&path), Err(EngineError::CorruptIndex(_))));
    }

    #[test]
    fn test_load_bad_vector_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(
            &path,
            r#"{"dimension": 2, "vectors": [[1.0, 0.0, 0.0]], "metadata": [{"id": "a", "summary": "x"}]}"#,
        )
        .unwrap();

        assert!(matches!(
            SimilarityIndex::load(&path),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_open_or_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::open_or_create(&dir.path().join("none.json"), 8).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn test_empty_index_persist_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("empty.json");

        SimilarityIndex::new(16).persist(&path).unwrap();
        let loaded = SimilarityIndex::load(&path).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimension(), 16);
        assert!(loaded.search(&[0.5; 16], 3).unwrap().is_empty());

        let reopened = SimilarityIndex::open_or_create(&path, 16).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_readers_during_insert_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let index = SimilarityIndex::new(2);
        index.insert(record("seed", "seed"), vec![1.0, 0.0]).unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for i in 0..200 {
                    let angle = i as f32 * 0.01;
                    index
                        .insert(record(&format!("r{}", i), "row"), vec![angle.cos(), angle.sin()])
                        .unwrap();
                    if i % 50 == 0 {
                        index.persist(&path).unwrap();
                    }
                }
            });

            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        for _ in 0..200 {
                            let hits = index.search(&[1.0, 0.0], 5).unwrap();
                            assert!(!hits.is_empty() && hits.len() <= 5);
                            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                        }
                    })
                })
                .collect();

            writer.join().unwrap();
            for reader in readers {
                reader.join().unwrap();
            }
        });

        assert_eq!(index.len(), 201);
        index.persist(&path).unwrap();
        assert_eq!(SimilarityIndex::load(&path).unwrap().len(), 201);
    }
}
