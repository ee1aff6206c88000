//! Backend-neutral vector search.
//!
//! [`VectorSearch`] composes record CRUD from any [`StorageAdapter`] with
//! the vector primitives of a [`VectorBackend`]. Ranking, thresholds and
//! hydration happen here, identically for every backend.

use crate::error::{Error, Result};
use crate::query::{eval, StorageQuery};
use crate::record::{DataRecord, StoredVector};
use crate::storage::{cosine_similarity, Embedder, StorageAdapter, Store, VectorBackend};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to search with.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchInput {
    /// Embedded through the configured [`Embedder`]
    Text(String),
    Vector(Vec<f32>),
}

/// Search knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub k: usize,
    pub similarity_threshold: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            similarity_threshold: 0.0,
        }
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchResult {
    pub record: DataRecord,
    pub score: f32,
    /// `1 - score`
    pub distance: f32,
}

/// Backfill knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackfillOptions {
    /// Payload path holding the text to embed
    pub text_field: String,
    pub batch_size: usize,
    /// Leave records that already have a vector alone
    pub skip_indexed: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            text_field: "text".to_string(),
            batch_size: 100,
            skip_indexed: true,
        }
    }
}

/// Progress reported after each backfill batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackfillProgress {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

/// Final backfill tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Indexing coverage of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStats {
    pub total_records: usize,
    pub indexed_records: usize,
    pub dimensions: Option<usize>,
}

/// Vector search over one store.
pub struct VectorSearch {
    adapter: Arc<dyn StorageAdapter>,
    vectors: Arc<dyn VectorBackend>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl VectorSearch {
    pub fn new(adapter: Arc<dyn StorageAdapter>, vectors: Arc<dyn VectorBackend>) -> Self {
        Self {
            adapter,
            vectors,
            embedder: None,
        }
    }

    /// Record and vector operations from the same backend.
    pub fn for_store(store: Arc<dyn Store>) -> Self {
        Self::new(Arc::clone(&store).into_adapter(), store.into_vectors())
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    fn embedder(&self) -> Result<&Arc<dyn Embedder>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| Error::Embedding("no embedder configured".into()))
    }

    async fn resolve(&self, input: SearchInput) -> Result<Vec<f32>> {
        let vector = match input {
            SearchInput::Vector(v) => v,
            SearchInput::Text(text) => self.embedder()?.embed(&text).await?.vector,
        };
        if vector.is_empty() {
            return Err(Error::Embedding("query vector is empty".into()));
        }
        Ok(vector)
    }

    /// k-nearest records by cosine similarity.
    ///
    /// Hits below `similarity_threshold` are dropped; results are sorted by
    /// descending score. Vectors whose record no longer exists are skipped.
    pub async fn search(
        &self,
        collection: &str,
        input: SearchInput,
        options: SearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        let query = self.resolve(input).await?;
        let stored = self.vectors.get_all_vectors(collection).await?;

        let mut scored: Vec<(f32, String)> = stored
            .into_iter()
            .filter(|v| v.dimensions() == query.len())
            .map(|v| (cosine_similarity(&query, &v.embedding), v.record_id))
            .filter(|(score, _)| *score >= options.similarity_threshold)
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut results = Vec::with_capacity(options.k.min(scored.len()));
        for (score, record_id) in scored {
            if results.len() >= options.k {
                break;
            }
            match self.adapter.read(collection, &record_id).await? {
                Some(record) => results.push(VectorSearchResult {
                    record,
                    score,
                    distance: 1.0 - score,
                }),
                None => warn!("Vector for {}/{} has no record, skipping", collection, record_id),
            }
        }
        debug!("Vector search in {} returned {} hits", collection, results.len());
        Ok(results)
    }

    /// Store `embedding` for an existing record.
    pub async fn index(
        &self,
        collection: &str,
        record_id: &str,
        embedding: Vec<f32>,
        model: Option<String>,
    ) -> Result<()> {
        self.vectors
            .ensure_vector_storage(collection, embedding.len())
            .await?;
        self.vectors
            .store_vector(collection, &StoredVector::new(record_id, embedding, model))
            .await
    }

    /// Embed `text` and store it for `record_id`.
    pub async fn index_text(&self, collection: &str, record_id: &str, text: &str) -> Result<()> {
        let embedding = self.embedder()?.embed(text).await?;
        self.index(collection, record_id, embedding.vector, Some(embedding.model_id))
            .await
    }

    /// Embed and index every record of `collection`, one page at a time.
    ///
    /// Per-record failures (missing text, embedding errors) are counted and
    /// skipped. `progress` runs after every page.
    pub async fn backfill(
        &self,
        collection: &str,
        options: &BackfillOptions,
        mut progress: impl FnMut(&BackfillProgress) + Send,
    ) -> Result<BackfillReport> {
        let embedder = Arc::clone(self.embedder()?);
        let batch_size = options.batch_size.max(1);
        let started = Instant::now();
        let total = self
            .adapter
            .get_collection_stats(collection)
            .await?
            .map_or(0, |s| s.record_count);
        let already: HashSet<String> = if options.skip_indexed {
            self.vectors
                .get_all_vectors(collection)
                .await?
                .into_iter()
                .map(|v| v.record_id)
                .collect()
        } else {
            HashSet::new()
        };
        info!("Backfilling {} ({} records, {} already indexed)", collection, total, already.len());

        let mut report = BackfillReport::default();
        let mut processed = 0;
        let mut offset = 0;
        loop {
            let page = self
                .adapter
                .query(
                    &StorageQuery::new(collection)
                        .with_limit(batch_size)
                        .with_offset(offset),
                )
                .await?;
            let fetched = page.len();
            for record in page {
                processed += 1;
                if already.contains(&record.id) {
                    report.skipped += 1;
                    continue;
                }
                let text = eval::get_path(&record.data, &options.text_field)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty());
                let Some(text) = text else {
                    debug!("{}/{} has no text at '{}'", collection, record.id, options.text_field);
                    report.failed += 1;
                    continue;
                };
                let stored = match embedder.embed(text).await {
                    Ok(embedding) => {
                        self.index(collection, &record.id, embedding.vector, Some(embedding.model_id))
                            .await
                    }
                    Err(e) => Err(e),
                };
                match stored {
                    Ok(()) => report.indexed += 1,
                    Err(e) => {
                        warn!("Backfill failed for {}/{}: {}", collection, record.id, e);
                        report.failed += 1;
                    }
                }
            }

            let elapsed = started.elapsed();
            let estimated_remaining = (processed > 0 && total > processed).then(|| {
                elapsed.mul_f64((total - processed) as f64 / processed as f64)
            });
            progress(&BackfillProgress {
                processed,
                failed: report.failed,
                total: total.max(processed),
                elapsed,
                estimated_remaining,
            });

            if fetched < batch_size {
                break;
            }
            offset += fetched;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Backfill of {} done: {} indexed, {} skipped, {} failed",
            collection, report.indexed, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Record count vs. indexed count for `collection`.
    pub async fn stats(&self, collection: &str) -> Result<VectorStats> {
        let total_records = self
            .adapter
            .get_collection_stats(collection)
            .await?
            .map_or(0, |s| s.record_count);
        let indexed_records = self.vectors.get_vector_count(collection).await?;
        let dimensions = self
            .vectors
            .get_all_vectors(collection)
            .await?
            .first()
            .map(StoredVector::dimensions);
        Ok(VectorStats {
            total_records,
            indexed_records,
            dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Embedding, MemoryAdapter};
    use async_trait::async_trait;
    use serde_json::json;

    /// Maps text to a fixed vector by keyword; fails on "boom".
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding> {
            if text.contains("boom") {
                return Err(Error::Embedding("worker rejected input".into()));
            }
            let v = if text.contains("cat") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("dog") {
                vec![0.8, 0.6, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            };
            Ok(Embedding::new(v, "keyword".into()))
        }
    }

    async fn search_over(records: &[(&str, &str)]) -> (Arc<MemoryAdapter>, VectorSearch) {
        let store = Arc::new(MemoryAdapter::ephemeral());
        for (id, text) in records {
            store
                .create(DataRecord::new("docs", *id, json!({ "text": text })))
                .await
                .unwrap();
        }
        let search = VectorSearch::for_store(store.clone()).with_embedder(Arc::new(KeywordEmbedder));
        (store, search)
    }

    #[tokio::test]
    async fn test_search_orders_by_score_and_applies_threshold() {
        let (_store, search) = search_over(&[("a", "cat"), ("b", "dog"), ("c", "car")]).await;
        search.index("docs", "a", vec![1.0, 0.0, 0.0], None).await.unwrap();
        search.index("docs", "b", vec![0.8, 0.6, 0.0], None).await.unwrap();
        search.index("docs", "c", vec![0.0, 0.0, 1.0], None).await.unwrap();

        let hits = search
            .search(
                "docs",
                SearchInput::Vector(vec![1.0, 0.0, 0.0]),
                SearchOptions { k: 5, similarity_threshold: 0.5 },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits.windows(2).all(|w| w[0].score > w[1].score));
        assert!(hits.iter().all(|h| h.score >= 0.5));
        assert!((hits[0].distance - 0.0).abs() < 1e-6);

        let top1 = search
            .search("docs", SearchInput::Text("a cat".into()), SearchOptions { k: 1, similarity_threshold: 0.0 })
            .await
            .unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].record.id, "a");
    }

    #[tokio::test]
    async fn test_text_search_without_embedder_fails() {
        let store = Arc::new(MemoryAdapter::ephemeral());
        let search = VectorSearch::for_store(store);
        let err = search
            .search("docs", SearchInput::Text("cat".into()), SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[tokio::test]
    async fn test_backfill_counts_failures_and_reports_progress() {
        let records: Vec<(String, String)> = (0..7)
            .map(|i| (format!("r{}", i), if i == 3 { "boom".to_string() } else { format!("cat {}", i) }))
            .collect();
        let refs: Vec<(&str, &str)> = records.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let (store, search) = search_over(&refs).await;
        store
            .create(DataRecord::new("docs", "no-text", json!({"title": "x"})))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let options = BackfillOptions {
            batch_size: 3,
            ..Default::default()
        };
        let report = search
            .backfill("docs", &options, |p| seen.push(*p))
            .await
            .unwrap();
        assert_eq!(report.indexed, 6);
        assert_eq!(report.failed, 2);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().processed, 8);
        assert_eq!(seen.last().unwrap().total, 8);

        let stats = search.stats("docs").await.unwrap();
        assert_eq!(stats, VectorStats { total_records: 8, indexed_records: 6, dimensions: Some(3) });

        // A second run leaves indexed records alone.
        let again = search.backfill("docs", &options, |_| {}).await.unwrap();
        assert_eq!(again.skipped, 6);
        assert_eq!(again.indexed, 0);
    }
}
