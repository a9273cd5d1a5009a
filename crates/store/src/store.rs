use crate::embeddings::{normalize, EmbeddingProvider};
use crate::error::{RecallError, Result};
use crate::index::VectorIndex;
use crate::persist::PersistenceLayer;
use crate::records::{RecordStore, SOURCE_KEY};
use crate::types::{Chunk, Hit, Record, SourceSummary};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Per-namespace semantic retrieval store.
///
/// Owns the alignment invariant between the vector index and the record
/// store: row i of the index always corresponds to the i-th record in
/// insertion order. The index has no delete, so any membership change
/// other than a pure append rebuilds it from the record sequence.
///
/// Mutations (`upsert`, `delete`) hold a per-namespace write lock for
/// the whole load-rebuild-persist cycle; reads share a read lock and
/// never observe a partially rebuilt namespace. Namespaces are fully
/// independent.
pub struct RetrievalStore {
    provider: Arc<dyn EmbeddingProvider>,
    persist: PersistenceLayer,
    // One entry per namespace ever touched; bounded by the tenant
    // count, which stays small enough that eviction is not worth it.
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl RetrievalStore {
    pub fn new(root: impl AsRef<Path>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        log::info!(
            "initializing retrieval store at {:?} (dimension {})",
            root.as_ref(),
            provider.dimension()
        );
        Self {
            provider,
            persist: PersistenceLayer::new(root.as_ref()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn namespace_lock(&self, namespace: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Load a namespace, additionally requiring the persisted index to
    /// match the provider's dimensionality. State written under a
    /// different embedding width is useless to this provider, so it is
    /// treated like any other corrupt state: empty, with a warning.
    async fn load_namespace(&self, namespace: &str) -> Option<(VectorIndex, RecordStore)> {
        let (index, records) = self.persist.load(namespace).await?;
        if index.dimension() != self.provider.dimension() {
            log::warn!(
                "index dimension {} does not match provider dimension {} for namespace '{namespace}', treating as empty",
                index.dimension(),
                self.provider.dimension()
            );
            return None;
        }
        Some((index, records))
    }

    /// Replace all records belonging to `source` with the supplied
    /// chunks. Returns the number of records actually added.
    ///
    /// The algorithm always clears first: an empty `chunks` still
    /// removes the source's existing records and persists that. Chunks
    /// whose text normalizes to empty are dropped. A chunk that fails
    /// to embed is skipped; a failure re-embedding the kept records
    /// aborts the whole operation with the namespace untouched.
    pub async fn upsert(
        &self,
        namespace: &str,
        source: &str,
        chunks: Vec<Chunk>,
        metadata: BTreeMap<String, String>,
    ) -> Result<usize> {
        validate_namespace(namespace)?;
        validate_source(source)?;

        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.write().await;

        let records = match self.load_namespace(namespace).await {
            Some((_, records)) => records,
            None => RecordStore::new(),
        };
        let (kept, removed) = records.partition_by_source(source);

        let mut default_metadata = metadata;
        default_metadata
            .entry(SOURCE_KEY.to_string())
            .or_insert_with(|| source.to_string());

        let mut candidates = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let text = clean_text(&chunk.text);
            if text.is_empty() {
                log::debug!("dropping empty chunk for source '{source}'");
                continue;
            }
            let mut record_metadata = default_metadata.clone();
            record_metadata.extend(chunk.meta);
            candidates.push(Record {
                id: Uuid::new_v4().to_string(),
                text,
                metadata: record_metadata,
            });
        }

        // Re-embedding existing content must not fail silently: a
        // partial rebuild would corrupt the namespace.
        let kept_texts: Vec<String> = kept.iter().map(|r| r.text.clone()).collect();
        let kept_vectors = self.provider.embed_batch(&kept_texts).await?;
        if kept_vectors.len() != kept.len() {
            return Err(RecallError::Embedding(format!(
                "provider returned {} vectors for {} kept records",
                kept_vectors.len(),
                kept.len()
            )));
        }

        let (added, new_vectors) = self.embed_skipping_failures(candidates).await;

        let mut index = VectorIndex::new(self.provider.dimension());
        index.add_batch(kept_vectors)?;
        index.add_batch(new_vectors)?;

        let mut store = RecordStore::from_records(kept);
        let added_count = added.len();
        for record in added {
            store.push(record);
        }

        self.persist.save(namespace, &index, &store).await?;
        log::info!(
            "upsert namespace='{namespace}' source='{source}': removed {removed}, added {added_count}, total {}",
            store.len()
        );
        Ok(added_count)
    }

    /// Remove all records belonging to `source`. Returns the number of
    /// records removed; a source with no records is not an error and
    /// leaves the persisted files untouched.
    pub async fn delete(&self, namespace: &str, source: &str) -> Result<usize> {
        validate_namespace(namespace)?;
        validate_source(source)?;

        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.write().await;

        let Some((_, records)) = self.load_namespace(namespace).await else {
            return Ok(0);
        };
        let (kept, removed) = records.partition_by_source(source);
        if removed == 0 {
            return Ok(0);
        }

        let kept_texts: Vec<String> = kept.iter().map(|r| r.text.clone()).collect();
        let kept_vectors = self.provider.embed_batch(&kept_texts).await?;

        let mut index = VectorIndex::new(self.provider.dimension());
        index.add_batch(kept_vectors)?;
        let store = RecordStore::from_records(kept);

        self.persist.save(namespace, &index, &store).await?;
        log::info!(
            "delete namespace='{namespace}' source='{source}': removed {removed}, total {}",
            store.len()
        );
        Ok(removed)
    }

    /// Top-k semantic search. An empty namespace or a query that
    /// normalizes to empty yields no hits rather than an error.
    pub async fn search(&self, namespace: &str, query: &str, k: usize) -> Result<Vec<Hit>> {
        validate_namespace(namespace)?;
        if k == 0 {
            return Err(RecallError::InvalidInput(
                "k must be at least 1".to_string(),
            ));
        }
        let query = clean_text(query);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.read().await;

        let Some((index, records)) = self.load_namespace(namespace).await else {
            return Ok(Vec::new());
        };
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_vector = self.provider.embed(&query).await?;
        normalize(&mut query_vector);

        let limit = k.min(records.len());
        let neighbors = index.search(&query_vector, limit)?;

        let mut hits = Vec::with_capacity(neighbors.len());
        for (position, score) in neighbors {
            // Positions outside the record sequence indicate skew with
            // the index; discard rather than fail the whole query.
            let Some(record) = records.get(position) else {
                log::warn!(
                    "search hit at position {position} outside record sequence (len {}), discarding",
                    records.len()
                );
                continue;
            };
            hits.push(Hit {
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                score,
            });
        }
        Ok(hits)
    }

    /// Search plus a per-source tally of where the hits came from.
    pub async fn search_with_trace(
        &self,
        namespace: &str,
        query: &str,
        k: usize,
    ) -> Result<(Vec<Hit>, BTreeMap<String, usize>)> {
        let hits = self.search(namespace, query, k).await?;
        let mut tally: BTreeMap<String, usize> = BTreeMap::new();
        for hit in &hits {
            let source = hit
                .metadata
                .get(SOURCE_KEY)
                .map_or("unknown", String::as_str);
            *tally.entry(source.to_string()).or_default() += 1;
        }
        Ok((hits, tally))
    }

    /// Per-source chunk counts, sorted by source name ascending.
    pub async fn list_sources(&self, namespace: &str) -> Result<Vec<SourceSummary>> {
        validate_namespace(namespace)?;

        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.read().await;

        let Some((_, records)) = self.load_namespace(namespace).await else {
            return Ok(Vec::new());
        };
        Ok(records.source_summaries())
    }

    /// Embed new records, skipping any that fail. Tries one batch call
    /// first; if the batch fails (or comes back misaligned), falls back
    /// to per-record embedding so one bad chunk cannot sink the rest.
    async fn embed_skipping_failures(
        &self,
        candidates: Vec<Record>,
    ) -> (Vec<Record>, Vec<Vec<f32>>) {
        if candidates.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let texts: Vec<String> = candidates.iter().map(|r| r.text.clone()).collect();
        match self.provider.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == candidates.len() => (candidates, vectors),
            Ok(vectors) => {
                log::warn!(
                    "batch embedding returned {} vectors for {} chunks, retrying individually",
                    vectors.len(),
                    candidates.len()
                );
                self.embed_one_by_one(candidates).await
            }
            Err(err) => {
                log::warn!("batch embedding failed ({err}), retrying individually");
                self.embed_one_by_one(candidates).await
            }
        }
    }

    async fn embed_one_by_one(&self, candidates: Vec<Record>) -> (Vec<Record>, Vec<Vec<f32>>) {
        let mut records = Vec::with_capacity(candidates.len());
        let mut vectors = Vec::with_capacity(candidates.len());
        for record in candidates {
            match self.provider.embed(&record.text).await {
                Ok(vector) => {
                    records.push(record);
                    vectors.push(vector);
                }
                Err(err) => {
                    log::warn!("skipping chunk that failed to embed: {err}");
                }
            }
        }
        (records, vectors)
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.trim().is_empty() {
        return Err(RecallError::InvalidInput(
            "namespace must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_source(source: &str) -> Result<()> {
    if source.trim().is_empty() {
        return Err(RecallError::InvalidInput(
            "source must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Normalize chunk and query text: unify line endings, strip NUL bytes
/// and trailing whitespace on each line, squeeze runs of three or more
/// newlines down to a single blank line, trim the ends.
#[must_use]
pub fn clean_text(raw: &str) -> String {
    let unified = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{0}', " ");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.split('\n') {
        let line = line.trim_end_matches([' ', '\t']);
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::error::RecallError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            meta: BTreeMap::new(),
        }
    }

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts.iter().map(|t| chunk(t)).collect()
    }

    fn test_store(tmp: &TempDir) -> RetrievalStore {
        RetrievalStore::new(tmp.path(), Arc::new(HashEmbedder::new(64)))
    }

    /// Fails for any text containing a marker substring, on batch and
    /// single calls alike.
    struct PoisonEmbedder {
        inner: HashEmbedder,
        marker: &'static str,
    }

    impl PoisonEmbedder {
        fn new(marker: &'static str) -> Self {
            Self {
                inner: HashEmbedder::new(64),
                marker,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for PoisonEmbedder {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains(self.marker)) {
                return Err(RecallError::Embedding("poisoned text".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn upsert_then_exact_search() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let added = store
            .upsert("u1", "a.txt", chunks(&["cats are mammals"]), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(added, 1);

        let hits = store.search("u1", "cats are mammals", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "cats are mammals");
        assert!(hits[0].score > 0.999);
        assert_eq!(hits[0].metadata.get("source").unwrap(), "a.txt");
    }

    #[tokio::test]
    async fn upsert_replaces_previous_source_contents() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert(
                "u1",
                "a.txt",
                chunks(&["first", "second", "third"]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        store
            .upsert("u1", "a.txt", chunks(&["fourth"]), BTreeMap::new())
            .await
            .unwrap();

        let sources = store.list_sources("u1").await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, "a.txt");
        assert_eq!(sources[0].chunks, 1);

        // The replaced texts are gone even under exact-text queries.
        let hits = store.search("u1", "first", 4).await.unwrap();
        assert!(hits.iter().all(|h| h.text != "first"));
        let hits = store.search("u1", "fourth", 1).await.unwrap();
        assert_eq!(hits[0].text, "fourth");
    }

    #[tokio::test]
    async fn delete_leaves_other_sources_intact() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert("u1", "a.txt", chunks(&["a1", "a2", "a3"]), BTreeMap::new())
            .await
            .unwrap();
        store
            .upsert("u1", "b.txt", chunks(&["b1", "b2"]), BTreeMap::new())
            .await
            .unwrap();

        let removed = store.delete("u1", "b.txt").await.unwrap();
        assert_eq!(removed, 2);

        let sources = store.list_sources("u1").await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, "a.txt");
        assert_eq!(sources[0].chunks, 3);

        for text in ["a1", "a2", "a3"] {
            let hits = store.search("u1", text, 1).await.unwrap();
            assert_eq!(hits[0].text, text);
        }
    }

    #[tokio::test]
    async fn delete_of_missing_source_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        assert_eq!(store.delete("u1", "missing.txt").await.unwrap(), 0);

        store
            .upsert("u1", "a.txt", chunks(&["hello"]), BTreeMap::new())
            .await
            .unwrap();
        let persist = PersistenceLayer::new(tmp.path());
        let dir = persist.namespace_dir("u1");
        let before_vectors = tokio::fs::read(dir.join("vectors.bin")).await.unwrap();
        let before_records = tokio::fs::read(dir.join("records.json")).await.unwrap();

        assert_eq!(store.delete("u1", "missing.txt").await.unwrap(), 0);

        let after_vectors = tokio::fs::read(dir.join("vectors.bin")).await.unwrap();
        let after_records = tokio::fs::read(dir.join("records.json")).await.unwrap();
        assert_eq!(before_vectors, after_vectors);
        assert_eq!(before_records, after_records);
    }

    #[tokio::test]
    async fn empty_query_and_empty_namespace_yield_no_hits() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        assert!(store.search("u1", "anything", 5).await.unwrap().is_empty());

        store
            .upsert("u1", "a.txt", chunks(&["hello"]), BTreeMap::new())
            .await
            .unwrap();
        assert!(store.search("u1", "", 5).await.unwrap().is_empty());
        assert!(store.search("u1", "  \n\t ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_k_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        assert!(matches!(
            store.search("u1", "query", 0).await,
            Err(RecallError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn empty_source_is_rejected_without_touching_storage() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let result = store
            .upsert("u1", "", chunks(&["text"]), BTreeMap::new())
            .await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
        assert!(matches!(
            store.delete("u1", "  ").await,
            Err(RecallError::InvalidInput(_))
        ));

        let persist = PersistenceLayer::new(tmp.path());
        assert!(persist.load("u1").await.is_none());
    }

    #[tokio::test]
    async fn empty_and_whitespace_chunks_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let added = store
            .upsert(
                "u1",
                "a.txt",
                chunks(&["real content", "", "   \n\n  "]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(added, 1);

        let sources = store.list_sources("u1").await.unwrap();
        assert_eq!(sources[0].chunks, 1);
    }

    #[tokio::test]
    async fn upsert_with_no_chunks_still_clears_the_source() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert("u1", "a.txt", chunks(&["one", "two"]), BTreeMap::new())
            .await
            .unwrap();
        let added = store
            .upsert("u1", "a.txt", Vec::new(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert!(store.list_sources("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_meta_overrides_default_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let mut default_meta = BTreeMap::new();
        default_meta.insert("lang".to_string(), "en".to_string());
        default_meta.insert("page".to_string(), "0".to_string());

        let mut c = chunk("annotated");
        c.meta.insert("page".to_string(), "7".to_string());

        store
            .upsert("u1", "doc.pdf", vec![c], default_meta)
            .await
            .unwrap();

        let hits = store.search("u1", "annotated", 1).await.unwrap();
        assert_eq!(hits[0].metadata.get("lang").unwrap(), "en");
        assert_eq!(hits[0].metadata.get("page").unwrap(), "7");
        assert_eq!(hits[0].metadata.get("source").unwrap(), "doc.pdf");
    }

    #[tokio::test]
    async fn failing_new_chunks_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = RetrievalStore::new(tmp.path(), Arc::new(PoisonEmbedder::new("BAD")));

        store
            .upsert("u1", "a.txt", chunks(&["good one"]), BTreeMap::new())
            .await
            .unwrap();

        // Batch fails because of the poisoned chunk; the per-chunk
        // fallback keeps the healthy one.
        let added = store
            .upsert(
                "u1",
                "b.txt",
                chunks(&["healthy", "BAD apple"]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(added, 1);

        let sources = store.list_sources("u1").await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].source, "b.txt");
        assert_eq!(sources[1].chunks, 1);
    }

    #[tokio::test]
    async fn all_new_chunks_failing_still_persists_the_clear() {
        let tmp = TempDir::new().unwrap();
        let store = RetrievalStore::new(tmp.path(), Arc::new(PoisonEmbedder::new("BAD")));

        store
            .upsert("u1", "a.txt", chunks(&["old text"]), BTreeMap::new())
            .await
            .unwrap();
        let added = store
            .upsert("u1", "a.txt", chunks(&["BAD text"]), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert!(store.list_sources("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_kept_reembedding_aborts_and_preserves_state() {
        let tmp = TempDir::new().unwrap();

        // Write healthy state first.
        let store = test_store(&tmp);
        store
            .upsert("u1", "a.txt", chunks(&["BAD but stored"]), BTreeMap::new())
            .await
            .unwrap();

        let persist = PersistenceLayer::new(tmp.path());
        let dir = persist.namespace_dir("u1");
        let before = tokio::fs::read(dir.join("records.json")).await.unwrap();

        // A store whose provider chokes on the kept record must abort
        // the whole upsert without persisting anything.
        let flaky = RetrievalStore::new(tmp.path(), Arc::new(PoisonEmbedder::new("BAD")));
        let result = flaky
            .upsert("u1", "b.txt", chunks(&["new text"]), BTreeMap::new())
            .await;
        assert!(matches!(result, Err(RecallError::Embedding(_))));

        let after = tokio::fs::read(dir.join("records.json")).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn index_and_records_stay_aligned_across_mutations() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let persist = PersistenceLayer::new(tmp.path());

        store
            .upsert("u1", "a.txt", chunks(&["a1", "a2"]), BTreeMap::new())
            .await
            .unwrap();
        store
            .upsert("u1", "b.txt", chunks(&["b1", "b2", "b3"]), BTreeMap::new())
            .await
            .unwrap();
        store
            .upsert("u1", "a.txt", chunks(&["a4"]), BTreeMap::new())
            .await
            .unwrap();
        store.delete("u1", "b.txt").await.unwrap();

        let (index, records) = persist.load("u1").await.unwrap();
        assert_eq!(index.len(), records.len());
        assert_eq!(records.len(), 1);
        assert_eq!(records.get(0).unwrap().text, "a4");
    }

    #[tokio::test]
    async fn reload_reproduces_search_results() {
        let tmp = TempDir::new().unwrap();
        let texts = ["the quick brown fox", "lazy dogs sleep", "foxes are canids"];

        let store = test_store(&tmp);
        store
            .upsert("u1", "a.txt", chunks(&texts), BTreeMap::new())
            .await
            .unwrap();
        let before = store.search("u1", "fox behavior", 3).await.unwrap();

        // Process-restart equivalent: a brand new store over the same
        // directory.
        let reopened = test_store(&tmp);
        let after = reopened.search("u1", "fox behavior", 3).await.unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.text, a.text);
            assert!((b.score - a.score).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert("alice", "a.txt", chunks(&["alice text"]), BTreeMap::new())
            .await
            .unwrap();
        store
            .upsert("bob", "a.txt", chunks(&["bob text"]), BTreeMap::new())
            .await
            .unwrap();

        store.delete("alice", "a.txt").await.unwrap();

        assert!(store.list_sources("alice").await.unwrap().is_empty());
        let bob = store.list_sources("bob").await.unwrap();
        assert_eq!(bob[0].chunks, 1);
    }

    #[tokio::test]
    async fn search_with_trace_tallies_sources() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert("u1", "a.txt", chunks(&["fox one", "fox two"]), BTreeMap::new())
            .await
            .unwrap();
        store
            .upsert("u1", "b.txt", chunks(&["unrelated"]), BTreeMap::new())
            .await
            .unwrap();

        let (hits, tally) = store.search_with_trace("u1", "fox", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        let total: usize = tally.values().sum();
        assert_eq!(total, 3);
        assert!(tally.contains_key("a.txt"));
    }

    #[tokio::test]
    async fn search_never_returns_more_than_record_count() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store
            .upsert("u1", "a.txt", chunks(&["only one"]), BTreeMap::new())
            .await
            .unwrap();
        let hits = store.search("u1", "only one", 50).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn dot_namespace_cannot_escape_the_store_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store_root");
        let store = RetrievalStore::new(&root, Arc::new(HashEmbedder::new(64)));

        store
            .upsert("..", "a.txt", chunks(&["escaped?"]), BTreeMap::new())
            .await
            .unwrap();

        // The namespace maps to a directory under the root, never to
        // the root's parent or the root itself.
        assert!(!tmp.path().join("records.json").exists());
        assert!(!root.join("records.json").exists());
        assert!(root.join("_").join("records.json").exists());

        let hits = store.search("..", "escaped?", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn provider_dimension_change_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();

        let store = RetrievalStore::new(tmp.path(), Arc::new(HashEmbedder::new(64)));
        store
            .upsert("u1", "a.txt", chunks(&["wide vectors"]), BTreeMap::new())
            .await
            .unwrap();

        // Reopening with a different embedding width must not surface
        // a dimension error; the stale state reads as empty.
        let narrow = RetrievalStore::new(tmp.path(), Arc::new(HashEmbedder::new(32)));
        assert!(narrow.search("u1", "wide vectors", 1).await.unwrap().is_empty());
        assert!(narrow.list_sources("u1").await.unwrap().is_empty());

        // And a mutation through the narrow store rebuilds cleanly.
        let added = narrow
            .upsert("u1", "b.txt", chunks(&["narrow vectors"]), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(added, 1);
        let hits = narrow.search("u1", "narrow vectors", 1).await.unwrap();
        assert_eq!(hits[0].text, "narrow vectors");
    }

    #[test]
    fn clean_text_normalizes_whitespace() {
        assert_eq!(clean_text("  hello  "), "hello");
        assert_eq!(clean_text("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(clean_text("nul\u{0}byte"), "nul byte");
        assert_eq!(clean_text("line   \t\nnext"), "line\nnext");
        assert_eq!(clean_text("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(clean_text("\n\n\n"), "");
    }
}
