//! # Recall Store
//!
//! Per-user semantic retrieval over pre-chunked text.
//!
//! ## Architecture
//!
//! ```text
//! Chunk[] (pre-segmented text + metadata)
//!     │
//!     ├──> EmbeddingProvider
//!     │      └─> normalized Vector[d]
//!     │
//!     ├──> VectorIndex (exact flat cosine search, rebuilt on mutation)
//!     │
//!     └──> RecordStore (insertion-ordered, row i == record i)
//!            └─> PersistenceLayer (atomic per-namespace file pair)
//! ```
//!
//! The vector index is a disposable cache of the record sequence: it
//! has no delete, so replacing or removing a source rebuilds it from
//! the surviving records. Both structures persist together and reload
//! tolerantly — a corrupt namespace degrades to an empty one.
//!
//! ## Example
//!
//! ```no_run
//! use recall_store::{Chunk, HashEmbedder, RetrievalStore};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = RetrievalStore::new(".recall_store", Arc::new(HashEmbedder::default()));
//!
//!     let chunks = vec![Chunk {
//!         text: "cats are mammals".to_string(),
//!         meta: BTreeMap::new(),
//!     }];
//!     store.upsert("user-1", "facts.txt", chunks, BTreeMap::new()).await?;
//!
//!     for hit in store.search("user-1", "what are cats?", 5).await? {
//!         println!("{:.3}  {}", hit.score, hit.text);
//!     }
//!     Ok(())
//! }
//! ```

mod embeddings;
mod error;
mod index;
mod persist;
mod records;
mod store;
mod types;

pub use embeddings::{
    cosine_similarity, normalize, EmbeddingProvider, HashEmbedder, DEFAULT_HASH_DIMENSION,
};
pub use error::{RecallError, Result};
pub use index::VectorIndex;
pub use persist::PersistenceLayer;
pub use records::{source_file_id, RecordStore, RECORD_SCHEMA_VERSION, SOURCE_KEY};
pub use store::{clean_text, RetrievalStore};
pub use types::{Chunk, Hit, Record, SourceSummary};
