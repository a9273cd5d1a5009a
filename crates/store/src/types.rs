use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of input text, already segmented by an upstream pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// A persisted chunk. Its ordinal position in the record store is the
/// same as its row in the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// A ranked search result. `score` is cosine similarity in [-1, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f32,
}

/// One entry of `list_sources`: a source label, its chunk count, and a
/// deterministic short identifier derived from the source name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: String,
    pub chunks: usize,
    pub file_id: String,
}
