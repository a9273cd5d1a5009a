use crate::error::{RecallError, Result};
use crate::types::{Record, SourceSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

pub const RECORD_SCHEMA_VERSION: u32 = 1;

pub const SOURCE_KEY: &str = "source";

/// Insertion-ordered record sequence.
///
/// The position of a record here is the row of its vector in the index,
/// so this must never be backed by an unordered map: serialization and
/// deserialization both go through an explicit `Vec`. The id side table
/// only serves O(1) membership checks.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<Record>,
    positions: HashMap<String, usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecords {
    schema_version: u32,
    // Shared with the index blob written in the same save; lets the
    // loader spot a torn file pair.
    generation: String,
    records: Vec<Record>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_records(records: Vec<Record>) -> Self {
        let positions = records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.id.clone(), position))
            .collect();
        Self { records, positions }
    }

    pub fn push(&mut self, record: Record) {
        self.positions.insert(record.id.clone(), self.records.len());
        self.records.push(record);
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Record> {
        self.records.get(position)
    }

    #[must_use]
    pub fn contains_id(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    fn record_source(record: &Record) -> &str {
        record
            .metadata
            .get(SOURCE_KEY)
            .map_or("unknown", String::as_str)
    }

    /// Split into records to keep (source differs) and the count of
    /// records belonging to `source`, preserving the kept order.
    #[must_use]
    pub fn partition_by_source(self, source: &str) -> (Vec<Record>, usize) {
        let mut kept = Vec::with_capacity(self.records.len());
        let mut removed = 0;
        for record in self.records {
            if Self::record_source(&record) == source {
                removed += 1;
            } else {
                kept.push(record);
            }
        }
        (kept, removed)
    }

    /// Per-source chunk counts, sorted by source name ascending.
    #[must_use]
    pub fn source_summaries(&self) -> Vec<SourceSummary> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in &self.records {
            *counts.entry(Self::record_source(record)).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(source, chunks)| SourceSummary {
                source: source.to_string(),
                chunks,
                file_id: source_file_id(source),
            })
            .collect()
    }

    pub fn to_json(&self, generation: &str) -> Result<Vec<u8>> {
        let persisted = PersistedRecords {
            schema_version: RECORD_SCHEMA_VERSION,
            generation: generation.to_string(),
            records: self.records.clone(),
        };
        Ok(serde_json::to_vec(&persisted)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<(Self, String)> {
        let persisted: PersistedRecords = serde_json::from_slice(bytes)?;
        if persisted.schema_version != RECORD_SCHEMA_VERSION {
            return Err(RecallError::Other(format!(
                "unsupported record schema_version {} (expected {RECORD_SCHEMA_VERSION})",
                persisted.schema_version
            )));
        }
        Ok((Self::from_records(persisted.records), persisted.generation))
    }
}

/// Deterministic 16-hex-char identifier for a source label.
#[must_use]
pub fn source_file_id(source: &str) -> String {
    let digest = Sha256::digest(source.to_lowercase().as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
