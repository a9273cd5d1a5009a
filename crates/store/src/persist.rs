use crate::error::Result;
use crate::index::VectorIndex;
use crate::records::RecordStore;
use std::path::PathBuf;
use uuid::Uuid;

const VECTORS_FILE: &str = "vectors.bin";
const RECORDS_FILE: &str = "records.json";

/// Durable per-namespace state: one directory per namespace holding an
/// index blob and a record-store blob. Writes go through same-directory
/// temp files and renames; a reader only ever sees the pair from before
/// or after a completed save.
#[derive(Debug, Clone)]
pub struct PersistenceLayer {
    root: PathBuf,
}

impl PersistenceLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(safe_component(namespace))
    }

    fn vectors_path(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join(VECTORS_FILE)
    }

    fn records_path(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join(RECORDS_FILE)
    }

    /// Load a namespace. Any missing, empty, undecodable, or mutually
    /// inconsistent pair degrades to `None` ("empty namespace") rather
    /// than an error; a fresh namespace and a corrupt one look the same
    /// to the caller.
    pub async fn load(&self, namespace: &str) -> Option<(VectorIndex, RecordStore)> {
        let vectors_path = self.vectors_path(namespace);
        let records_path = self.records_path(namespace);

        let vector_bytes = match tokio::fs::read(&vectors_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                log::warn!("empty index blob at {}", vectors_path.display());
                return None;
            }
            Err(_) => return None,
        };
        let record_bytes = match tokio::fs::read(&records_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                log::warn!("empty record blob at {}", records_path.display());
                return None;
            }
            Err(_) => return None,
        };

        let Some((index, index_generation)) = VectorIndex::decode(&vector_bytes) else {
            log::warn!(
                "undecodable index blob at {}, treating namespace '{namespace}' as empty",
                vectors_path.display()
            );
            return None;
        };
        let (records, record_generation) = match RecordStore::from_json(&record_bytes) {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!(
                    "undecodable record blob at {}: {err}, treating namespace '{namespace}' as empty",
                    records_path.display()
                );
                return None;
            }
        };

        if Uuid::from_u128(index_generation).to_string() != record_generation {
            log::warn!(
                "index/record generation mismatch for namespace '{namespace}' (torn save), treating as empty"
            );
            return None;
        }

        if index.len() != records.len() {
            log::warn!(
                "index/record skew for namespace '{namespace}' ({} rows vs {} records), treating as empty",
                index.len(),
                records.len()
            );
            return None;
        }

        Some((index, records))
    }

    /// Persist both artifacts. Temp files are fully written before the
    /// first rename, so write failures leave the previous pair intact.
    /// Both carry the same freshly minted generation; if a crash leaves
    /// one renamed and the other not, the next load sees the mismatch
    /// and degrades to empty instead of serving a torn pair.
    pub async fn save(
        &self,
        namespace: &str,
        index: &VectorIndex,
        records: &RecordStore,
    ) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let vectors_path = self.vectors_path(namespace);
        let records_path = self.records_path(namespace);
        let vectors_tmp = vectors_path.with_extension("bin.tmp");
        let records_tmp = records_path.with_extension("json.tmp");

        let generation = Uuid::new_v4();
        let write_result: Result<()> = async {
            tokio::fs::write(&vectors_tmp, index.encode(generation.as_u128())).await?;
            tokio::fs::write(&records_tmp, records.to_json(&generation.to_string())?)
                .await?;
            tokio::fs::rename(&vectors_tmp, &vectors_path).await?;
            tokio::fs::rename(&records_tmp, &records_path).await?;
            Ok(())
        }
        .await;

        if write_result.is_err() {
            let _ = tokio::fs::remove_file(&vectors_tmp).await;
            let _ = tokio::fs::remove_file(&records_tmp).await;
        }
        write_result
    }
}

fn safe_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    // "." and ".." are path components, not names; an all-dots result
    // would escape (or collide with) the store root.
    if out.is_empty() || out.chars().all(|ch| ch == '.') {
        "_".to_string()
    } else {
        out
    }
}
