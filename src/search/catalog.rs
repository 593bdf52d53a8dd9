use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::ChunkLookup;
use crate::models::Chunk;

/// Chunk records by id, persisted as one JSON file.
pub struct ChunkCatalog {
    chunks: RwLock<HashMap<String, Chunk>>,
    persist_path: PathBuf,
}

impl ChunkCatalog {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let chunks = if path.exists() {
            let data = std::fs::read_to_string(path).context("Failed to read chunk catalog")?;
            let list: Vec<Chunk> = serde_json::from_str(&data)
                .with_context(|| format!("Corrupt chunk catalog at {}", path.display()))?;
            list.into_iter().map(|c| (c.id.clone(), c)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            chunks: RwLock::new(chunks),
            persist_path: path.to_path_buf(),
        })
    }

    /// Insert or replace chunks by id.
    pub fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        let mut map = self.chunks.write();
        for chunk in chunks {
            map.insert(chunk.id.clone(), chunk.clone());
        }
        persist(&self.persist_path, &map)
    }

    /// Remove every chunk of a document. Returns the removed ids.
    pub fn delete_document(&self, document_id: &str) -> Result<Vec<String>> {
        let mut map = self.chunks.write();
        let removed: Vec<String> = map
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &removed {
            map.remove(id);
        }
        persist(&self.persist_path, &map)?;
        Ok(removed)
    }

    pub fn get_many(&self, ids: &[String]) -> Vec<Chunk> {
        let map = self.chunks.read();
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Atomic write via temp file + rename.
fn persist(path: &Path, map: &HashMap<String, Chunk>) -> Result<()> {
    let mut list: Vec<&Chunk> = map.values().collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    let data = serde_json::to_string(&list)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[async_trait]
impl ChunkLookup for ChunkCatalog {
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        Ok(self.get_many(ids))
    }
}
