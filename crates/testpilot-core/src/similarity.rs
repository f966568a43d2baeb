//! Nearest-neighbour lookup over embedded source chunks.

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::error::{ServiceError, ToolError};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Lines per indexed chunk.
pub const CHUNK_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub source_location: String,
    pub content: String,
    pub distance: f32,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Up to `k` neighbours ordered by ascending distance.
    async fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, ServiceError>;
}

/// Similarity store backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIndex {
    pub fn from_config(config: &Config) -> Result<Self, ToolError> {
        let store = config.require_similarity_store()?;
        let path = store
            .strip_prefix("sqlite://")
            .or_else(|| store.strip_prefix("sqlite:"))
            .unwrap_or(store);
        Ok(Self::open(Path::new(path))?)
    }

    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ServiceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ServiceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                source_location TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ServiceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ServiceError::Store("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| ServiceError::Store(e.to_string()))?
    }

    pub async fn insert(
        &self,
        source_location: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<(), ServiceError> {
        let encoded = serde_json::to_string(embedding)
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        let source_location = source_location.to_string();
        let content = content.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chunks (source_location, content, embedding) VALUES (?1, ?2, ?3)",
                params![source_location, content, encoded],
            )?;
            Ok(())
        })
        .await
    }

    /// Chunk every Go file under `dir`, embed each chunk and store it.
    /// Returns the number of chunks written.
    pub async fn index_directory(
        &self,
        dir: &Path,
        embedder: &dyn Embedder,
    ) -> Result<usize, ToolError> {
        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || crate::tools::collect_files(&root, true))
            .await
            .map_err(|e| ToolError::Internal(format!("Directory walk failed: {}", e)))?;
        let mut written = 0;

        for path in files.iter().filter(|p| p.extension().is_some_and(|e| e == "go")) {
            let text = match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };
            let relative = path.strip_prefix(dir).unwrap_or(path).display().to_string();

            for chunk in chunk_source(&text, CHUNK_LINES) {
                let embedding = embedder.embed(&chunk.content).await?;
                let location = format!("{}:{}-{}", relative, chunk.start_line, chunk.end_line);
                self.insert(&location, &chunk.content, &embedding).await?;
                written += 1;
            }
        }

        info!(dir = %dir.display(), chunks = written, "Indexed source directory");
        Ok(written)
    }
}

#[async_trait]
impl SimilarityIndex for SqliteIndex {
    async fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, ServiceError> {
        let query = embedding.to_vec();

        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT source_location, content, embedding FROM chunks")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut neighbors = Vec::new();
            for row in rows {
                let (source_location, content, encoded) = row?;
                let stored: Vec<f32> = match serde_json::from_str(&encoded) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if stored.len() != query.len() {
                    continue;
                }
                neighbors.push(Neighbor {
                    source_location,
                    content,
                    distance: 1.0 - cosine_similarity(&stored, &query),
                });
            }

            neighbors.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            neighbors.truncate(k);
            Ok(neighbors)
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

/// Split text into windows of `window` lines; blank windows are dropped.
pub fn chunk_source(text: &str, window: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    lines
        .chunks(window.max(1))
        .enumerate()
        .filter(|(_, block)| block.iter().any(|l| !l.trim().is_empty()))
        .map(|(i, block)| {
            let start_line = i * window.max(1) + 1;
            Chunk {
                start_line,
                end_line: start_line + block.len() - 1,
                content: block.join("\n"),
            }
        })
        .collect()
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
