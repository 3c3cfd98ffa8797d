//! SQLite-based storage implementation.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};
use ulid::Ulid;

use rag_core::{
    content_fingerprint, BlockingPool, Chunk, CorpusChunk, CorpusSource, Document, Metadata,
    RagError, Result, Stats, VectorHit, VectorIndex,
};

use crate::schema::{SCHEMA, SCHEMA_VERSION};

/// SQLite-backed corpus store.
///
/// Holds documents, their chunks and one embedding per chunk. Serves the
/// dense retrieval path through [`VectorIndex`] (exact cosine scan on the
/// blocking pool) and the sparse index rebuild through [`CorpusSource`].
pub struct SqliteStore {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,

    /// Pool for full-table vector scans.
    pool: BlockingPool,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagError::database(format!("Failed to open database: {}", e)))?;

        Self::init(conn, path)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RagError::database(format!("Failed to open in-memory database: {}", e)))?;

        Self::init(conn, Path::new(":memory:"))
    }

    /// Use a shared pool for vector scans instead of a private one.
    pub fn with_pool(mut self, pool: BlockingPool) -> Self {
        self.pool = pool;
        self
    }

    fn init(conn: Connection, path: &Path) -> Result<Self> {
        Self::configure_connection(&conn)?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| RagError::database(format!("Failed to initialize schema: {}", e)))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| RagError::database(format!("Failed to set schema version: {}", e)))?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pool: BlockingPool::default(),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA busy_timeout = 30000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RagError::database(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.conn.lock().map_err(|e| RagError::database(e.to_string()))?;
        f(&conn)
    }

    /// Store a document with its chunks and their embeddings.
    ///
    /// A document already stored under the same `source_uri` is replaced.
    /// `chunks` and `embeddings` must be aligned.
    pub async fn add_document(
        &self,
        source_uri: &str,
        raw_content: &str,
        chunks: &[CorpusChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<Document> {
        if chunks.len() != embeddings.len() {
            return Err(RagError::invalid_argument(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let doc = Document {
            id: Ulid::new(),
            source_uri: source_uri.to_string(),
            content_hash: blake3::hash(raw_content.as_bytes()).to_hex().to_string(),
            chunk_count: chunks.len() as u32,
            created_at: now_millis(),
        };

        let rows: Vec<(Chunk, String)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| -> Result<(Chunk, String)> {
                let metadata = serde_json::to_string(&c.metadata)?;
                Ok((Chunk::new(doc.id, i as u32, &c.content, c.metadata.clone()), metadata))
            })
            .collect::<Result<_>>()?;

        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| RagError::database(e.to_string()))?;

            let replaced = tx
                .execute(
                    "DELETE FROM documents WHERE source_uri = ?1",
                    params![doc.source_uri],
                )
                .map_err(|e| RagError::database(e.to_string()))?;
            if replaced > 0 {
                debug!("Replacing existing document for {}", doc.source_uri);
            }

            tx.execute(
                r#"
                INSERT INTO documents (id, source_uri, content_hash, chunk_count, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    doc.id.to_string(),
                    doc.source_uri,
                    doc.content_hash,
                    doc.chunk_count,
                    doc.created_at as i64,
                ],
            )
            .map_err(|e| RagError::database(format!("Failed to insert document: {}", e)))?;

            {
                let mut chunk_stmt = tx
                    .prepare(
                        r#"
                        INSERT INTO chunks (id, doc_id, chunk_index, content, content_hash, metadata)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        "#,
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;
                let mut vec_stmt = tx
                    .prepare(
                        "INSERT INTO embeddings (chunk_id, dimension, vector) VALUES (?1, ?2, ?3)",
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;

                for ((chunk, metadata), embedding) in rows.iter().zip(embeddings) {
                    chunk_stmt
                        .execute(params![
                            chunk.id.to_string(),
                            chunk.doc_id.to_string(),
                            chunk.chunk_index,
                            chunk.content,
                            content_fingerprint(&chunk.content).as_slice(),
                            metadata,
                        ])
                        .map_err(|e| RagError::database(format!("Failed to insert chunk: {}", e)))?;

                    vec_stmt
                        .execute(params![
                            chunk.id.to_string(),
                            embedding.len() as i64,
                            vec_to_bytes(embedding),
                        ])
                        .map_err(|e| {
                            RagError::database(format!("Failed to insert embedding: {}", e))
                        })?;
                }
            }

            tx.commit().map_err(|e| RagError::database(e.to_string()))?;

            info!(
                "Stored document {} ({} chunks) from {}",
                doc.id, doc.chunk_count, doc.source_uri
            );
            Ok(())
        })?;

        Ok(doc)
    }

    pub async fn get_document(&self, id: Ulid) -> Result<Option<Document>> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT id, source_uri, content_hash, chunk_count, created_at
                FROM documents WHERE id = ?1
                "#,
                params![id.to_string()],
                row_to_document,
            )
            .optional()
            .map_err(|e| RagError::database(e.to_string()))
        })
    }

    pub async fn get_document_by_uri(&self, uri: &str) -> Result<Option<Document>> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT id, source_uri, content_hash, chunk_count, created_at
                FROM documents WHERE source_uri = ?1
                "#,
                params![uri],
                row_to_document,
            )
            .optional()
            .map_err(|e| RagError::database(e.to_string()))
        })
    }

    /// Documents in ingestion order.
    pub async fn list_documents(&self, limit: u32, offset: u32) -> Result<Vec<Document>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, source_uri, content_hash, chunk_count, created_at
                    FROM documents ORDER BY rowid LIMIT ?1 OFFSET ?2
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let docs = stmt
                .query_map(params![limit, offset], row_to_document)
                .map_err(|e| RagError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RagError::database(e.to_string()))?;

            Ok(docs)
        })
    }

    /// Delete a document together with its chunks and embeddings.
    pub async fn delete_document(&self, id: Ulid) -> Result<()> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
                .map_err(|e| RagError::database(e.to_string()))?;

            if deleted == 0 {
                return Err(RagError::DocumentNotFound { id: id.to_string() });
            }

            debug!("Deleted document: {}", id);
            Ok(())
        })
    }

    pub async fn get_chunks_for_document(&self, doc_id: Ulid) -> Result<Vec<Chunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, doc_id, chunk_index, content, metadata
                    FROM chunks WHERE doc_id = ?1 ORDER BY chunk_index
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let chunks = stmt
                .query_map(params![doc_id.to_string()], row_to_chunk)
                .map_err(|e| RagError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RagError::database(e.to_string()))?;

            Ok(chunks)
        })
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                conn.query_row(sql, [], |row| row.get(0))
                    .map_err(|e| RagError::database(e.to_string()))
            };

            let documents = count("SELECT COUNT(*) FROM documents")?;
            let chunks = count("SELECT COUNT(*) FROM chunks")?;
            let embeddings = count("SELECT COUNT(*) FROM embeddings")?;

            let page_count: u64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .unwrap_or(0);
            let page_size: u64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .unwrap_or(4096);

            Ok(Stats {
                documents,
                chunks,
                embeddings,
                storage_bytes: page_count * page_size,
            })
        })
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.clone();
        let query = embedding.to_vec();

        self.pool
            .run(move || -> Result<Vec<VectorHit>> {
                let conn = conn.lock().map_err(|e| RagError::database(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT c.content, c.metadata, e.dimension, e.vector
                        FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
                        ORDER BY c.rowid
                        "#,
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;

                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })
                    .map_err(|e| RagError::database(e.to_string()))?;

                let mut hits = Vec::new();
                let mut skipped = 0usize;
                for row in rows {
                    let (content, metadata, dimension, blob) =
                        row.map_err(|e| RagError::database(e.to_string()))?;
                    if dimension as usize != query.len() {
                        skipped += 1;
                        continue;
                    }
                    let vector = bytes_to_vec(&blob);
                    hits.push(VectorHit {
                        content,
                        metadata: parse_metadata(&metadata),
                        distance: cosine_distance(&query, &vector),
                    });
                }

                if skipped > 0 {
                    warn!(
                        "Skipped {} embeddings with dimension != {}",
                        skipped,
                        query.len()
                    );
                }

                hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
                hits.truncate(k);
                Ok(hits)
            })
            .await?
    }
}

#[async_trait]
impl CorpusSource for SqliteStore {
    async fn snapshot(&self) -> Result<Vec<CorpusChunk>> {
        let conn = self.conn.clone();

        self.pool
            .run(move || -> Result<Vec<CorpusChunk>> {
                let conn = conn.lock().map_err(|e| RagError::database(e.to_string()))?;
                let mut stmt = conn
                    .prepare("SELECT content, metadata FROM chunks ORDER BY rowid")
                    .map_err(|e| RagError::database(e.to_string()))?;

                let chunks = stmt
                    .query_map([], |row| {
                        let metadata: String = row.get(1)?;
                        Ok(CorpusChunk {
                            content: row.get(0)?,
                            metadata: parse_metadata(&metadata),
                        })
                    })
                    .map_err(|e| RagError::database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| RagError::database(e.to_string()))?;

                Ok(chunks)
            })
            .await?
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let id_str: String = row.get(0)?;
    Ok(Document {
        id: Ulid::from_string(&id_str).unwrap_or_else(|_| Ulid::nil()),
        source_uri: row.get(1)?,
        content_hash: row.get(2)?,
        chunk_count: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let id_str: String = row.get(0)?;
    let doc_id_str: String = row.get(1)?;
    let metadata: String = row.get(4)?;

    Ok(Chunk {
        id: Ulid::from_string(&id_str).unwrap_or_else(|_| Ulid::nil()),
        doc_id: Ulid::from_string(&doc_id_str).unwrap_or_else(|_| Ulid::nil()),
        chunk_index: row.get(2)?,
        content: row.get(3)?,
        metadata: parse_metadata(&metadata),
    })
}

fn parse_metadata(text: &str) -> Metadata {
    serde_json::from_str(text).unwrap_or_default()
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert f32 vector to bytes (little-endian).
fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// `1 - cosine similarity`; zero vectors are maximally distant.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}
