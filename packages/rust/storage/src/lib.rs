//! libSQL persistence for a research session.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the ingested
//! documents, their chunks with embedding vectors, and index metadata such as
//! the identity of the embedder that produced the vectors. The in-memory
//! vector index is rebuilt from [`Storage::load_chunks`] on open.
//!
//! A document and its chunks are always written and deleted together inside
//! one transaction.

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Value, params};
use tracing::{debug, info};

use tramit_shared::{
    ChunkMeta, ChunkRecord, DocType, Document, DocumentId, DocumentSummary, Result, TramitError,
};

/// `index_meta` key recording which embedder produced the stored vectors.
const EMBEDDER_KEY: &str = "embedder_id";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TramitError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    TramitError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn schema_version(&self) -> u32 {
        match self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Index metadata
    // -----------------------------------------------------------------------

    /// Identity of the embedder recorded when the index was created.
    pub async fn embedder_id(&self) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![EMBEDDER_KEY],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    pub async fn set_embedder_id(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![EMBEDDER_KEY, id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Persist a document with all of its chunk records in one transaction.
    pub async fn insert_document(&self, doc: &Document, chunks: &[ChunkRecord]) -> Result<()> {
        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| TramitError::Storage(format!("failed to encode metadata: {e}")))?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let written = async {
            tx.execute(
                "INSERT INTO documents (id, title, doc_type, content, metadata_json, created_at, source_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    doc.id.to_string(),
                    doc.title.as_str(),
                    doc.doc_type.as_str(),
                    doc.content.as_str(),
                    metadata_json,
                    doc.timestamp.to_rfc3339(),
                    doc.source_url.as_deref(),
                ],
            )
            .await?;

            for chunk in chunks {
                tx.execute(
                    "INSERT INTO chunks (document_id, chunk_index, text, embedding)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        doc.id.to_string(),
                        chunk.meta.chunk_index as i64,
                        chunk.text.as_str(),
                        Value::Blob(encode_embedding(&chunk.embedding)),
                    ],
                )
                .await?;
            }
            Ok::<_, libsql::Error>(())
        }
        .await;

        if let Err(e) = written {
            let _ = tx.rollback().await;
            return Err(storage_err(e));
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(doc_id = %doc.id, chunks = chunks.len(), "document persisted");
        Ok(())
    }

    /// Delete a document and its chunks. Returns `false` if it did not exist.
    pub async fn delete_document(&self, id: &DocumentId) -> Result<bool> {
        let id = id.to_string();
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let deleted = async {
            tx.execute(
                "DELETE FROM chunks WHERE document_id = ?1",
                params![id.as_str()],
            )
            .await?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![id.as_str()])
                .await
        }
        .await;

        match deleted {
            Ok(rows) => {
                tx.commit().await.map_err(storage_err)?;
                Ok(rows > 0)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(storage_err(e))
            }
        }
    }

    /// Summaries of every stored document, oldest first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT d.id, d.title, d.doc_type, d.created_at, d.source_url,
                        (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id)
                 FROM documents d
                 ORDER BY d.created_at, d.id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(DocumentSummary {
                id: parse_id(&row.get::<String>(0).map_err(storage_err)?)?,
                title: row.get::<String>(1).map_err(storage_err)?,
                doc_type: parse_doc_type(&row.get::<String>(2).map_err(storage_err)?)?,
                timestamp: parse_timestamp(&row.get::<String>(3).map_err(storage_err)?)?,
                source_url: optional_text(&row, 4)?,
                chunk_count: row.get::<i64>(5).map_err(storage_err)? as usize,
            });
        }
        Ok(results)
    }

    /// Load a full document, with its chunk texts in index order.
    pub async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>> {
        let key = id.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT title, doc_type, content, metadata_json, created_at, source_url
                 FROM documents WHERE id = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };

        let metadata_json: String = row.get(3).map_err(storage_err)?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
            .map_err(|e| TramitError::Storage(format!("invalid metadata for {id}: {e}")))?;

        let mut doc = Document {
            id: *id,
            title: row.get::<String>(0).map_err(storage_err)?,
            doc_type: parse_doc_type(&row.get::<String>(1).map_err(storage_err)?)?,
            content: row.get::<String>(2).map_err(storage_err)?,
            chunks: Vec::new(),
            metadata,
            timestamp: parse_timestamp(&row.get::<String>(4).map_err(storage_err)?)?,
            source_url: optional_text(&row, 5)?,
        };

        let mut chunk_rows = self
            .conn
            .query(
                "SELECT text FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
                params![key.as_str()],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = chunk_rows.next().await.map_err(storage_err)? {
            doc.chunks.push(row.get::<String>(0).map_err(storage_err)?);
        }

        Ok(Some(doc))
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Every persisted chunk record, grouped by document in insertion order.
    pub async fn load_chunks(&self) -> Result<Vec<ChunkRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.document_id, d.title, d.doc_type, d.source_url,
                        c.chunk_index, c.text, c.embedding
                 FROM chunks c
                 JOIN documents d ON d.id = c.document_id
                 ORDER BY d.created_at, d.id, c.chunk_index",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let blob: Vec<u8> = row.get(6).map_err(storage_err)?;
            records.push(ChunkRecord {
                meta: ChunkMeta {
                    doc_id: parse_id(&row.get::<String>(0).map_err(storage_err)?)?,
                    doc_title: row.get::<String>(1).map_err(storage_err)?,
                    doc_type: parse_doc_type(&row.get::<String>(2).map_err(storage_err)?)?,
                    source_url: optional_text(&row, 3)?,
                    chunk_index: row.get::<i64>(4).map_err(storage_err)? as usize,
                },
                text: row.get::<String>(5).map_err(storage_err)?,
                embedding: decode_embedding(&blob)?,
            });
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_err(e: libsql::Error) -> TramitError {
    TramitError::Storage(e.to_string())
}

/// A nullable TEXT column. Any stored type other than NULL or text is corrupt.
fn optional_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(TramitError::Storage(format!(
            "column {idx} holds {other:?} where text or NULL was expected"
        ))),
    }
}

fn parse_id(s: &str) -> Result<DocumentId> {
    s.parse()
        .map_err(|e| TramitError::Storage(format!("invalid document id '{s}': {e}")))
}

fn parse_doc_type(s: &str) -> Result<DocType> {
    s.parse()
        .map_err(|e| TramitError::Storage(format!("invalid document type: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TramitError::Storage(format!("invalid date '{s}': {e}")))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(TramitError::Storage(format!(
            "corrupt embedding blob of {} bytes",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tramit_test_{}.db", Uuid::now_v7()))
    }

    async fn test_storage() -> Storage {
        Storage::open(&temp_path()).await.expect("open test db")
    }

    fn document(title: &str, chunks: &[&str]) -> (Document, Vec<ChunkRecord>) {
        let doc = Document {
            id: DocumentId::new(),
            title: title.into(),
            doc_type: DocType::Web,
            content: chunks.join(" "),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            metadata: BTreeMap::from([("lang".to_string(), "ca".to_string())]),
            timestamp: Utc::now(),
            source_url: Some(format!("https://web.gencat.cat/ca/{title}")),
        };
        let records = chunks
            .iter()
            .enumerate()
            .map(|(i, text)| ChunkRecord {
                meta: ChunkMeta {
                    doc_id: doc.id,
                    doc_title: doc.title.clone(),
                    doc_type: doc.doc_type,
                    chunk_index: i,
                    source_url: doc.source_url.clone(),
                },
                text: text.to_string(),
                embedding: vec![i as f32, -0.5, 1.25],
            })
            .collect();
        (doc, records)
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let path = temp_path();
        let first = Storage::open(&path).await.expect("first open");
        drop(first);
        let second = Storage::open(&path).await.expect("second open");
        assert_eq!(second.schema_version().await, 1);
    }

    #[tokio::test]
    async fn embedder_id_roundtrip() {
        let storage = test_storage().await;
        assert_eq!(storage.embedder_id().await.unwrap(), None);

        storage.set_embedder_id("hashing-sha256:384").await.unwrap();
        storage.set_embedder_id("hashing-sha256:512").await.unwrap();
        assert_eq!(
            storage.embedder_id().await.unwrap().as_deref(),
            Some("hashing-sha256:512")
        );
    }

    #[tokio::test]
    async fn insert_list_and_get() {
        let storage = test_storage().await;
        let (doc, chunks) = document("beca", &["primer tros", "segon tros"]);
        storage.insert_document(&doc, &chunks).await.unwrap();

        let listed = storage.list_documents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, doc.id);
        assert_eq!(listed[0].chunk_count, 2);
        assert_eq!(listed[0].doc_type, DocType::Web);

        let loaded = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "beca");
        assert_eq!(loaded.chunks, vec!["primer tros", "segon tros"]);
        assert_eq!(loaded.metadata.get("lang").map(String::as_str), Some("ca"));
        assert_eq!(loaded.source_url, doc.source_url);
        assert_eq!(loaded.timestamp.timestamp(), doc.timestamp.timestamp());
    }

    #[tokio::test]
    async fn missing_source_url_reads_as_none() {
        let storage = test_storage().await;
        let (mut doc, mut chunks) = document("notes", &["text pujat"]);
        doc.source_url = None;
        chunks[0].meta.source_url = None;
        storage.insert_document(&doc, &chunks).await.unwrap();

        assert_eq!(storage.list_documents().await.unwrap()[0].source_url, None);
        assert_eq!(storage.get_document(&doc.id).await.unwrap().unwrap().source_url, None);
        assert_eq!(storage.load_chunks().await.unwrap()[0].meta.source_url, None);
    }

    #[tokio::test]
    async fn corrupt_source_url_is_a_storage_error() {
        let storage = test_storage().await;
        let (doc, chunks) = document("beca", &["tros"]);
        storage.insert_document(&doc, &chunks).await.unwrap();
        storage
            .conn
            .execute("UPDATE documents SET source_url = X'00FF'", params![])
            .await
            .unwrap();

        let err = storage.list_documents().await.unwrap_err();
        assert!(matches!(err, TramitError::Storage(_)));
        assert!(matches!(
            storage.get_document(&doc.id).await,
            Err(TramitError::Storage(_))
        ));
        assert!(matches!(storage.load_chunks().await, Err(TramitError::Storage(_))));
    }

    #[tokio::test]
    async fn chunks_reload_with_embeddings() {
        let path = temp_path();
        let (doc, chunks) = document("padro", &["a", "b", "c"]);
        {
            let storage = Storage::open(&path).await.unwrap();
            storage.insert_document(&doc, &chunks).await.unwrap();
        }

        let storage = Storage::open(&path).await.unwrap();
        let loaded = storage.load_chunks().await.unwrap();
        assert_eq!(loaded, chunks);
    }

    #[tokio::test]
    async fn delete_removes_document_and_chunks() {
        let storage = test_storage().await;
        let (keep, keep_chunks) = document("keep", &["x"]);
        let (gone, gone_chunks) = document("gone", &["y", "z"]);
        storage.insert_document(&keep, &keep_chunks).await.unwrap();
        storage.insert_document(&gone, &gone_chunks).await.unwrap();

        assert!(storage.delete_document(&gone.id).await.unwrap());
        assert!(!storage.delete_document(&gone.id).await.unwrap());

        assert!(storage.get_document(&gone.id).await.unwrap().is_none());
        let remaining = storage.load_chunks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].meta.doc_id, keep.id);
    }

    #[tokio::test]
    async fn failed_insert_leaves_nothing_behind() {
        let storage = test_storage().await;
        let (doc, mut chunks) = document("dup", &["a", "b"]);
        chunks[1].meta.chunk_index = 0;

        assert!(storage.insert_document(&doc, &chunks).await.is_err());
        assert!(storage.list_documents().await.unwrap().is_empty());
        assert!(storage.load_chunks().await.unwrap().is_empty());
    }

    #[test]
    fn corrupt_embedding_blob() {
        assert!(decode_embedding(&[0, 1, 2]).is_err());
        assert_eq!(
            decode_embedding(&encode_embedding(&[1.0, -2.5])).unwrap(),
            vec![1.0, -2.5]
        );
    }
}
