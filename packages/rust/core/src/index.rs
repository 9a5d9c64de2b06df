//! Flat in-memory vector index.
//!
//! Exact nearest-neighbour search by squared L2 distance over every chunk
//! record. Lower scores are more relevant.

use std::collections::HashSet;

use tramit_shared::{ChunkRecord, DocumentId, ScoredChunk};

#[derive(Debug, Default)]
pub struct VectorIndex {
    records: Vec<ChunkRecord>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ChunkRecord>) -> Self {
        Self { records }
    }

    pub fn append(&mut self, records: impl IntoIterator<Item = ChunkRecord>) {
        self.records.extend(records);
    }

    /// Drop every record of `doc_id`. Returns how many were removed.
    pub fn remove_document(&mut self, doc_id: &DocumentId) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.meta.doc_id != *doc_id);
        before - self.records.len()
    }

    /// The `k` closest records to `query`, ascending by distance. Records whose
    /// distance exceeds `max_distance` are left out.
    pub fn search(&self, query: &[f32], k: usize, max_distance: Option<f32>) -> Vec<ScoredChunk> {
        if k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, squared_l2(query, &r.embedding)))
            .filter(|(_, d)| max_distance.is_none_or(|max| *d <= max))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| {
                let record = &self.records[i];
                ScoredChunk {
                    meta: record.meta.clone(),
                    text: record.text.clone(),
                    score,
                }
            })
            .collect()
    }

    pub fn chunk_count(&self, doc_id: &DocumentId) -> usize {
        self.records.iter().filter(|r| r.meta.doc_id == *doc_id).count()
    }

    pub fn document_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.meta.doc_id)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn contains_source(&self, url: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.meta.source_url.as_deref() == Some(url))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Squared Euclidean distance. Missing trailing dimensions count as zero.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tramit_shared::{ChunkMeta, DocType};

    fn record(doc_id: DocumentId, index: usize, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            meta: ChunkMeta {
                doc_id,
                doc_title: "doc".into(),
                doc_type: DocType::Web,
                chunk_index: index,
                source_url: Some(format!("https://x.cat/{doc_id}")),
            },
            text: format!("chunk {index}"),
            embedding,
        }
    }

    #[test]
    fn empty_index_finds_nothing() {
        assert!(VectorIndex::new().search(&[1.0, 0.0], 3, None).is_empty());
    }

    #[test]
    fn results_sorted_by_distance() {
        let doc = DocumentId::new();
        let index = VectorIndex::from_records(vec![
            record(doc, 0, vec![0.0, 1.0]),
            record(doc, 1, vec![1.0, 0.0]),
            record(doc, 2, vec![0.7, 0.7]),
        ]);

        let hits = index.search(&[1.0, 0.0], 2, None);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].meta.chunk_index, 1);
        assert_eq!(hits[0].score, 0.0);
        assert_eq!(hits[1].meta.chunk_index, 2);
    }

    #[test]
    fn threshold_filters_distant_chunks() {
        let doc = DocumentId::new();
        let index = VectorIndex::from_records(vec![
            record(doc, 0, vec![1.0, 0.0]),
            record(doc, 1, vec![-1.0, 0.0]),
        ]);

        let hits = index.search(&[1.0, 0.0], 5, Some(1.5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.chunk_index, 0);
    }

    #[test]
    fn remove_document_leaves_others() {
        let a = DocumentId::new();
        let b = DocumentId::new();
        let mut index = VectorIndex::new();
        index.append(vec![record(a, 0, vec![1.0]), record(a, 1, vec![0.5])]);
        index.append(vec![record(b, 0, vec![0.9])]);
        assert_eq!(index.document_count(), 2);

        assert_eq!(index.remove_document(&a), 2);
        assert_eq!(index.remove_document(&a), 0);
        assert_eq!(index.chunk_count(&a), 0);
        assert_eq!(index.chunk_count(&b), 1);
        assert!(
            index
                .search(&[1.0], 10, None)
                .iter()
                .all(|hit| hit.meta.doc_id == b)
        );
    }
}
