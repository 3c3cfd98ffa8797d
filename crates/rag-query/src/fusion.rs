//! Weighted fusion and content deduplication of retrieval results.

use std::cmp::Ordering;
use std::collections::HashMap;

use rag_core::RetrievedItem;

/// Collapse items with identical content, keeping the higher score.
///
/// Survivors keep the position of the first occurrence. On equal scores
/// the earlier item wins.
pub fn dedup_by_content(items: Vec<RetrievedItem>) -> Vec<RetrievedItem> {
    let mut positions: HashMap<[u8; 32], usize> = HashMap::with_capacity(items.len());
    let mut survivors: Vec<RetrievedItem> = Vec::with_capacity(items.len());

    for item in items {
        let fingerprint = item.fingerprint();
        match positions.get(&fingerprint) {
            Some(&pos) => {
                if item.score > survivors[pos].score {
                    survivors[pos] = item;
                }
            }
            None => {
                positions.insert(fingerprint, survivors.len());
                survivors.push(item);
            }
        }
    }

    survivors
}

/// Stable sort by score, highest first.
pub fn sort_by_score(items: &mut [RetrievedItem]) {
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Merge already-scaled dense and sparse results into one ranking.
///
/// Each path's scores are expected to carry their weight (`alpha` for
/// dense, `1 - alpha` for sparse). Duplicates keep the higher score; the
/// result is sorted descending and truncated to `n`.
pub fn fuse_and_dedup(
    dense: Vec<RetrievedItem>,
    sparse: Vec<RetrievedItem>,
    n: usize,
) -> Vec<RetrievedItem> {
    let mut merged = dense;
    merged.extend(sparse);

    let mut fused = dedup_by_content(merged);
    sort_by_score(&mut fused);
    fused.truncate(n);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_core::{Metadata, Origin};

    fn item(content: &str, score: f32, origin: Origin) -> RetrievedItem {
        RetrievedItem::new(content, score, Metadata::new(), origin)
    }

    #[test]
    fn test_dedup_keeps_higher_score() {
        let items = vec![
            item("a", 0.2, Origin::Dense),
            item("b", 0.5, Origin::Dense),
            item("a", 0.4, Origin::Sparse),
        ];
        let deduped = dedup_by_content(items);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].content, "a");
        assert_eq!(deduped[0].score, 0.4);
        assert_eq!(deduped[0].origin, Origin::Sparse);
    }

    #[test]
    fn test_dedup_tie_keeps_first() {
        let items = vec![item("a", 0.3, Origin::Dense), item("a", 0.3, Origin::Sparse)];
        let deduped = dedup_by_content(items);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].origin, Origin::Dense);
    }

    #[test]
    fn test_dedup_uses_full_content() {
        let prefix = "x".repeat(100);
        let items = vec![
            item(&format!("{}1", prefix), 0.3, Origin::Dense),
            item(&format!("{}2", prefix), 0.3, Origin::Dense),
        ];
        assert_eq!(dedup_by_content(items).len(), 2);
    }

    #[test]
    fn test_fuse_sorts_and_truncates() {
        let dense = vec![item("a", 0.5, Origin::Dense), item("b", 0.1, Origin::Dense)];
        let sparse = vec![item("c", 0.3, Origin::Sparse), item("b", 0.2, Origin::Sparse)];

        let fused = fuse_and_dedup(dense, sparse, 2);
        let contents: Vec<&str> = fused.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "c"]);

        let fused = fuse_and_dedup(
            vec![item("a", 0.5, Origin::Dense), item("b", 0.1, Origin::Dense)],
            vec![item("c", 0.3, Origin::Sparse), item("b", 0.2, Origin::Sparse)],
            10,
        );
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[2].content, "b");
        assert_eq!(fused[2].score, 0.2);
    }

    #[test]
    fn test_fuse_empty_inputs() {
        assert!(fuse_and_dedup(Vec::new(), Vec::new(), 5).is_empty());
    }
}
