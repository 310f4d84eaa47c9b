//! Comparing the remote file list against the backend listing.

use std::cmp::Ordering;

/// One comparable entry: a remote-relative key plus the payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffItem {
    pub key: Vec<u8>,
    pub size: i64,
}

impl DiffItem {
    pub fn new(key: impl Into<Vec<u8>>, size: i64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

/// Two-pointer merge over two listings sorted ascending by key.
///
/// Returns indices into `remote` that need fetching (absent locally, or
/// present with a different size) and indices into `local` that no longer
/// exist remotely. Mtime never participates: the backend does not preserve
/// it.
pub fn diff(local: &[DiffItem], remote: &[DiffItem]) -> (Vec<usize>, Vec<usize>) {
    let mut new_items = Vec::new();
    let mut stale_items = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < local.len() && j < remote.len() {
        match local[i].key.cmp(&remote[j].key) {
            Ordering::Equal => {
                if local[i].size != remote[j].size {
                    new_items.push(j);
                }
                i += 1;
                j += 1;
            }
            Ordering::Greater => {
                new_items.push(j);
                j += 1;
            }
            Ordering::Less => {
                stale_items.push(i);
                i += 1;
            }
        }
    }
    new_items.extend(j..remote.len());
    stale_items.extend(i..local.len());

    (new_items, stale_items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(entries: &[(&str, i64)]) -> Vec<DiffItem> {
        let mut out: Vec<DiffItem> = entries
            .iter()
            .map(|(k, s)| DiffItem::new(k.as_bytes(), *s))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    #[test]
    fn disjoint_listings_split_into_new_and_stale() {
        let local = items(&[("a", 100), ("new", 0), ("test", 0)]);
        let remote = items(&[("a", 100)]);

        let (new_items, stale_items) = diff(&local, &remote);
        assert!(new_items.is_empty());
        assert_eq!(stale_items.len(), 2);
        assert_eq!(stale_items.iter().map(|&i| &local[i].key).collect::<Vec<_>>(),
            [b"new".as_slice(), b"test".as_slice()]);
    }

    #[test]
    fn size_change_refetches_the_key() {
        let local = items(&[("a", 100), ("b", 5)]);
        let remote = items(&[("a", 101), ("b", 5)]);

        let (new_items, stale_items) = diff(&local, &remote);
        assert_eq!(new_items, [0]);
        assert!(stale_items.is_empty());
    }

    #[test]
    fn every_index_is_classified_exactly_once() {
        let local = items(&[("a", 1), ("c", 3), ("d", 4), ("f", 6)]);
        let remote = items(&[("b", 2), ("c", 3), ("d", 9), ("e", 5)]);

        let (new_items, stale_items) = diff(&local, &remote);

        // Remote indices: matched-equal ones plus the new ones cover all.
        let matched_remote = remote.len() - new_items.len();
        assert_eq!(new_items, [0, 2, 3]);
        assert_eq!(matched_remote, 1);

        // Local indices likewise.
        assert_eq!(stale_items, [0, 3]);
        let matched_local = local.len() - stale_items.len();
        assert_eq!(matched_local, 2);
    }

    #[test]
    fn empty_sides_degenerate() {
        let some = items(&[("a", 1)]);
        assert_eq!(diff(&[], &some), (vec![0], vec![]));
        assert_eq!(diff(&some, &[]), (vec![], vec![0]));
        assert_eq!(diff(&[], &[]), (vec![], vec![]));
    }
}
