// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::index::BlobIndex;
use crate::config::KeyComparator;
use crate::value::{UserData, UserKey};

/// One record scanned out of an input blob file
pub type BlobTuple = (UserKey, BlobIndex, UserData);

type BoxedBlobIterator = Box<dyn Iterator<Item = crate::Result<BlobTuple>>>;

/// Merges the input blob files of a GC job by user key
///
/// This iterator can iterate through N blob files simultaneously in
/// comparator order by always advancing the input holding the lowest head.
/// Duplicate keys across inputs are all emitted, ordered by input
/// position; the caller suppresses the stale versions.
///
/// The sequence is finite and forward-only. The first read error is
/// yielded once, then the iterator fuses; the job aborts without touching
/// the LSM.
pub struct BlobFileMergeIterator {
    inputs: Vec<BoxedBlobIterator>,
    heads: Vec<Option<BlobTuple>>,
    comparator: KeyComparator,
    primed: bool,
    errored: bool,

    /// Input whose head was taken by the previous call; refilled lazily so
    /// a failing refill never swallows an already-read tuple
    pending_refill: Option<usize>,
}

impl BlobFileMergeIterator {
    /// Initializes a new merge iterator
    #[must_use]
    pub fn new(inputs: Vec<BoxedBlobIterator>, comparator: KeyComparator) -> Self {
        let heads = inputs.iter().map(|_| None).collect();

        Self {
            inputs,
            heads,
            comparator,
            primed: false,
            errored: false,
            pending_refill: None,
        }
    }

    /// Pulls the next tuple out of input `idx` into its head slot
    fn advance(&mut self, idx: usize) -> crate::Result<()> {
        self.heads[idx] = match self.inputs[idx].next() {
            Some(Ok(tuple)) => Some(tuple),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        Ok(())
    }

    /// Index of the input holding the lowest head, ties going to the
    /// earliest input
    fn min_head(&self) -> Option<usize> {
        let mut min: Option<usize> = None;

        for (idx, head) in self.heads.iter().enumerate() {
            let Some((key, _, _)) = head else { continue };

            match min {
                None => min = Some(idx),
                Some(min_idx) => {
                    let (min_key, _, _) = self.heads[min_idx]
                        .as_ref()
                        .expect("head should be occupied");

                    if (self.comparator)(key, min_key) == std::cmp::Ordering::Less {
                        min = Some(idx);
                    }
                }
            }
        }

        min
    }
}

impl Iterator for BlobFileMergeIterator {
    type Item = crate::Result<BlobTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }

        if self.primed {
            if let Some(idx) = self.pending_refill.take() {
                if let Err(e) = self.advance(idx) {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        } else {
            self.primed = true;

            for idx in 0..self.inputs.len() {
                if let Err(e) = self.advance(idx) {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        }

        let idx = self.min_head()?;
        let tuple = self.heads[idx].take().expect("head should be occupied");
        self.pending_refill = Some(idx);

        Some(Ok(tuple))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::index::BlobHandle;
    use std::sync::Arc;
    use test_log::test;

    fn tuple(key: &[u8], file_number: u64, order: u64) -> BlobTuple {
        (
            key.into(),
            BlobIndex {
                file_number,
                blob_handle: BlobHandle {
                    offset: order * 10,
                    size: 10,
                    order,
                },
            },
            (*b"v").into(),
        )
    }

    fn boxed(tuples: Vec<BlobTuple>) -> BoxedBlobIterator {
        Box::new(tuples.into_iter().map(Ok))
    }

    fn bytewise() -> KeyComparator {
        Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
    }

    #[test]
    fn test_merge_order() -> crate::Result<()> {
        let input0 = boxed(vec![tuple(b"a", 1, 0), tuple(b"d", 1, 1)]);
        let input1 = boxed(vec![tuple(b"b", 2, 0), tuple(b"c", 2, 1)]);

        let iter = BlobFileMergeIterator::new(vec![input0, input1], bytewise());
        let items = iter.collect::<crate::Result<Vec<_>>>()?;

        let keys: Vec<&[u8]> = items.iter().map(|(k, _, _)| &**k).collect();
        assert_eq!(vec![b"a".as_slice(), b"b", b"c", b"d"], keys);

        Ok(())
    }

    #[test]
    fn test_duplicates_are_emitted_stably() -> crate::Result<()> {
        let input0 = boxed(vec![tuple(b"k", 1, 0)]);
        let input1 = boxed(vec![tuple(b"k", 2, 0)]);

        let iter = BlobFileMergeIterator::new(vec![input0, input1], bytewise());
        let items = iter.collect::<crate::Result<Vec<_>>>()?;

        // Both versions come out, earliest input first
        assert_eq!(2, items.len());
        assert_eq!(1, items[0].1.file_number);
        assert_eq!(2, items[1].1.file_number);

        Ok(())
    }

    #[test]
    fn test_custom_comparator() -> crate::Result<()> {
        let reverse: KeyComparator = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));

        let input0 = boxed(vec![tuple(b"c", 1, 0), tuple(b"a", 1, 1)]);
        let input1 = boxed(vec![tuple(b"b", 2, 0)]);

        let iter = BlobFileMergeIterator::new(vec![input0, input1], reverse);
        let items = iter.collect::<crate::Result<Vec<_>>>()?;

        let keys: Vec<&[u8]> = items.iter().map(|(k, _, _)| &**k).collect();
        assert_eq!(vec![b"c".as_slice(), b"b", b"a"], keys);

        Ok(())
    }

    #[test]
    fn test_error_fuses_iterator() {
        let failing: BoxedBlobIterator = Box::new(
            vec![
                Ok(tuple(b"a", 1, 0)),
                Err(crate::Error::Aborted("broken input")),
            ]
            .into_iter(),
        );
        let input1 = boxed(vec![tuple(b"b", 2, 0)]);

        let mut iter = BlobFileMergeIterator::new(vec![failing, input1], bytewise());

        assert!(matches!(iter.next(), Some(Ok(_))));
        assert!(matches!(iter.next(), Some(Err(_))));
        assert!(iter.next().is_none());
    }
}
