//! Chunk partitioning of the identifier list.

use super::protocol::WorkItem;
use crate::error::{DispatchError, Result};

/// Default number of items handed to one worker.
pub const DEFAULT_CHUNK_CAPACITY: usize = 5;

/// An ordered, non-empty run of work items assigned to a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    items: Vec<WorkItem>,
}

impl Chunk {
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false; chunks are never constructed empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `items` into consecutive chunks of at most `capacity` items.
///
/// Concatenating the returned chunks reproduces `items` exactly. Only the last
/// chunk may be shorter than `capacity`; an empty input yields no chunks.
pub fn partition(items: &[WorkItem], capacity: usize) -> Result<Vec<Chunk>> {
    if capacity == 0 {
        return Err(DispatchError::Config(
            "chunk capacity must be a positive integer".to_string(),
        ));
    }

    Ok(items
        .chunks(capacity)
        .map(|slice| Chunk {
            items: slice.to_vec(),
        })
        .collect())
}

/// Shape of a partition, used for reporting before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub capacity: usize,
    pub total_items: usize,
    pub chunk_sizes: Vec<usize>,
}

impl ChunkPlan {
    pub fn of(chunks: &[Chunk], capacity: usize) -> Self {
        let chunk_sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        Self {
            capacity,
            total_items: chunk_sizes.iter().sum(),
            chunk_sizes,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_sizes.len()
    }

    /// Size of the trailing chunk when it is smaller than the capacity.
    pub fn remainder(&self) -> Option<usize> {
        self.chunk_sizes
            .last()
            .copied()
            .filter(|&last| last < self.capacity)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// ceil(L/C) chunks, none larger than C, none empty.
        #[test]
        fn chunk_count_and_sizes(len in 0usize..200, capacity in 1usize..20) {
            let items: Vec<WorkItem> = (0..len).map(|i| WorkItem::new(i.to_string())).collect();
            let chunks = partition(&items, capacity).unwrap();

            prop_assert_eq!(chunks.len(), len.div_ceil(capacity));
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= capacity));
        }

        /// Concatenating the chunks in order reproduces the input.
        #[test]
        fn concatenation_reproduces_input(
            ids in prop::collection::vec("[a-z0-9]{1,8}", 0..100),
            capacity in 1usize..12,
        ) {
            let items: Vec<WorkItem> = ids.into_iter().map(WorkItem::from).collect();
            let chunks = partition(&items, capacity).unwrap();
            let rejoined: Vec<WorkItem> = chunks.iter().flat_map(|c| c.items().to_vec()).collect();
            prop_assert_eq!(rejoined, items);
        }
    }
}
