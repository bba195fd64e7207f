//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::error::Error;

use crate::key::Order;

/// Heap slot holding the current head of one input.
struct HeadItem<T> {
    item: T,
    idx: usize,
    order: Order,
}

impl<T: Ord> PartialEq for HeadItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeadItem<T> {}

impl<T: Ord> PartialOrd for HeadItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeadItem<T> {
    // binary heap is max-heap so the ordering is reversed to pop the first item in sort order,
    // equal items are taken from the input with the lower index first
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .apply(self.item.cmp(&other.item))
            .then_with(|| self.idx.cmp(&other.idx))
            .reverse()
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of inputs.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    items: BinaryHeap<HeadItem<T>>,
    chunks: Vec<C::IntoIter>,
    order: Order,
    initiated: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in `order` otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `order` - Sort direction of the chunks and of the merged output
    pub fn new<I>(chunks: I, order: Order) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());

        BinaryHeapMerger {
            chunks,
            items,
            order,
            initiated: false,
        }
    }

    fn push(&mut self, item: T, idx: usize) {
        self.items.push(HeadItem {
            item,
            idx,
            order: self.order,
        });
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in the merger order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            for idx in 0..self.chunks.len() {
                if let Some(item) = self.chunks[idx].next() {
                    match item {
                        Ok(item) => self.push(item, idx),
                        Err(err) => return Some(Err(err)),
                    }
                }
            }
            self.initiated = true;
        }

        let head = self.items.pop()?;
        if let Some(item) = self.chunks[head.idx].next() {
            match item {
                Ok(item) => self.push(item, head.idx),
                Err(err) => return Some(Err(err)),
            }
        }

        Some(Ok(head.item))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;
    use std::error::Error;
    use std::io::{self, ErrorKind};

    use super::BinaryHeapMerger;
    use crate::key::Order;

    #[rstest]
    #[case(
        vec![],
        Order::Asc,
        vec![],
    )]
    #[case(
        vec![
            vec![],
            vec![]
        ],
        Order::Asc,
        vec![],
    )]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        Order::Asc,
        vec![Ok(1), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)],
    )]
    #[case(
        vec![
            vec![Ok(7), Ok(5), Ok(4)],
            vec![Ok(6), Ok(1)],
            vec![],
            vec![Ok(3)],
        ],
        Order::Desc,
        vec![Ok(7), Ok(6), Ok(5), Ok(4), Ok(3), Ok(1)],
    )]
    #[case(
        vec![
            vec![Ok(2), Ok(2)],
            vec![Ok(1), Ok(2)],
        ],
        Order::Asc,
        vec![Ok(1), Ok(2), Ok(2), Ok(2)],
    )]
    #[case(
        vec![
            vec![Result::Err(io::Error::new(ErrorKind::Other, "test error"))]
        ],
        Order::Asc,
        vec![
            Result::Err(io::Error::new(ErrorKind::Other, "test error"))
        ],
    )]
    #[case(
        vec![
            vec![Ok(3), Result::Err(io::Error::new(ErrorKind::Other, "test error"))],
            vec![Ok(1), Ok(2)],
        ],
        Order::Asc,
        vec![
            Ok(1),
            Ok(2),
            Result::Err(io::Error::new(ErrorKind::Other, "test error")),
        ],
    )]
    fn test_merger(
        #[case] chunks: Vec<Vec<Result<i32, io::Error>>>,
        #[case] order: Order,
        #[case] expected_result: Vec<Result<i32, io::Error>>,
    ) {
        let merger = BinaryHeapMerger::new(chunks, order);
        let actual_result = merger.collect();
        assert!(
            compare_vectors_of_result::<_, io::Error>(&actual_result, &expected_result),
            "actual={:?}, expected={:?}",
            actual_result,
            expected_result
        );
    }

    fn compare_vectors_of_result<T: PartialEq, E: Error + 'static>(
        actual: &Vec<Result<T, E>>,
        expected: &Vec<Result<T, E>>,
    ) -> bool {
        actual.len() == expected.len()
            && actual
                .iter()
                .zip(expected)
                .all(
                    |(actual_result, expected_result)| match (actual_result, expected_result) {
                        (Ok(actual_result), Ok(expected_result)) if actual_result == expected_result => true,
                        (Err(actual_err), Err(expected_err)) => actual_err.to_string() == expected_err.to_string(),
                        _ => false,
                    },
                )
    }
}
