use std::collections::VecDeque;

use ferry_core::{FerryError, FerryResult, Tuple};

/// One write call worth of tuples. Never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub writes: Vec<Tuple>,
    pub deletes: Vec<Tuple>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Hands out batches of at most `max_per_batch` tuples, writes first.
///
/// Once the writes run out, deletes top up the batch that held the last
/// writes, so every batch but the final one is full.
#[derive(Debug)]
pub struct BatchBuilder {
    writes: VecDeque<Tuple>,
    deletes: VecDeque<Tuple>,
    max_per_batch: usize,
}

impl BatchBuilder {
    pub fn new(writes: Vec<Tuple>, deletes: Vec<Tuple>, max_per_batch: usize) -> FerryResult<Self> {
        if max_per_batch == 0 {
            return Err(FerryError::validation(
                "max tuples per batch must be greater than zero",
            ));
        }
        Ok(Self {
            writes: writes.into(),
            deletes: deletes.into(),
            max_per_batch,
        })
    }

    pub fn remaining(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }

    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.remaining() == 0 {
            return None;
        }
        let take_writes = self.writes.len().min(self.max_per_batch);
        let writes: Vec<Tuple> = self.writes.drain(..take_writes).collect();
        let take_deletes = self.deletes.len().min(self.max_per_batch - take_writes);
        let deletes: Vec<Tuple> = self.deletes.drain(..take_deletes).collect();
        Some(Batch { writes, deletes })
    }
}

impl Iterator for BatchBuilder {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.next_batch()
    }
}

pub fn build_batches(
    writes: Vec<Tuple>,
    deletes: Vec<Tuple>,
    max_per_batch: usize,
) -> FerryResult<Vec<Batch>> {
    Ok(BatchBuilder::new(writes, deletes, max_per_batch)?.collect())
}

#[cfg(test)]
mod tests {
    use super::{BatchBuilder, build_batches};
    use ferry_core::Tuple;
    use proptest::prelude::*;

    fn tuples(prefix: &str, count: usize) -> Vec<Tuple> {
        (0..count)
            .map(|index| Tuple::new(format!("user:{prefix}{index}"), "viewer", "doc:1"))
            .collect()
    }

    #[test]
    fn deletes_fill_the_last_write_batch() {
        let batches = build_batches(tuples("w", 3), tuples("d", 3), 2).expect("batches");
        let shape: Vec<(usize, usize)> = batches
            .iter()
            .map(|batch| (batch.writes.len(), batch.deletes.len()))
            .collect();
        assert_eq!(shape, vec![(2, 0), (1, 1), (0, 2)]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(build_batches(Vec::new(), Vec::new(), 5).expect("batches").is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = BatchBuilder::new(tuples("w", 1), Vec::new(), 0).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn builder_yields_one_batch_per_call() {
        let mut builder = BatchBuilder::new(tuples("w", 5), Vec::new(), 2).expect("builder");
        assert_eq!(builder.next_batch().map(|batch| batch.len()), Some(2));
        assert_eq!(builder.remaining(), 3);
        assert_eq!(builder.next_batch().map(|batch| batch.len()), Some(2));
        assert_eq!(builder.next_batch().map(|batch| batch.len()), Some(1));
        assert!(builder.next_batch().is_none());
    }

    proptest! {
        #[test]
        fn batches_preserve_order_and_bounds(
            write_count in 0usize..40,
            delete_count in 0usize..40,
            max in 1usize..9,
        ) {
            let writes = tuples("w", write_count);
            let deletes = tuples("d", delete_count);
            let batches = build_batches(writes.clone(), deletes.clone(), max).expect("batches");

            let total = write_count + delete_count;
            prop_assert_eq!(batches.len(), total.div_ceil(max));
            for (index, batch) in batches.iter().enumerate() {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= max);
                if index + 1 < batches.len() {
                    prop_assert_eq!(batch.len(), max);
                }
            }
            let joined_writes: Vec<Tuple> =
                batches.iter().flat_map(|batch| batch.writes.clone()).collect();
            let joined_deletes: Vec<Tuple> =
                batches.iter().flat_map(|batch| batch.deletes.clone()).collect();
            prop_assert_eq!(joined_writes, writes);
            prop_assert_eq!(joined_deletes, deletes);
        }
    }
}
