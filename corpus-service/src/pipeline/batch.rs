//! Size-or-end-of-stream batching.

/// Accumulates items and hands them out in batches of `size`. Whatever is
/// left when the producer finishes comes out of [`Batcher::finish`].
#[derive(Debug)]
pub struct Batcher<T> {
    size: usize,
    pending: Vec<T>,
}

impl<T> Batcher<T> {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            pending: Vec::with_capacity(size),
        }
    }

    /// Add an item; returns a full batch once `size` items are pending
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.pending.push(item);
        if self.pending.len() >= self.size {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.size),
            ))
        } else {
            None
        }
    }

    /// End of stream: the short final batch, if any
    pub fn finish(self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_stream::wrappers::ReceiverStream;

    /// Drain a stream the way batched steps do and record the flushes
    async fn flushes<S: futures::Stream<Item = u32> + Unpin>(
        mut stream: S,
        size: usize,
    ) -> Vec<Vec<u32>> {
        let mut batcher = Batcher::new(size);
        let mut flushed = Vec::new();
        while let Some(item) = stream.next().await {
            if let Some(batch) = batcher.push(item) {
                flushed.push(batch);
            }
        }
        flushed.extend(batcher.finish());
        flushed
    }

    #[tokio::test]
    async fn test_short_stream_flushes_once_at_end() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let flushed = flushes(ReceiverStream::new(rx), 5).await;
        assert_eq!(flushed, vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn test_full_batches_then_remainder() {
        let flushed = flushes(futures::stream::iter(0..7), 3).await;
        assert_eq!(flushed, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[tokio::test]
    async fn test_empty_stream_never_flushes() {
        let flushed = flushes(futures::stream::iter(Vec::<u32>::new()), 3).await;
        assert!(flushed.is_empty());
    }

    #[test]
    fn test_zero_size_behaves_as_one() {
        let mut batcher = Batcher::new(0);
        assert_eq!(batcher.push("a"), Some(vec!["a"]));
        assert_eq!(batcher.finish(), None);
    }
}
