//! Background batch sampling to overlap neighborhood construction with
//! computation.
//!
//! A worker thread drains a [`BatchDataSource`] into a bounded channel while
//! the caller computes on the previous batch. Only sources with a fixed budget
//! can be prefetched: the budget is frozen once the source moves to the
//! worker.

use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;

use super::block::Batch;
use super::sampler::NeighborSampler;
use super::source::BatchDataSource;

type Message = crate::Result<Option<Batch>>;

/// Iterator over batches sampled on a background thread
pub struct BatchPrefetcher {
    rx: Option<Receiver<Message>>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl BatchPrefetcher {
    /// Move `source` to a worker thread that keeps up to `depth` batches
    /// ready.
    pub fn spawn<S>(mut source: BatchDataSource<S>, depth: usize) -> Self
    where
        S: NeighborSampler + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<Message>(depth.max(1));

        let handle = std::thread::spawn(move || loop {
            let message = source.next_batch();
            let done = !matches!(message, Ok(Some(_)));
            // Receiver gone means the consumer stopped early
            if tx.send(message).is_err() || done {
                break;
            }
        });

        Self {
            rx: Some(rx),
            handle: Some(handle),
            finished: false,
        }
    }
}

impl Iterator for BatchPrefetcher {
    type Item = crate::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let received = self.rx.as_ref().map(Receiver::recv);
        match received {
            Some(Ok(Ok(Some(batch)))) => Some(Ok(batch)),
            Some(Ok(Ok(None))) => {
                self.finished = true;
                None
            }
            Some(Ok(Err(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            _ => {
                self.finished = true;
                Some(Err(crate::LayerwiseError::SamplingError(
                    "prefetch worker exited before the end of the batches".to_string(),
                )))
            }
        }
    }
}

impl Drop for BatchPrefetcher {
    fn drop(&mut self) {
        // Disconnect first so a worker blocked on a full channel wakes up
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Prefetch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{CsrGraph, FullNeighborSampler};
    use std::sync::Arc;

    fn source(n: u32, batch: usize) -> BatchDataSource {
        let graph = Arc::new(CsrGraph::random(n as usize, 2, 3).unwrap());
        BatchDataSource::new(graph, FullNeighborSampler::default(), 0..n)
            .with_budget(batch, usize::MAX)
    }

    #[test]
    fn test_prefetch_yields_all_batches() {
        let batches: Vec<Batch> = BatchPrefetcher::spawn(source(10, 3), 2)
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 4);
        let ids: Vec<u32> = batches.into_iter().flat_map(|b| b.output_nodes).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_early_drop_joins_worker() {
        let mut prefetcher = BatchPrefetcher::spawn(source(100, 1), 1);
        assert!(prefetcher.next().unwrap().is_ok());
        drop(prefetcher);
    }

    #[test]
    fn test_sampling_error_is_forwarded() {
        let graph = Arc::new(CsrGraph::from_edges(2, &[]).unwrap());
        let source = BatchDataSource::new(graph, FullNeighborSampler::default(), vec![0, 7]);
        let mut prefetcher = BatchPrefetcher::spawn(source, 2);
        assert!(prefetcher.next().unwrap().is_ok());
        assert!(prefetcher.next().unwrap().is_err());
        assert!(prefetcher.next().is_none());
    }
}
