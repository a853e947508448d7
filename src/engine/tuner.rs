//! Feedback controller sizing adaptive batches from observed memory.

/// Batch size limits handed to the data source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_node: usize,
    pub max_edge: usize,
}

impl Budget {
    pub fn new(max_node: usize, max_edge: usize) -> Self {
        Self { max_node, max_edge }
    }

    fn map(self, f: impl Fn(usize) -> usize) -> Self {
        Self::new(f(self.max_node), f(self.max_edge))
    }
}

/// What one successful batch cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSample {
    pub nodes: usize,
    pub edges: usize,
    pub peak_bytes: usize,
}

/// Grows the budget while batches stay under the memory target and halves
/// it on exhaustion.
///
/// Every size that failed becomes a ceiling: later proposals stay strictly
/// below it, so a failing size is never tried twice.
#[derive(Debug, Clone)]
pub struct AutoTuner {
    budget: Budget,
    ceiling: Option<Budget>,
    target_bytes: usize,
    history: Vec<BatchSample>,
    failures: usize,
}

impl AutoTuner {
    pub fn new(initial: Budget, target_bytes: usize) -> Self {
        Self {
            budget: initial.map(|v| v.max(1)),
            ceiling: None,
            target_bytes,
            history: Vec::new(),
            failures: 0,
        }
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn ceiling(&self) -> Option<Budget> {
        self.ceiling
    }

    pub fn history(&self) -> &[BatchSample] {
        &self.history
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Next budget after a batch that fit
    pub fn propose_next(&mut self, sample: BatchSample) -> Budget {
        self.history.push(sample);
        let ratio = self.target_bytes as f64 / sample.peak_bytes.max(1) as f64;

        let next = self.budget.map(|current| {
            let current_f = current as f64;
            let proposed = if ratio >= 2.0 {
                current_f * 2.0
            } else if ratio > 1.0 {
                // Half of the remaining headroom, at least one more
                (current_f + (current_f * (ratio - 1.0) / 2.0).max(1.0)).max(current_f)
            } else {
                current_f * ratio
            };
            to_count(proposed)
        });

        self.budget = self.clamp(next);
        tracing::debug!(
            "Batch of {} nodes / {} edges peaked at {} bytes (ratio {:.2}); next budget {:?}",
            sample.nodes,
            sample.edges,
            sample.peak_bytes,
            ratio,
            self.budget
        );
        self.budget
    }

    /// Record a failed batch of size `failed` and return a smaller budget.
    ///
    /// A single node that does not fit cannot be split further, so that
    /// failure is returned as `ResourceExhausted`.
    pub fn shrink_after_failure(&mut self, failed: Budget) -> crate::Result<Budget> {
        self.failures += 1;
        if failed.max_node <= 1 {
            return Err(crate::LayerwiseError::ResourceExhausted(format!(
                "a single node with {} edges exceeds the memory budget",
                failed.max_edge
            )));
        }

        self.ceiling = Some(match self.ceiling {
            Some(c) => Budget::new(c.max_node.min(failed.max_node), c.max_edge.min(failed.max_edge)),
            None => failed,
        });
        self.budget = self.clamp(failed.map(|v| v / 2));
        tracing::debug!("Shrinking budget to {:?} after failure", self.budget);
        Ok(self.budget)
    }

    fn clamp(&self, budget: Budget) -> Budget {
        let budget = match self.ceiling {
            Some(c) => Budget::new(
                budget.max_node.min(c.max_node.saturating_sub(1)),
                budget.max_edge.min(c.max_edge.saturating_sub(1)),
            ),
            None => budget,
        };
        budget.map(|v| v.max(1))
    }
}

fn to_count(value: f64) -> usize {
    if value >= usize::MAX as f64 {
        usize::MAX
    } else {
        (value as usize).max(1)
    }
}
