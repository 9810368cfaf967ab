//! Queue priority with starvation protection.

/// Picks the order in which a worker polls its queues.
///
/// Queues are listed highest priority first. The top queue is always tried
/// first until it has supplied `starvation_limit` deliveries in a row; the next
/// poll then starts with the lower queues, rotating which one goes first.
#[derive(Debug, Clone)]
pub struct QueueSelector {
    queues: Vec<String>,
    starvation_limit: u32,
    consecutive_top: u32,
    cursor: usize,
}

impl QueueSelector {
    pub fn new(queues: Vec<String>, starvation_limit: u32) -> Self {
        Self {
            queues,
            starvation_limit,
            consecutive_top: 0,
            cursor: 0,
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Order for the next poll.
    pub fn order(&mut self) -> Vec<String> {
        let lower = self.queues.len().saturating_sub(1);
        let starving = lower > 0 && self.starvation_limit > 0 && self.consecutive_top >= self.starvation_limit;
        if !starving {
            return self.queues.clone();
        }

        let start = self.cursor % lower;
        self.cursor = (start + 1) % lower;

        let mut order: Vec<String> = (0..lower)
            .map(|i| self.queues[1 + (start + i) % lower].clone())
            .collect();
        order.push(self.queues[0].clone());
        order
    }

    /// Note which queue the last delivery came from.
    pub fn record(&mut self, queue: &str) {
        if self.queues.first().is_some_and(|top| top == queue) {
            self.consecutive_top = self.consecutive_top.saturating_add(1);
        } else {
            self.consecutive_top = 0;
        }
    }
}
