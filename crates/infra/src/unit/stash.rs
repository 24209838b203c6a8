use std::collections::VecDeque;

/// FIFO buffer for messages a unit cannot handle in its current phase.
///
/// Drained in arrival order on the next phase transition. With a capacity,
/// `push` hands the message back instead of growing past it.
#[derive(Debug)]
pub struct Stash<M> {
    queue: VecDeque<M>,
    capacity: Option<usize>,
}

impl<M> Stash<M> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, message: M) -> Result<(), M> {
        if self.capacity.is_some_and(|cap| self.queue.len() >= cap) {
            return Err(message);
        }
        self.queue.push_back(message);
        Ok(())
    }

    /// Take everything stashed so far, oldest first.
    pub fn take_all(&mut self) -> VecDeque<M> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
