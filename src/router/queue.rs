//! Outstanding commands waiting for their endpoint's next visit.

use std::collections::VecDeque;

use crate::types::Command;

/// Commands in submission order, keyed by target uuid.
///
/// Entries are removed when they are handed to an endpoint
/// ([`CommandQueue::take_for`]); a batch that could not be sent is put back
/// with [`CommandQueue::restore`].
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<(String, Command)>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.entries.push_back((command.target.clone(), command));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commands queued for `uuid`, in order, without removing them.
    pub fn pending_for(&self, uuid: &str) -> Vec<Command> {
        self.entries
            .iter()
            .filter(|(target, _)| target == uuid)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Remove and return every command queued for `uuid`, in order.
    /// Commands for other endpoints keep their relative order.
    pub fn take_for(&mut self, uuid: &str) -> Vec<Command> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (target, command) in self.entries.drain(..) {
            if target == uuid {
                taken.push(command);
            } else {
                kept.push_back((target, command));
            }
        }
        self.entries = kept;
        taken
    }

    /// Put an undelivered batch back ahead of everything else.
    pub fn restore(&mut self, batch: Vec<Command>) {
        for command in batch.into_iter().rev() {
            self.entries.push_front((command.target.clone(), command));
        }
    }
}
