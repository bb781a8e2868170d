//! Bounded undo history.
//!
//! The command log records what each undoable action pushed; inference
//! entries carry a paired prompt snapshot so the buffer can be restored
//! when the inference is undone. Both stacks are fixed-capacity rings that
//! evict their oldest entry on overflow.

use crate::prompt::PromptSnapshot;

/// Default capacity of the command log
pub const COMMAND_LOG_CAPACITY: usize = 1000;

/// Default capacity of the prompt snapshot stack
pub const SNAPSHOT_CAPACITY: usize = 500;

/// Fixed-capacity ring buffer used as a stack with oldest-entry eviction
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// A zero capacity is raised to one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity()
    }

    /// Push onto the newest end, returning the evicted oldest entry if full
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop_oldest() } else { None };
        let idx = self.slot(self.len);
        self.slots[idx] = Some(value);
        self.len += 1;
        evicted
    }

    /// Remove the newest entry
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = self.slot(self.len - 1);
        self.len -= 1;
        self.slots[idx].take()
    }

    /// Remove the oldest entry
    pub fn pop_oldest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = self.slot(1);
        self.len -= 1;
        value
    }

    pub fn oldest(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    pub fn newest(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.slot(self.len - 1)].as_ref()
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.slot(i)].as_ref())
    }
}

/// What an undoable action pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLogEntry {
    Point,
    Box,
    Brush,
    /// An inference that appended `count` layers
    Inference { count: usize },
}

/// An entry popped for undo, with its snapshot when it has one
#[derive(Debug, Clone, PartialEq)]
pub enum UndoStep {
    Point,
    Box,
    Brush,
    Inference {
        count: usize,
        snapshot: PromptSnapshot,
    },
}

/// Undo stack plus the paired snapshot stack for inference entries
///
/// Invariant: the snapshot stack holds exactly one snapshot per `Inference`
/// entry in the log, in the same order. Evicting an inference entry from the
/// log evicts its snapshot, and overflowing the snapshot stack evicts log
/// entries up to and including the oldest inference.
#[derive(Debug, Clone)]
pub struct CommandLog {
    entries: RingBuffer<CommandLogEntry>,
    snapshots: RingBuffer<PromptSnapshot>,
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(COMMAND_LOG_CAPACITY, SNAPSHOT_CAPACITY)
    }
}

impl CommandLog {
    pub fn new(log_capacity: usize, snapshot_capacity: usize) -> Self {
        Self {
            entries: RingBuffer::with_capacity(log_capacity),
            snapshots: RingBuffer::with_capacity(snapshot_capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommandLogEntry> + '_ {
        self.entries.iter()
    }

    pub fn push_point(&mut self) {
        self.push_entry(CommandLogEntry::Point);
    }

    pub fn push_box(&mut self) {
        self.push_entry(CommandLogEntry::Box);
    }

    pub fn push_brush(&mut self) {
        self.push_entry(CommandLogEntry::Brush);
    }

    pub fn push_inference(&mut self, count: usize, snapshot: PromptSnapshot) {
        if self.snapshots.is_full() {
            self.evict_through_oldest_inference();
        }
        self.push_entry(CommandLogEntry::Inference { count });
        self.snapshots.push(snapshot);
    }

    fn push_entry(&mut self, entry: CommandLogEntry) {
        if let Some(evicted) = self.entries.push(entry) {
            tracing::warn!("Command log full, dropped oldest entry {:?}", evicted);
            if matches!(evicted, CommandLogEntry::Inference { .. }) {
                self.snapshots.pop_oldest();
            }
        }
    }

    fn evict_through_oldest_inference(&mut self) {
        while let Some(entry) = self.entries.pop_oldest() {
            if matches!(entry, CommandLogEntry::Inference { .. }) {
                self.snapshots.pop_oldest();
                tracing::warn!("Snapshot stack full, dropped oldest inference from history");
                return;
            }
        }
    }

    /// Pop the newest entry for undo; `None` when there is nothing to undo
    pub fn pop(&mut self) -> Option<UndoStep> {
        let entry = self.entries.pop()?;
        let step = match entry {
            CommandLogEntry::Point => UndoStep::Point,
            CommandLogEntry::Box => UndoStep::Box,
            CommandLogEntry::Brush => UndoStep::Brush,
            CommandLogEntry::Inference { count } => UndoStep::Inference {
                count,
                // Pairing guarantees a snapshot; an empty one only restores an empty buffer
                snapshot: self.snapshots.pop().unwrap_or_default(),
            },
        };
        Some(step)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.snapshots.clear();
    }
}
