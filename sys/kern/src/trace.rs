// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler event trace.
//!
//! A small ring buffer of scheduler events, off by default and switched on
//! with `Kernel::enable_tracing`. Like the task ring buffers it's modeled on,
//! an event identical to the previous one (same source line, same payload)
//! bumps that entry's count instead of taking a new slot, so a busy loop of
//! the same switch doesn't wipe out the history.
//!
//! Building with the `trace-disabled` feature keeps the API but records
//! nothing.

use abi::{CoreId, FaultReason, TaskId};

/// Number of entries retained.
pub const TRACE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    None,
    Created { task: TaskId, core: CoreId },
    Dispatch { task: TaskId, core: CoreId },
    Completed(TaskId),
    Switch { core: CoreId, from: TaskId, to: TaskId },
    DeadlineMiss(TaskId),
    BudgetOverrun(TaskId),
    Reclaimed { task: TaskId, count: u32 },
    Suspended(TaskId),
    Resumed(TaskId),
    Deleted(TaskId),
    Fault { task: TaskId, reason: FaultReason },
    Started,
    Stopped,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub line: u16,
    /// Bumped each time the buffer wraps onto this slot.
    pub generation: u16,
    pub count: u32,
    pub payload: TraceEvent,
}

impl TraceEntry {
    const EMPTY: Self = Self {
        line: 0,
        generation: 0,
        count: 0,
        payload: TraceEvent::None,
    };
}

#[derive(Debug)]
pub struct Ringbuf<const N: usize> {
    last: Option<usize>,
    buffer: [TraceEntry; N],
}

impl<const N: usize> Ringbuf<N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [TraceEntry::EMPTY; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: TraceEvent) {
        if cfg!(feature = "trace-disabled") {
            return;
        }

        // Treat "never written" as an out-of-range index so that the first
        // entry lands in slot 0 and never merges with the blank slot there.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);

        self.last = Some(ndx);
    }

    /// Copies entries, oldest first, into `out`. Returns how many were
    /// written; if `out` is shorter than the history, the newest entries are
    /// the ones kept.
    pub fn snapshot(&self, out: &mut [TraceEntry]) -> usize {
        let Some(last) = self.last else {
            return 0;
        };
        // Slots past `last` hold older entries only once we've wrapped.
        let wrapped = self.buffer[(last + 1) % N].count != 0;
        let (older, newer) = if wrapped {
            (&self.buffer[last + 1..], &self.buffer[..=last])
        } else {
            (&self.buffer[..0], &self.buffer[..=last])
        };
        let total = older.len() + newer.len();
        let skip = total.saturating_sub(out.len());
        let mut n = 0;
        for ent in older.iter().chain(newer).skip(skip) {
            out[n] = *ent;
            n += 1;
        }
        n
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl<const N: usize> Default for Ringbuf<N> {
    fn default() -> Self {
        Self::new()
    }
}
