//! Two-lane execution scheduler.
//!
//! Lane 0 (immediate) is always drained before lane 1 (delayed) is looked
//! at. Lane 1 dispatches are spaced by at least [`DELAYED_SPACING`] so bulk
//! low-priority work cannot monopolize the event loop; when the spacing is
//! not met a single retry is armed for the remaining wait.
//!
//! Must be used from inside a `tokio::task::LocalSet`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::message::Message;

/// Minimum spacing between two lane-1 dispatches.
pub const DELAYED_SPACING: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Immediate = 0,
    Delayed = 1,
}

impl Priority {
    pub fn from_delayed(delayed: bool) -> Self {
        if delayed {
            Priority::Delayed
        } else {
            Priority::Immediate
        }
    }
}

pub type Runner = Box<dyn FnOnce(String, Message)>;

struct Entry {
    id: u64,
    cmd: String,
    msg: Message,
    run: Runner,
}

#[derive(Default)]
struct Lanes {
    immediate: VecDeque<Entry>,
    delayed: VecDeque<Entry>,
    next_id: u64,
    last_delayed: Option<Instant>,
    retry_armed: bool,
}

#[derive(Clone)]
pub struct Executor {
    lanes: Rc<RefCell<Lanes>>,
    spacing: Duration,
}

impl Executor {
    pub fn new() -> Self {
        Self::with_spacing(DELAYED_SPACING)
    }

    pub fn with_spacing(spacing: Duration) -> Self {
        Self {
            lanes: Rc::new(RefCell::new(Lanes::default())),
            spacing,
        }
    }

    /// Admit an entry and schedule as much as the lane rules allow.
    pub fn submit(&self, cmd: impl Into<String>, msg: Message, run: Runner, priority: Priority) {
        {
            let mut lanes = self.lanes.borrow_mut();
            let id = lanes.next_id;
            lanes.next_id += 1;
            let entry = Entry {
                id,
                cmd: cmd.into(),
                msg,
                run,
            };
            match priority {
                Priority::Immediate => lanes.immediate.push_back(entry),
                Priority::Delayed => lanes.delayed.push_back(entry),
            }
        }
        self.pump();
    }

    /// Number of entries not yet dispatched, both lanes.
    pub fn pending(&self) -> usize {
        let lanes = self.lanes.borrow();
        lanes.immediate.len() + lanes.delayed.len()
    }

    fn pump(&self) {
        while let Some(entry) = self.next_entry() {
            debug!(id = entry.id, cmd = %entry.cmd, "dispatch");
            (entry.run)(entry.cmd, entry.msg);
        }
    }

    fn next_entry(&self) -> Option<Entry> {
        let mut lanes = self.lanes.borrow_mut();
        if let Some(entry) = lanes.immediate.pop_front() {
            return Some(entry);
        }
        if lanes.delayed.is_empty() {
            return None;
        }

        let now = Instant::now();
        let wait = lanes
            .last_delayed
            .map(|last| self.spacing.saturating_sub(now.duration_since(last)))
            .unwrap_or(Duration::ZERO);

        if wait.is_zero() {
            lanes.last_delayed = Some(now);
            return lanes.delayed.pop_front();
        }

        if !lanes.retry_armed {
            lanes.retry_armed = true;
            let executor = self.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(wait).await;
                executor.lanes.borrow_mut().retry_armed = false;
                executor.pump();
            });
        }
        None
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
