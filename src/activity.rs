//! Activity gate: at most one running invocation per key.
//!
//! Invocations for a busy key wait in admission order; once the running one
//! completes the next is handed to the executor. Different keys never wait
//! on each other.

use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::debug;

use crate::executor::{Executor, Priority};
use crate::message::Message;

pub type ActivityRun = Rc<dyn Fn(String, Message) -> LocalBoxFuture<'static, ()>>;

struct Waiting {
    cmd: String,
    msg: Message,
    priority: Priority,
    run: ActivityRun,
}

#[derive(Clone)]
pub struct ActivityGate {
    executor: Executor,
    busy: Rc<RefCell<HashMap<String, VecDeque<Waiting>>>>,
}

/// Serialization key of an invocation. Parallel commands are keyed per
/// message id (or caller when there is no id), others per command.
pub fn activity_key(cmd: &str, msg: &Message, parallel: bool) -> String {
    if !parallel {
        return cmd.to_string();
    }
    let group = msg.id.as_deref().unwrap_or(msg.orc_name.as_str());
    format!("{}${}", cmd, group)
}

impl ActivityGate {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            busy: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Run now if `key` is idle, otherwise queue behind the running one.
    pub fn execute(
        &self,
        key: String,
        cmd: String,
        msg: Message,
        priority: Priority,
        run: ActivityRun,
    ) {
        let waiting = Waiting {
            cmd,
            msg,
            priority,
            run,
        };
        {
            let mut busy = self.busy.borrow_mut();
            if let Some(queue) = busy.get_mut(&key) {
                debug!(key = %key, queued = queue.len() + 1, "activity busy, queued");
                queue.push_back(waiting);
                return;
            }
            busy.insert(key.clone(), VecDeque::new());
        }
        self.start(key, waiting);
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.busy.borrow().contains_key(key)
    }

    fn start(&self, key: String, waiting: Waiting) {
        let gate = self.clone();
        let Waiting {
            cmd,
            msg,
            priority,
            run,
        } = waiting;
        self.executor.submit(
            cmd,
            msg,
            Box::new(move |cmd, msg| {
                let fut = run(cmd, msg);
                tokio::task::spawn_local(async move {
                    fut.await;
                    gate.release(key);
                });
            }),
            priority,
        );
    }

    fn release(&self, key: String) {
        let next = {
            let mut busy = self.busy.borrow_mut();
            let next = busy.get_mut(&key).and_then(|queue| queue.pop_front());
            if next.is_none() {
                busy.remove(&key);
            }
            next
        };
        if let Some(waiting) = next {
            self.start(key, waiting);
        }
    }
}
