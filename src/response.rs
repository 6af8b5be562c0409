//! Response sink handed to every handler invocation.

use serde_json::{json, Value};

use crate::commander::{Commander, Nested};
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::notifier::{orc_topic, Notifier, GREATHALL};

/// Lets a handler publish events addressed to its caller and issue nested
/// commands on the caller's behalf.
#[derive(Clone)]
pub struct Response {
    commander: Commander,
    cmd: String,
    orc_name: String,
    id: Option<String>,
    router: Option<String>,
    origin_router: Option<String>,
}

impl Response {
    pub(crate) fn new(commander: Commander, cmd: &str, msg: &Message) -> Self {
        Self {
            commander,
            cmd: cmd.to_string(),
            orc_name: msg.orc_name.clone(),
            id: msg.id.clone(),
            router: msg.router.clone(),
            origin_router: msg.origin_router.clone(),
        }
    }

    /// Response whose events are addressed to the bus itself, used for work
    /// the bus starts on its own (boot-time module loading).
    pub fn greathall(commander: Commander, cmd: &str) -> Self {
        Self {
            commander,
            cmd: cmd.to_string(),
            orc_name: GREATHALL.to_string(),
            id: None,
            router: None,
            origin_router: None,
        }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn orc_name(&self) -> &str {
        &self.orc_name
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    pub fn notifier(&self) -> &Notifier {
        self.commander.notifier()
    }

    /// Publish `<orcName>::<topic>`.
    pub fn events_send(&self, topic: &str, payload: Value) -> usize {
        self.notifier()
            .send(orc_topic(&self.orc_name, topic), payload)
    }

    pub fn finished(&self, payload: Value) -> usize {
        let topic = format!("{}.finished", self.cmd);
        self.events_send(&topic, payload)
    }

    pub fn error(&self, err: &BusError) -> usize {
        let topic = format!("{}.error", self.cmd);
        self.events_send(
            &topic,
            json!({
                "cmd": self.cmd,
                "desc": err.to_string(),
            }),
        )
    }

    /// Issue `cmd` as a nested command of the current invocation. It runs
    /// right away, outside of the activity gate.
    pub async fn command(&self, cmd: &str, data: Value) -> BusResult<Nested> {
        let mut msg = Message::new(cmd, data)
            .with_token(self.commander.token())
            .with_orc_name(self.orc_name.clone())
            .nested();
        msg.id = self.id.clone();
        msg.router = self.router.clone();
        msg.origin_router = self.origin_router.clone();
        self.commander.dispatch_nested(cmd.to_string(), msg).await
    }
}
