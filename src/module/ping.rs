//! XEP-0199: XMPP Ping, including server-initiated pings.
//!
//! Each bound stream gets a timer task. The task sleeps for `interval`; any
//! inbound stanza restarts the wait. When it fires the server sends a ping
//! and waits `ack_timeout` for any stanza from the peer before applying the
//! timeout action.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Module;
use crate::config::{PingConfig, TimeoutAction};
use crate::error::ModuleError;
use crate::router::StreamHandle;
use crate::xml::{ns, Element, Iq, StanzaErrorCondition, StreamErrorKind};

struct Timer {
    task: JoinHandle<()>,
    activity: Arc<Notify>,
    pending_id: Arc<Mutex<Option<String>>>,
}

pub struct Ping {
    config: PingConfig,
    timers: Mutex<HashMap<String, Timer>>,
}

impl Ping {
    pub fn new(config: PingConfig) -> Self {
        Self {
            config,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.send_pings
    }

    /// Starts the ping timer of `stream` unless it is already running.
    pub fn schedule(&self, stream: &StreamHandle) {
        if !self.config.send_pings {
            return;
        }
        let Some(jid) = stream.jid() else {
            return;
        };
        let mut timers = self.timers.lock();
        if timers.contains_key(stream.id()) {
            return;
        }
        let activity = Arc::new(Notify::new());
        let pending_id = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_timer(
            stream.clone(),
            jid.to_string(),
            self.config.clone(),
            activity.clone(),
            pending_id.clone(),
        ));
        timers.insert(
            stream.id().to_string(),
            Timer {
                task,
                activity,
                pending_id,
            },
        );
    }

    /// Restarts the wait after an inbound stanza.
    pub fn on_activity(&self, stream: &StreamHandle) {
        if let Some(timer) = self.timers.lock().get(stream.id()) {
            timer.activity.notify_one();
        }
    }

    /// Consumes the peer's answer to a server ping.
    pub fn process_result(&self, stream: &StreamHandle, iq: &Iq) -> bool {
        let timers = self.timers.lock();
        let Some(timer) = timers.get(stream.id()) else {
            return false;
        };
        let mut pending = timer.pending_id.lock();
        if pending.as_deref() == Some(iq.id()) {
            *pending = None;
            timer.activity.notify_one();
            return true;
        }
        false
    }

    pub fn cancel(&self, stream: &StreamHandle) {
        if let Some(timer) = self.timers.lock().remove(stream.id()) {
            timer.task.abort();
        }
    }
}

async fn run_timer(
    stream: StreamHandle,
    jid: String,
    config: PingConfig,
    activity: Arc<Notify>,
    pending_id: Arc<Mutex<Option<String>>>,
) {
    loop {
        tokio::select! {
            _ = activity.notified() => continue,
            _ = tokio::time::sleep(config.interval) => {}
        }

        let id = format!("ping-{}", uuid::Uuid::new_v4());
        *pending_id.lock() = Some(id.clone());
        let ping = Element::new("iq")
            .attr("id", id)
            .attr("type", "get")
            .attr("from", stream.domain())
            .attr("to", jid.as_str())
            .child(Element::with_ns("ping", ns::PING));
        debug!(stream_id = %stream.id(), jid = %jid, "sending ping");
        if stream.deliver(ping).await.is_err() {
            return;
        }

        tokio::select! {
            _ = activity.notified() => continue,
            _ = tokio::time::sleep(config.ack_timeout) => {
                info!(stream_id = %stream.id(), jid = %jid, "ping timeout");
                if config.timeout_action == TimeoutAction::Kill {
                    stream.disconnect(Some(StreamErrorKind::ConnectionTimeout));
                }
                return;
            }
        }
    }
}

#[async_trait]
impl Module for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::PING]
    }

    fn account_features(&self) -> Vec<&'static str> {
        vec![ns::PING]
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::PING
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        if !iq.is_get() {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        }
        stream.reply(iq.result_iq());
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        for (_, timer) in self.timers.lock().drain() {
            timer.task.abort();
        }
        Ok(())
    }
}
