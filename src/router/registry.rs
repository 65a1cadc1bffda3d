//! C2S registry: every live stream by id, and authenticated streams by
//! username in authentication order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};

use crate::c2s::context::StreamContext;
use crate::error::RouteError;
use crate::host::Hosts;
use crate::jid::Jid;
use crate::xml::{Element, StreamErrorKind};

/// How long a sender waits on a full mailbox.
pub const MAILBOX_SEND_TIMEOUT: Duration = Duration::from_millis(500);

tokio::task_local! {
    /// Id of the stream whose task is running the current future.
    pub(crate) static CURRENT_STREAM: String;
}

/// Work posted to a stream task by other tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    /// Write this element to the peer.
    Send(Element),
    /// Close the stream, optionally with a stream error.
    Disconnect(Option<StreamErrorKind>),
}

struct Shared {
    id: String,
    mailbox: mpsc::Sender<StreamCommand>,
    replies: mpsc::UnboundedSender<Element>,
    context: RwLock<StreamContext>,
}

/// Cheap handle to a running stream.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.inner.id)
            .field("jid", &self.inner.context.read().jid)
            .finish()
    }
}

impl StreamHandle {
    pub fn new(
        id: String,
        mailbox: mpsc::Sender<StreamCommand>,
        replies: mpsc::UnboundedSender<Element>,
        context: StreamContext,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                id,
                mailbox,
                replies,
                context: RwLock::new(context),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Snapshot of the stream context.
    pub fn context(&self) -> StreamContext {
        self.inner.context.read().clone()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&StreamContext) -> R) -> R {
        f(&self.inner.context.read())
    }

    pub fn update_context<R>(&self, f: impl FnOnce(&mut StreamContext) -> R) -> R {
        f(&mut self.inner.context.write())
    }

    pub fn username(&self) -> String {
        self.with_context(|c| c.username.clone())
    }

    pub fn domain(&self) -> String {
        self.with_context(|c| c.domain.clone())
    }

    pub fn resource(&self) -> String {
        self.with_context(|c| c.resource.clone())
    }

    pub fn jid(&self) -> Option<Jid> {
        self.with_context(|c| c.jid.clone())
    }

    pub fn is_available(&self) -> bool {
        self.with_context(|c| c.is_available())
    }

    /// Queues `elem` for the stream. From inside the stream's own task the
    /// unbounded reply queue is used; anyone else goes through the bounded
    /// mailbox and gives up after [`MAILBOX_SEND_TIMEOUT`].
    pub async fn deliver(&self, elem: Element) -> Result<(), RouteError> {
        let own = CURRENT_STREAM
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false);
        if own {
            self.reply(elem);
            return Ok(());
        }
        match self
            .inner
            .mailbox
            .send_timeout(StreamCommand::Send(elem), MAILBOX_SEND_TIMEOUT)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(stream_id = %self.inner.id, "mailbox full");
                Err(RouteError::MailboxFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(RouteError::ResourceNotFound),
        }
    }

    /// Queues a reply produced while the stream handles its own input.
    pub fn reply(&self, elem: Element) {
        if self.inner.replies.send(elem).is_err() {
            debug!(stream_id = %self.inner.id, "reply dropped, stream gone");
        }
    }

    /// Asks the stream to close. Never blocks.
    pub fn disconnect(&self, kind: Option<StreamErrorKind>) {
        match self.inner.mailbox.try_send(StreamCommand::Disconnect(kind)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(cmd)) => {
                let mailbox = self.inner.mailbox.clone();
                tokio::spawn(async move {
                    let _ = mailbox.send(cmd).await;
                });
            }
        }
    }

    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

pub struct Registry {
    hosts: Hosts,
    streams: RwLock<HashMap<String, StreamHandle>>,
    authenticated: RwLock<HashMap<String, Vec<StreamHandle>>>,
}

impl Registry {
    pub fn new(hosts: Hosts) -> Self {
        Self {
            hosts,
            streams: RwLock::new(HashMap::new()),
            authenticated: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, stream: &StreamHandle) -> Result<(), RouteError> {
        let domain = stream.domain();
        if !self.hosts.is_local_host(&domain) {
            return Err(RouteError::NotLocalDomain(domain));
        }
        self.streams
            .write()
            .insert(stream.id().to_string(), stream.clone());
        debug!(stream_id = %stream.id(), "stream registered");
        Ok(())
    }

    /// Indexes a bound stream under its username. Re-authenticating moves the
    /// stream to the end of the order.
    pub fn authenticate(&self, stream: &StreamHandle) -> Result<(), RouteError> {
        let (username, resource) = stream.with_context(|c| (c.username.clone(), c.resource.clone()));
        if resource.is_empty() || username.is_empty() {
            return Err(RouteError::ResourceNotBound);
        }
        let mut authenticated = self.authenticated.write();
        let list = authenticated.entry(username).or_default();
        list.retain(|s| s.id() != stream.id());
        list.push(stream.clone());
        Ok(())
    }

    pub fn unregister(&self, stream: &StreamHandle) {
        self.streams.write().remove(stream.id());
        let mut authenticated = self.authenticated.write();
        let username = stream.username();
        if let Some(list) = authenticated.get_mut(&username) {
            list.retain(|s| s.id() != stream.id());
            if list.is_empty() {
                authenticated.remove(&username);
            }
        }
        debug!(stream_id = %stream.id(), "stream unregistered");
    }

    pub fn stream(&self, id: &str) -> Option<StreamHandle> {
        self.streams.read().get(id).cloned()
    }

    /// Authenticated streams of `username`, oldest first.
    pub fn user_streams(&self, username: &str) -> Vec<StreamHandle> {
        self.authenticated
            .read()
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_streams(&self) -> Vec<StreamHandle> {
        self.streams.read().values().cloned().collect()
    }

    pub fn authenticated_streams(&self) -> Vec<StreamHandle> {
        self.authenticated.read().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
