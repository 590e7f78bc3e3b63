//! In-memory transport and fixtures shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remfs_core::domain::{CommandKind, Entry, EntryId, VolumeOptions};
use remfs_core::ports::{ITransport, NormalizedResponse, TransportError, TransportRequest};

/// What the mock answers to one request
pub(crate) struct MockReply {
    pub delay: Duration,
    pub result: Result<NormalizedResponse, TransportError>,
}

impl MockReply {
    pub fn ok(response: NormalizedResponse) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(response),
        }
    }

    pub fn err(err: TransportError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(err),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = Box<dyn Fn(&TransportRequest, usize) -> MockReply + Send + Sync>;

/// Scripted [`ITransport`] recording every request
pub(crate) struct MockTransport {
    handler: Handler,
    log: Mutex<Vec<TransportRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    /// The handler receives the request and its zero-based call number
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&TransportRequest, usize) -> MockReply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Answers every request with an empty success after `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::new(move |_, _| MockReply::ok(NormalizedResponse::default()).after(delay))
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.command.kind() == kind)
            .count()
    }

    /// Highest number of concurrently running sends
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ITransport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<NormalizedResponse, TransportError> {
        let call = {
            let mut log = self.log.lock().unwrap();
            log.push(request.clone());
            log.len() - 1
        };
        let reply = (self.handler)(request, call);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.result
    }
}

pub(crate) fn id(s: &str) -> EntryId {
    EntryId::new(s).unwrap()
}

pub(crate) fn root(name: &str) -> Entry {
    Entry::root(id(name), name, VolumeOptions::default())
}

pub(crate) fn dir(name: &str, parent: &str) -> Entry {
    Entry::directory(id(name), id(parent), name)
}

pub(crate) fn file(name: &str, parent: &str) -> Entry {
    Entry::file(id(name), id(parent), name)
}
