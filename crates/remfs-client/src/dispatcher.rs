//! Request dispatcher
//!
//! Every connector command goes through the [`Dispatcher`]. It bounds the
//! number of simultaneous requests per [`Lane`], lets navigation jump the
//! queue, cancels requests that a navigation makes obsolete and retries a
//! query that the server rejected as too long.
//!
//! ## Lifecycle
//!
//! ```text
//!            submit()
//!               │
//!               ▼
//!  ┌──────── Queued ────────┐
//!  │            │ slot free │ abort / cancel
//!  │            ▼           ▼
//!  │         Sending ──► Aborted
//!  │            │ (414: one retry with body encoding)
//!  │            ▼
//!  └──► Succeeded | Failed
//! ```
//!
//! ## Design Notes
//!
//! - Each submitted request runs in its own task, which waits for an
//!   admission ticket from its lane before touching the transport. Queues
//!   hold tickets only, so an aborted request leaves the queue as soon as
//!   its task observes the cancellation.
//! - Navigation tickets are pushed to the front of a separate queue that
//!   drains before the background queue.
//! - A response that arrives after its request was aborted is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use remfs_core::config::{DispatcherConfig, NavigationPolicy, UploadConfig};
use remfs_core::domain::{Command, CommandKind};
use remfs_core::ports::{
    ClientEvent, Encoding, EventBus, ITransport, NormalizedResponse, TransportError,
    TransportRequest,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::notify::{NotificationTracker, NotifyPolicy};
use crate::DispatchError;

/// Settled request states remembered for [`Dispatcher::state_of`]
const RECENT_STATES: usize = 128;

// ============================================================================
// Public types
// ============================================================================

/// Concurrency pool a request runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Navigation, listing and mutation commands
    Standard,
    /// Upload requests (whole-file batches, chunks and merges)
    Upload,
}

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Sending,
    Succeeded,
    Failed,
    Aborted,
}

impl RequestState {
    /// Whether the request has not settled yet
    pub fn is_live(self) -> bool {
        matches!(self, RequestState::Queued | RequestState::Sending)
    }
}

/// Identifier of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// How an aborted request is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortMode {
    pub quiet: bool,
}

impl AbortMode {
    /// The user is not told about the abort
    pub const QUIET: AbortMode = AbortMode { quiet: true };
    /// The abort is reported through `ErrorReported`
    pub const LOUD: AbortMode = AbortMode { quiet: false };
}

/// Per-request dispatch options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub lane: Lane,
    /// Dropped when the user navigates away
    pub cwd_bound: bool,
    /// Subject to navigation priority and exclusivity
    pub navigation: bool,
    /// Show a "working" indicator if the request is slow
    pub notify: Option<NotifyPolicy>,
    /// Overrides the lane's default timeout
    pub timeout: Option<Duration>,
    /// Parent token; cancelling it aborts the request quietly
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Defaults derived from the command kind
    pub fn for_command(kind: CommandKind) -> Self {
        Self {
            lane: if kind == CommandKind::Upload {
                Lane::Upload
            } else {
                Lane::Standard
            },
            cwd_bound: kind.is_cwd_bound_by_default(),
            navigation: kind.is_navigation(),
            notify: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn cwd_bound(mut self, cwd_bound: bool) -> Self {
        self.cwd_bound = cwd_bound;
        self
    }

    pub fn navigation(mut self, navigation: bool) -> Self {
        self.navigation = navigation;
        self
    }

    pub fn notify(mut self, policy: NotifyPolicy) -> Self {
        self.notify = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Awaitable outcome of a submitted request
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    rx: oneshot::Receiver<Result<NormalizedResponse, DispatchError>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the request to settle
    pub async fn outcome(self) -> Result<NormalizedResponse, DispatchError> {
        self.rx.await.unwrap_or(Err(DispatchError::Closed))
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug)]
struct Record {
    kind: CommandKind,
    state: RequestState,
    navigation: bool,
    cwd_bound: bool,
    cancel: CancellationToken,
    abort: Option<AbortMode>,
}

#[derive(Debug)]
struct Ticket {
    id: RequestId,
    go: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LaneQueue {
    capacity: usize,
    in_flight: usize,
    navigation: VecDeque<Ticket>,
    background: VecDeque<Ticket>,
}

impl LaneQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_flight: 0,
            navigation: VecDeque::new(),
            background: VecDeque::new(),
        }
    }

    /// Hands out tickets while slots are free
    fn pump(&mut self) {
        while self.in_flight < self.capacity {
            let Some(ticket) = self
                .navigation
                .pop_front()
                .or_else(|| self.background.pop_front())
            else {
                break;
            };
            // A closed receiver belongs to a request that was already aborted.
            if ticket.go.send(()).is_ok() {
                self.in_flight += 1;
                trace!(id = %ticket.id, in_flight = self.in_flight, "Admitted request");
            }
        }
    }

    fn withdraw(&mut self, id: RequestId) -> bool {
        let before = self.navigation.len() + self.background.len();
        self.navigation.retain(|t| t.id != id);
        self.background.retain(|t| t.id != id);
        before != self.navigation.len() + self.background.len()
    }

    fn queued(&self) -> usize {
        self.navigation.len() + self.background.len()
    }
}

#[derive(Debug)]
struct Lanes {
    standard: LaneQueue,
    upload: LaneQueue,
}

impl Lanes {
    fn get_mut(&mut self, lane: Lane) -> &mut LaneQueue {
        match lane {
            Lane::Standard => &mut self.standard,
            Lane::Upload => &mut self.upload,
        }
    }

    fn get(&self, lane: Lane) -> &LaneQueue {
        match lane {
            Lane::Standard => &self.standard,
            Lane::Upload => &self.upload,
        }
    }
}

struct Job {
    id: RequestId,
    kind: CommandKind,
    lane: Lane,
    request: TransportRequest,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<NormalizedResponse, DispatchError>>,
}

struct Inner {
    transport: Arc<dyn ITransport>,
    events: EventBus,
    notifier: NotificationTracker,
    records: DashMap<RequestId, Record>,
    lanes: Mutex<Lanes>,
    recent: Mutex<VecDeque<(RequestId, RequestState)>>,
    next_id: AtomicU64,
    policy: NavigationPolicy,
    standard_timeout: Option<Duration>,
    upload_timeout: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Bounded, cancellable request dispatcher
///
/// Cloning is cheap; clones share queues and the request registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("live", &self.inner.records.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `transport`
    ///
    /// # Arguments
    /// * `transport` - Connector transport
    /// * `events` - Bus receiving request and error events
    /// * `config` - Standard lane width, timeouts and navigation policy
    /// * `upload` - Upload lane width and timeout
    pub fn new(
        transport: Arc<dyn ITransport>,
        events: EventBus,
        config: &DispatcherConfig,
        upload: &UploadConfig,
    ) -> Self {
        let lanes = Lanes {
            standard: LaneQueue::new(config.max_concurrency),
            upload: LaneQueue::new(upload.effective_concurrency()),
        };
        Self {
            inner: Arc::new(Inner {
                transport,
                notifier: NotificationTracker::new(events.clone()),
                events,
                records: DashMap::new(),
                lanes: Mutex::new(lanes),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_STATES)),
                next_id: AtomicU64::new(1),
                policy: config.navigation_policy,
                standard_timeout: config.request_timeout(),
                upload_timeout: upload.request_timeout(),
            }),
        }
    }

    /// Event bus this dispatcher reports to
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Queues a command and returns a handle to its outcome
    ///
    /// A navigation first aborts quietly every live cwd-bound request and,
    /// under [`NavigationPolicy::Supersede`], every older navigation.
    ///
    /// # Errors
    /// Returns [`DispatchError::NavigationInProgress`] for a navigation
    /// submitted under [`NavigationPolicy::RejectWhileOpening`] while another
    /// navigation is live.
    pub fn submit(
        &self,
        command: Command,
        options: RequestOptions,
    ) -> Result<RequestHandle, DispatchError> {
        let inner = &self.inner;
        let kind = command.kind();

        if options.navigation {
            let live_navigations = self.live_matching(|r| r.navigation);
            match inner.policy {
                NavigationPolicy::RejectWhileOpening if !live_navigations.is_empty() => {
                    debug!(cmd = %kind, "Rejecting navigation while another is in flight");
                    return Err(DispatchError::NavigationInProgress);
                }
                NavigationPolicy::RejectWhileOpening => {}
                NavigationPolicy::Supersede => {
                    for id in live_navigations {
                        self.abort(id, AbortMode::QUIET);
                    }
                }
            }
            for id in self.live_matching(|r| r.cwd_bound) {
                self.abort(id, AbortMode::QUIET);
            }
        }

        let id = RequestId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let timeout = options.timeout.or(match options.lane {
            Lane::Standard => inner.standard_timeout,
            Lane::Upload => inner.upload_timeout,
        });

        inner.records.insert(
            id,
            Record {
                kind,
                state: RequestState::Queued,
                navigation: options.navigation,
                cwd_bound: options.cwd_bound,
                cancel: cancel.clone(),
                abort: None,
            },
        );
        if let Some(policy) = &options.notify {
            inner.notifier.begin(id, kind, policy);
        }

        let (reply, rx) = oneshot::channel();
        let (go, admitted) = oneshot::channel();
        let job = Job {
            id,
            kind,
            lane: options.lane,
            request: TransportRequest::new(command),
            timeout,
            cancel,
            reply,
        };
        tokio::spawn(Inner::drive(Arc::clone(inner), job, admitted));

        {
            let mut lanes = lock(&inner.lanes);
            let lane = lanes.get_mut(options.lane);
            if options.navigation {
                lane.navigation.push_front(Ticket { id, go });
            } else {
                lane.background.push_back(Ticket { id, go });
            }
            lane.pump();
        }
        debug!(%id, cmd = %kind, lane = ?options.lane, navigation = options.navigation, "Request submitted");

        Ok(RequestHandle { id, rx })
    }

    /// Submits a command and waits for its outcome
    ///
    /// # Errors
    /// Returns the request's [`DispatchError`]
    pub async fn execute(
        &self,
        command: Command,
        options: RequestOptions,
    ) -> Result<NormalizedResponse, DispatchError> {
        self.submit(command, options)?.outcome().await
    }

    /// Aborts a live request
    ///
    /// Returns `false` if the request already settled or was aborted.
    pub fn abort(&self, id: RequestId, mode: AbortMode) -> bool {
        let (kind, token) = {
            let Some(mut record) = self.inner.records.get_mut(&id) else {
                return false;
            };
            if record.abort.is_some() || !record.state.is_live() {
                return false;
            }
            record.abort = Some(mode);
            record.state = RequestState::Aborted;
            (record.kind, record.cancel.clone())
        };
        debug!(%id, cmd = %kind, quiet = mode.quiet, "Aborting request");
        token.cancel();
        true
    }

    /// Aborts every live request; returns how many were aborted
    pub fn abort_all(&self, mode: AbortMode) -> usize {
        self.live_matching(|_| true)
            .into_iter()
            .filter(|id| self.abort(*id, mode))
            .count()
    }

    /// Current or recently settled state of a request
    pub fn state_of(&self, id: RequestId) -> Option<RequestState> {
        if let Some(record) = self.inner.records.get(&id) {
            return Some(record.state);
        }
        lock(&self.inner.recent)
            .iter()
            .rev()
            .find(|(rid, _)| *rid == id)
            .map(|(_, state)| *state)
    }

    /// Requests currently being sent on a lane
    pub fn in_flight(&self, lane: Lane) -> usize {
        lock(&self.inner.lanes).get(lane).in_flight
    }

    /// Requests waiting for a slot on a lane
    pub fn queued(&self, lane: Lane) -> usize {
        lock(&self.inner.lanes).get(lane).queued()
    }

    fn live_matching(&self, predicate: impl Fn(&Record) -> bool) -> Vec<RequestId> {
        self.inner
            .records
            .iter()
            .filter(|r| r.state.is_live() && r.abort.is_none() && predicate(r.value()))
            .map(|r| *r.key())
            .collect()
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, job: Job, mut admitted: oneshot::Receiver<()>) {
        let admission = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => None,
            ticket = &mut admitted => Some(ticket.is_ok()),
        };

        match admission {
            Some(true) => {}
            Some(false) => {
                self.settle(job, Err(DispatchError::Closed));
                return;
            }
            None => {
                self.withdraw(job.id, job.lane, &mut admitted);
                let err = self.abort_error(job.id);
                self.settle(job, Err(err));
                return;
            }
        }

        if let Some(mut record) = self.records.get_mut(&job.id) {
            if record.abort.is_none() {
                record.state = RequestState::Sending;
            }
        }

        let result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(self.abort_error(job.id)),
            result = self.send_with_retry(&job.request, job.timeout) => result,
        };

        {
            let mut lanes = lock(&self.lanes);
            let lane = lanes.get_mut(job.lane);
            lane.in_flight = lane.in_flight.saturating_sub(1);
            lane.pump();
        }
        self.settle(job, result);
    }

    /// Leaves the queue after a cancellation, giving back a slot that was
    /// granted concurrently
    fn withdraw(&self, id: RequestId, lane: Lane, admitted: &mut oneshot::Receiver<()>) {
        let mut lanes = lock(&self.lanes);
        let queue = lanes.get_mut(lane);
        if !queue.withdraw(id) && admitted.try_recv().is_ok() {
            queue.in_flight = queue.in_flight.saturating_sub(1);
            queue.pump();
        }
    }

    fn abort_error(&self, id: RequestId) -> DispatchError {
        let quiet = self
            .records
            .get(&id)
            .and_then(|r| r.abort)
            .map_or(true, |mode| mode.quiet);
        DispatchError::Aborted { quiet }
    }

    async fn send_with_retry(
        &self,
        request: &TransportRequest,
        timeout: Option<Duration>,
    ) -> Result<NormalizedResponse, DispatchError> {
        let response = match self.send_once(request, timeout).await {
            Err(TransportError::UriTooLong) if request.encoding == Encoding::Query => {
                debug!(cmd = %request.command.kind(), "URI too long, retrying with body encoding");
                let retry = TransportRequest {
                    command: request.command.clone(),
                    encoding: Encoding::Body,
                };
                self.send_once(&retry, timeout).await?
            }
            other => other?,
        };

        if response.is_error() {
            return Err(DispatchError::Remote(response.error.unwrap_or_default()));
        }
        Ok(response)
    }

    async fn send_once(
        &self,
        request: &TransportRequest,
        timeout: Option<Duration>,
    ) -> Result<NormalizedResponse, TransportError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.send(request))
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => self.transport.send(request).await,
        }
    }

    fn settle(&self, job: Job, result: Result<NormalizedResponse, DispatchError>) {
        self.notifier.finish(job.id);

        let record = self.records.remove(&job.id).map(|(_, r)| r);
        let result = match record.as_ref().and_then(|r| r.abort) {
            Some(mode) => Err(DispatchError::Aborted { quiet: mode.quiet }),
            None => result,
        };

        let state = match &result {
            Ok(_) => RequestState::Succeeded,
            Err(DispatchError::Aborted { .. }) => RequestState::Aborted,
            Err(_) => RequestState::Failed,
        };

        match &result {
            Ok(_) => debug!(id = %job.id, cmd = %job.kind, "Request succeeded"),
            Err(err) if err.is_quiet_abort() => {
                debug!(id = %job.id, cmd = %job.kind, "Request aborted quietly")
            }
            Err(err) => {
                warn!(id = %job.id, cmd = %job.kind, error = %err, "Request failed");
                self.events.emit(ClientEvent::ErrorReported {
                    kind: job.kind,
                    reason: err.to_string(),
                });
            }
        }

        {
            let mut recent = lock(&self.recent);
            if recent.len() == RECENT_STATES {
                recent.pop_front();
            }
            recent.push_back((job.id, state));
        }

        let _ = job.reply.send(result);
    }
}
