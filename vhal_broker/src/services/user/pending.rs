//! Correlation of asynchronous user HAL requests.
//!
//! ```text
//! begin() ──► table[id] = entry{ticket} ──► Arm(deadline, id, ticket) ──► timer thread
//!                  │                                                        │
//!   complete(id, kind) removes entry              deadline reached: remove entry
//!   (response path, dispatch thread)              only if the ticket still matches,
//!                                                 then fire HalResponseTimeout
//! ```
//!
//! Removing an entry is the only cancellation: a timer or a late response that
//! finds no entry (or another ticket) does nothing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::consts::TIMEOUT_THREAD_NAME;
use vhal_common::hal::HalError;
use vhal_common::property::ids;
use vhal_common::property::PropertyId;

use super::messages::{
    CreateUserResponse, InitialUserInfoResponse, SwitchUserResponse,
    UserIdentificationAssociationType, UserIdentificationResponse,
};

/// Outcome reported to an asynchronous request's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalCallbackStatus {
    /// Valid response received.
    Ok,
    /// The request could not be written to the vehicle.
    HalSetTimeout,
    /// No response before the deadline.
    HalResponseTimeout,
    /// A response arrived but did not match the request.
    WrongHalResponse,
    /// Another request of the same kind was already pending.
    ConcurrentOperation,
    /// The service was released while the request was pending.
    Invalid,
}

impl fmt::Display for HalCallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::HalSetTimeout => "HAL_SET_TIMEOUT",
            Self::HalResponseTimeout => "HAL_RESPONSE_TIMEOUT",
            Self::WrongHalResponse => "WRONG_HAL_RESPONSE",
            Self::ConcurrentOperation => "CONCURRENT_OPERATION",
            Self::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Kind of asynchronous request; one response property each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// `INITIAL_USER_INFO`.
    InitialUserInfo,
    /// `SWITCH_USER` with an Android switch.
    SwitchUser,
    /// `CREATE_USER`.
    CreateUser,
    /// `USER_IDENTIFICATION_ASSOCIATION` set.
    UserIdentification,
}

impl ResponseKind {
    /// Property carrying requests and responses of this kind.
    pub fn prop(self) -> PropertyId {
        match self {
            Self::InitialUserInfo => ids::INITIAL_USER_INFO,
            Self::SwitchUser => ids::SWITCH_USER,
            Self::CreateUser => ids::CREATE_USER,
            Self::UserIdentification => ids::USER_IDENTIFICATION_ASSOCIATION,
        }
    }
}

/// Completion callback. Called exactly once.
pub type HalCallback<T> = Box<dyn FnOnce(HalCallbackStatus, Option<T>) + Send>;

/// Callback of a pending request, typed by kind.
pub enum PendingCallback {
    /// Initial user info.
    InitialUserInfo(HalCallback<InitialUserInfoResponse>),
    /// Android switch.
    SwitchUser(HalCallback<SwitchUserResponse>),
    /// Create user.
    CreateUser(HalCallback<CreateUserResponse>),
    /// Association set, with the types requested so the response can be checked.
    UserIdentification {
        /// Requested types, in order.
        types: Vec<UserIdentificationAssociationType>,
        /// Callback.
        callback: HalCallback<UserIdentificationResponse>,
    },
}

impl PendingCallback {
    /// Kind of the request.
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::InitialUserInfo(_) => ResponseKind::InitialUserInfo,
            Self::SwitchUser(_) => ResponseKind::SwitchUser,
            Self::CreateUser(_) => ResponseKind::CreateUser,
            Self::UserIdentification { .. } => ResponseKind::UserIdentification,
        }
    }

    /// Fire without a response.
    pub fn fail(self, status: HalCallbackStatus) {
        match self {
            Self::InitialUserInfo(callback) => callback(status, None),
            Self::SwitchUser(callback) => callback(status, None),
            Self::CreateUser(callback) => callback(status, None),
            Self::UserIdentification { callback, .. } => callback(status, None),
        }
    }
}

impl fmt::Debug for PendingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingCallback({:?})", self.kind())
    }
}

/// How many requests of one kind may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// One per kind; later ones fail with `ConcurrentOperation`.
    #[default]
    OnePerKind,
    /// Any number, correlated by request ID only.
    Unrestricted,
}

struct Entry {
    callback: PendingCallback,
    ticket: u64,
}

struct Table {
    entries: HashMap<i32, Entry>,
    next_id: i32,
    next_ticket: u64,
}

impl Table {
    /// Next ID not currently pending. IDs start at 1 and wrap back to 1.
    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

enum TimerCommand {
    Arm {
        deadline: Instant,
        request_id: i32,
        ticket: u64,
    },
    Stop,
}

/// Table of pending requests with its timeout thread.
pub struct PendingRequests {
    table: Arc<Mutex<Table>>,
    policy: ConcurrencyPolicy,
    timer: Sender<TimerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl PendingRequests {
    /// Empty table; spawns the timeout thread.
    pub fn new(policy: ConcurrencyPolicy) -> Result<Self, HalError> {
        let table = Arc::new(Mutex::new(Table {
            entries: HashMap::new(),
            next_id: 1,
            next_ticket: 0,
        }));
        let (timer, commands) = mpsc::channel();
        let timer_table = Arc::clone(&table);
        let worker = thread::Builder::new()
            .name(TIMEOUT_THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Timeout thread started");
                run_timer(&timer_table, &commands);
                debug!("Timeout thread stopped");
            })
            .map_err(|e| HalError::InitFailed(format!("spawn timeout thread: {e}")))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            table,
            policy,
            timer,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Configured policy.
    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Record a request and arm its timer.
    ///
    /// Returns the allocated request ID, or hands the callback back when the
    /// policy rejects the request.
    pub fn begin(&self, callback: PendingCallback, timeout: Duration) -> Result<i32, PendingCallback> {
        let mut table = self.table.lock();
        let kind = callback.kind();
        if self.policy == ConcurrencyPolicy::OnePerKind
            && table.entries.values().any(|e| e.callback.kind() == kind)
        {
            return Err(callback);
        }
        let request_id = table.allocate_id();
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        table.entries.insert(request_id, Entry { callback, ticket });
        drop(table);

        let armed = self.timer.send(TimerCommand::Arm {
            deadline: Instant::now() + timeout,
            request_id,
            ticket,
        });
        if armed.is_err() {
            warn!(request_id, "Timeout thread gone, request will never time out");
        }
        debug!(request_id, ?kind, "Request pending");
        Ok(request_id)
    }

    /// Allocate an ID for a request that expects no response.
    pub fn next_request_id(&self) -> i32 {
        self.table.lock().allocate_id()
    }

    /// Remove a pending request on response. A kind mismatch leaves it pending.
    pub fn complete(&self, request_id: i32, kind: ResponseKind) -> Option<PendingCallback> {
        let mut table = self.table.lock();
        match table.entries.get(&request_id) {
            Some(entry) if entry.callback.kind() == kind => {
                table.entries.remove(&request_id).map(|e| e.callback)
            }
            Some(entry) => {
                warn!(
                    request_id,
                    pending = ?entry.callback.kind(),
                    received = ?kind,
                    "Ignoring response of another kind"
                );
                None
            }
            None => {
                info!(request_id, ?kind, "Ignoring response for no pending request");
                None
            }
        }
    }

    /// Remove a pending request and fire its callback with `status`.
    pub fn fail(&self, request_id: i32, status: HalCallbackStatus) -> bool {
        let entry = self.table.lock().entries.remove(&request_id);
        match entry {
            Some(entry) => {
                entry.callback.fail(status);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `Invalid`.
    pub fn cancel_all(&self) {
        let drained: Vec<(i32, Entry)> = self.table.lock().entries.drain().collect();
        for (request_id, entry) in drained {
            debug!(request_id, "Cancelling pending request");
            entry.callback.fail(HalCallbackStatus::Invalid);
        }
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// No request pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `request_id` is pending.
    pub fn is_pending(&self, request_id: i32) -> bool {
        self.table.lock().entries.contains_key(&request_id)
    }

    /// Pending requests as `(id, kind)`, ordered by ID.
    pub fn snapshot(&self) -> Vec<(i32, ResponseKind)> {
        let table = self.table.lock();
        let mut out: Vec<_> = table
            .entries
            .iter()
            .map(|(id, e)| (*id, e.callback.kind()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

impl Drop for PendingRequests {
    fn drop(&mut self) {
        let _ = self.timer.send(TimerCommand::Stop);
        if let Some(worker) = self.worker.lock().take() {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn run_timer(table: &Mutex<Table>, commands: &mpsc::Receiver<TimerCommand>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, i32, u64)>> = BinaryHeap::new();
    loop {
        let command = match deadlines.peek() {
            Some(Reverse((deadline, _, _))) => {
                commands.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match command {
            Ok(TimerCommand::Arm {
                deadline,
                request_id,
                ticket,
            }) => deadlines.push(Reverse((deadline, request_id, ticket))),
            Ok(TimerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, request_id, ticket))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            let expired = {
                let mut table = table.lock();
                match table.entries.get(&request_id) {
                    Some(entry) if entry.ticket == ticket => table.entries.remove(&request_id),
                    _ => None,
                }
            };
            if let Some(entry) = expired {
                warn!(request_id, kind = ?entry.callback.kind(), "Request timed out");
                entry.callback.fail(HalCallbackStatus::HalResponseTimeout);
            }
        }
    }
}
