use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::transport::{TransportRequest, TransportResponse};

/// Status reported when an envelope could not reach the server after its
/// retries were used up while online.
pub const STATUS_UNREACHABLE: u16 = 600;
/// Status reported when the pending queue refused admission.
pub const STATUS_REJECTED: u16 = 601;

static NEXT_ENVELOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing envelope identifier.
///
/// Ordering by id is submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(u64);

impl EnvelopeId {
    fn next() -> Self {
        Self(NEXT_ENVELOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn has_request_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// The single result every submitted envelope resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The server answered. `body` is only populated for envelopes that
    /// expect a body and whose payload parsed as JSON.
    Response { status: u16, body: Option<Value> },
    /// Retries exhausted while online.
    Unreachable,
    /// The pending queue was full.
    Rejected,
    /// Replaced by a newer envelope while waiting in the queue.
    Superseded,
    /// Dropped by dispatcher shutdown.
    Cancelled,
}

impl Outcome {
    pub(crate) fn from_response(response: TransportResponse, expects_body: bool) -> Self {
        let body = if expects_body && !response.body.is_empty() {
            serde_json::from_slice(&response.body).ok()
        } else {
            None
        };
        Outcome::Response {
            status: response.status,
            body,
        }
    }

    /// Status in the `(statusCode, body)` convention; `None` for outcomes
    /// that carry no status.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Outcome::Response { status, .. } => Some(*status),
            Outcome::Unreachable => Some(STATUS_UNREACHABLE),
            Outcome::Rejected => Some(STATUS_REJECTED),
            Outcome::Superseded | Outcome::Cancelled => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Outcome::Response { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (Option<u16>, Option<Value>) {
        let status = self.status_code();
        match self {
            Outcome::Response { body, .. } => (status, body),
            _ => (status, None),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Response { status, .. } if (200..300).contains(status))
    }
}

/// Future side of an envelope's result.
///
/// Resolves exactly once; later polls and `try_outcome` calls return the
/// same outcome. Dropping it does not stop delivery.
#[derive(Debug)]
pub struct Completion {
    id: EnvelopeId,
    rx: Option<oneshot::Receiver<Outcome>>,
    outcome: Option<Outcome>,
}

impl Completion {
    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    /// Non-blocking check, for shells that poll from a UI loop.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        if self.outcome.is_none() {
            let received = match self.rx.as_mut()?.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Outcome::Cancelled,
            };
            self.settle(received);
        }
        self.outcome.clone()
    }

    fn settle(&mut self, outcome: Outcome) {
        self.rx = None;
        self.outcome = Some(outcome);
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = &this.outcome {
            return Poll::Ready(outcome.clone());
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Outcome::Cancelled);
        };
        let received = ready!(Pin::new(rx).poll(cx)).unwrap_or(Outcome::Cancelled);
        this.settle(received.clone());
        Poll::Ready(received)
    }
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeState {
    Created,
    InFlight { attempt: u32 },
    Queued,
    Completed { status: u16 },
    Failed { status: u16 },
    Superseded,
    Cancelled,
}

impl EnvelopeState {
    pub fn state_name(&self) -> &'static str {
        match self {
            EnvelopeState::Created => "created",
            EnvelopeState::InFlight { .. } => "in_flight",
            EnvelopeState::Queued => "queued",
            EnvelopeState::Completed { .. } => "completed",
            EnvelopeState::Failed { .. } => "failed",
            EnvelopeState::Superseded => "superseded",
            EnvelopeState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnvelopeState::Completed { .. }
                | EnvelopeState::Failed { .. }
                | EnvelopeState::Superseded
                | EnvelopeState::Cancelled
        )
    }

    pub fn can_transition_to_in_flight(&self) -> bool {
        matches!(
            self,
            EnvelopeState::Created | EnvelopeState::Queued | EnvelopeState::InFlight { .. }
        )
    }

    pub fn can_transition_to_queued(&self) -> bool {
        matches!(self, EnvelopeState::Created | EnvelopeState::InFlight { .. })
    }

    fn state_for(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Response { status, .. } => EnvelopeState::Completed { status: *status },
            Outcome::Unreachable => EnvelopeState::Failed {
                status: STATUS_UNREACHABLE,
            },
            Outcome::Rejected => EnvelopeState::Failed {
                status: STATUS_REJECTED,
            },
            Outcome::Superseded => EnvelopeState::Superseded,
            Outcome::Cancelled => EnvelopeState::Cancelled,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Resend immediately; the retry has already been counted.
    Retry,
    /// Connectivity dropped: hand the envelope to the pending queue.
    Requeue,
    /// Budget exhausted while online.
    GiveUp,
}

// ============================================================================
// Envelope
// ============================================================================

/// One outbound request plus its retry and result bookkeeping.
#[derive(Debug)]
pub struct Envelope {
    id: EnvelopeId,
    method: Method,
    url: String,
    body: Option<Value>,
    headers: Vec<(String, String)>,
    expects_body: bool,
    idempotency_key: Uuid,
    attempts: u32,
    retries: u32,
    state: EnvelopeState,
    completer: Option<oneshot::Sender<Outcome>>,
}

impl Envelope {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::next(),
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            expects_body: false,
            idempotency_key: Uuid::new_v4(),
            attempts: 0,
            retries: 0,
            state: EnvelopeState::Created,
            completer: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, url).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn expect_body(mut self, expects_body: bool) -> Self {
        self.expects_body = expects_body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn expects_body(&self) -> bool {
        self.expects_body
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> &EnvelopeState {
        &self.state
    }

    /// Attach the result channel. Called once, on submission.
    pub(crate) fn completion(&mut self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.completer = Some(tx);
        Completion {
            id: self.id,
            rx: Some(rx),
            outcome: None,
        }
    }

    /// Move to `InFlight` and build the wire request for this attempt.
    pub(crate) fn begin_attempt(&mut self) -> Option<TransportRequest> {
        if !self.state.can_transition_to_in_flight() {
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);
        self.state = EnvelopeState::InFlight {
            attempt: self.attempts,
        };

        let mut headers = self.headers.clone();
        headers.push((
            "Idempotency-Key".to_string(),
            self.idempotency_key.to_string(),
        ));
        if self.body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        Some(TransportRequest {
            method: self.method,
            url: self.url.clone(),
            body: self.body.clone(),
            headers,
        })
    }

    /// Decide what follows a failed attempt. Connectivity is sampled by the
    /// caller at the moment of failure.
    pub(crate) fn on_failure(&mut self, online: bool, retry_budget: u32) -> FailureDisposition {
        if !online {
            FailureDisposition::Requeue
        } else if self.retries < retry_budget {
            self.retries += 1;
            FailureDisposition::Retry
        } else {
            FailureDisposition::GiveUp
        }
    }

    /// Queue exit during a drain: in flight again before the resend starts.
    pub(crate) fn mark_dispatching(&mut self) {
        if self.state == EnvelopeState::Queued {
            self.state = EnvelopeState::InFlight {
                attempt: self.attempts,
            };
        }
    }

    pub(crate) fn mark_queued(&mut self) -> bool {
        if !self.state.can_transition_to_queued() {
            return false;
        }
        self.state = EnvelopeState::Queued;
        true
    }

    /// Deliver the outcome. Returns `false` if the envelope was already
    /// resolved; the first outcome always wins.
    pub(crate) fn resolve(&mut self, outcome: Outcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = EnvelopeState::state_for(&outcome);
        match self.completer.take() {
            // A dropped receiver only means nobody is listening any more.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => true,
        }
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.resolve(Outcome::Cancelled);
        }
    }
}
