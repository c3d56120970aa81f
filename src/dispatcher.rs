use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{normalize_base_url, DispatcherConfig};
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::envelope::{Completion, Envelope, EnvelopeId, FailureDisposition, Outcome};
use crate::error::{DispatchError, TransportError};
use crate::metrics::{DispatcherMetrics, MetricsSnapshot};
use crate::queue::PendingQueue;
use crate::transport::{Transport, TransportRequest, TransportResponse};

struct DispatcherState {
    connectivity: Connectivity,
    queue: PendingQueue,
    /// Envelopes currently owned by a delivery task.
    in_flight: HashSet<EnvelopeId>,
    /// In-flight envelopes replaced by a newer one; never sent again.
    superseded: HashSet<EnvelopeId>,
    shut_down: bool,
}

impl DispatcherState {
    /// Forget a delivery task's envelope. Returns whether it was superseded.
    fn land(&mut self, id: EnvelopeId) -> bool {
        self.in_flight.remove(&id);
        self.superseded.remove(&id)
    }

    /// Like [`land`](Self::land), but only for a superseded envelope.
    fn land_if_superseded(&mut self, id: EnvelopeId) -> bool {
        self.superseded.contains(&id) && self.land(id)
    }
}

/// Decides, for every envelope, whether to send now, retry, queue or fail.
///
/// Sole owner of the connectivity flag, the pending queue and the echo
/// probe. Construct one per process with [`Dispatcher::new`] and hand the
/// `Arc` to whoever builds envelopes.
pub struct Dispatcher<T: Transport + 'static> {
    transport: Arc<T>,
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    metrics: Arc<DispatcherMetrics>,
    runtime: Handle,
}

impl<T: Transport + 'static> Dispatcher<T> {
    #[instrument(skip(transport, config), fields(base_url = %config.base_url))]
    pub fn new(transport: Arc<T>, mut config: DispatcherConfig) -> Result<Arc<Self>, DispatchError> {
        config.base_url = normalize_base_url(config.base_url);
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        info!(
            queue_capacity = config.queue_capacity,
            retry_budget = config.retry_budget,
            "Dispatcher started"
        );

        Ok(Arc::new(Self {
            transport,
            state: Mutex::new(DispatcherState {
                connectivity: Connectivity::new(),
                queue: PendingQueue::new(config.queue_capacity),
                in_flight: HashSet::new(),
                superseded: HashSet::new(),
                shut_down: false,
            }),
            config,
            metrics: Arc::new(DispatcherMetrics::new()),
            runtime,
        }))
    }

    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Hand an envelope over for delivery.
    ///
    /// Offline admission is decided before this returns: a full queue
    /// resolves the completion with [`Outcome::Rejected`] immediately.
    #[instrument(skip(self, envelope), fields(envelope_id = %envelope.id(), method = %envelope.method()))]
    pub fn submit(self: &Arc<Self>, mut envelope: Envelope) -> Completion {
        let completion = envelope.completion();
        DispatcherMetrics::incr(&self.metrics.envelopes_submitted);

        let mut state = self.state();
        if state.shut_down {
            drop(state);
            debug!("Dispatcher is shut down, cancelling envelope");
            self.resolve(&mut envelope, Outcome::Cancelled);
            return completion;
        }
        if !state.connectivity.is_online() {
            self.enqueue_locked(&mut state, envelope);
            return completion;
        }
        state.in_flight.insert(envelope.id());
        drop(state);

        let this = Arc::clone(self);
        self.runtime.spawn(this.deliver(envelope));
        completion
    }

    /// Replace an envelope with a newer one.
    ///
    /// A queued predecessor resolves with [`Outcome::Superseded`] at once.
    /// One that is in flight finishes its current attempt; if that attempt
    /// fails it resolves [`Outcome::Superseded`] instead of being retried or
    /// requeued.
    #[instrument(skip(self, replacement), fields(replacement_id = %replacement.id()))]
    pub fn supersede(self: &Arc<Self>, previous: EnvelopeId, replacement: Envelope) -> Completion {
        let removed = {
            let mut state = self.state();
            let removed = state.queue.remove(previous);
            if removed.is_none() && state.in_flight.contains(&previous) {
                debug!(%previous, "Superseding in-flight envelope");
                state.superseded.insert(previous);
            }
            removed
        };
        if let Some(mut old) = removed {
            info!(%previous, "Superseding queued envelope");
            self.resolve(&mut old, Outcome::Superseded);
        }
        self.submit(replacement)
    }

    fn enqueue_locked(&self, state: &mut DispatcherState, envelope: Envelope) {
        let id = envelope.id();
        match state.queue.insert(envelope) {
            Ok(()) => {
                debug!(envelope_id = %id, queue_len = state.queue.len(), "Envelope queued");
            }
            Err(mut refused) => {
                warn!(
                    envelope_id = %id,
                    capacity = state.queue.capacity(),
                    "Pending queue full, rejecting envelope"
                );
                self.resolve(&mut refused, Outcome::Rejected);
            }
        }
    }

    /// Park an envelope coming back from a delivery task.
    fn enqueue(&self, mut envelope: Envelope) {
        let mut state = self.state();
        let superseded = state.land(envelope.id());
        if superseded || state.shut_down {
            drop(state);
            let outcome = if superseded {
                debug!(envelope_id = %envelope.id(), "Superseded while in flight, not requeueing");
                Outcome::Superseded
            } else {
                Outcome::Cancelled
            };
            self.resolve(&mut envelope, outcome);
            return;
        }
        self.enqueue_locked(&mut state, envelope);
    }

    /// Finish a delivery task's envelope with `outcome`.
    fn settle(&self, envelope: &mut Envelope, outcome: Outcome) {
        self.state().land(envelope.id());
        self.resolve(envelope, outcome);
    }

    fn resolve(&self, envelope: &mut Envelope, outcome: Outcome) {
        let counter = match &outcome {
            Outcome::Response { .. } => &self.metrics.envelopes_completed,
            Outcome::Unreachable => &self.metrics.unreachable,
            Outcome::Rejected => &self.metrics.rejections,
            Outcome::Superseded => &self.metrics.superseded,
            Outcome::Cancelled => &self.metrics.cancelled,
        };
        if envelope.resolve(outcome) {
            DispatcherMetrics::incr(counter);
        }
    }

    // ------------------------------------------------------------------
    // Retry automaton
    // ------------------------------------------------------------------

    async fn attempt(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        DispatcherMetrics::incr(&self.metrics.attempts_sent);
        match tokio::time::timeout(self.config.request_timeout(), self.transport.send(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn deliver(self: Arc<Self>, mut envelope: Envelope) {
        loop {
            if !self.is_online() {
                debug!(envelope_id = %envelope.id(), "Offline at send time");
                self.enqueue(envelope);
                return;
            }
            let Some(request) = envelope.begin_attempt() else {
                self.state().land(envelope.id());
                return;
            };
            debug!(
                envelope_id = %envelope.id(),
                attempt = envelope.attempts(),
                url = %request.url,
                "Sending envelope"
            );

            match self.attempt(request).await {
                Ok(response) => {
                    debug!(envelope_id = %envelope.id(), status = response.status, "Envelope answered");
                    let outcome = Outcome::from_response(response, envelope.expects_body());
                    self.settle(&mut envelope, outcome);
                    return;
                }
                Err(error) => {
                    // Connectivity is re-read now, not at send time.
                    let online = self.is_online();
                    match envelope.on_failure(online, self.config.retry_budget) {
                        FailureDisposition::Retry
                            if self.state().land_if_superseded(envelope.id()) =>
                        {
                            debug!(envelope_id = %envelope.id(), %error, "Superseded, not retrying");
                            self.resolve(&mut envelope, Outcome::Superseded);
                            return;
                        }
                        FailureDisposition::Retry => {
                            DispatcherMetrics::incr(&self.metrics.retries);
                            debug!(envelope_id = %envelope.id(), %error, "Attempt failed, resending");
                        }
                        FailureDisposition::Requeue => {
                            DispatcherMetrics::incr(&self.metrics.requeues);
                            info!(envelope_id = %envelope.id(), %error, "Attempt failed while offline, requeueing");
                            self.enqueue(envelope);
                            return;
                        }
                        FailureDisposition::GiveUp => {
                            warn!(
                                envelope_id = %envelope.id(),
                                attempts = envelope.attempts(),
                                %error,
                                "Retries exhausted"
                            );
                            self.settle(&mut envelope, Outcome::Unreachable);
                            return;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Connectivity and echo probe
    // ------------------------------------------------------------------

    /// The network went away. New sends go to the pending queue.
    #[instrument(skip(self))]
    pub fn mark_offline(&self) {
        if self.state().connectivity.mark_offline() {
            info!("Network offline");
        }
    }

    /// The network came back. Confirms reachability with an echo probe
    /// before the pending queue is drained.
    #[instrument(skip(self))]
    pub fn mark_online(self: &Arc<Self>) {
        let launch = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.connectivity.mark_online()
        };
        if !launch {
            debug!("Echo probe already outstanding");
            return;
        }

        info!("Network online, sending echo probe");
        DispatcherMetrics::incr(&self.metrics.echo_probes);
        let this = Arc::clone(self);
        self.runtime.spawn(this.run_probe());
    }

    pub fn apply(self: &Arc<Self>, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => self.mark_online(),
            NetworkStatus::Offline => self.mark_offline(),
        }
    }

    /// Feed transitions from a platform status channel until it closes.
    /// The channel's current value is only applied if it disagrees with
    /// the dispatcher.
    pub fn follow(self: &Arc<Self>, mut statuses: watch::Receiver<NetworkStatus>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut last = *statuses.borrow_and_update();
            if NetworkStatus::from(this.is_online()) != last {
                this.apply(last);
            }
            while statuses.changed().await.is_ok() {
                let status = *statuses.borrow_and_update();
                if status != last {
                    this.apply(status);
                    last = status;
                }
            }
            debug!("Network status channel closed");
        })
    }

    async fn run_probe(self: Arc<Self>) {
        let mut probe = Envelope::get(self.config.echo_url());
        let confirmed = loop {
            if !self.is_online() {
                break false;
            }
            let Some(request) = probe.begin_attempt() else {
                break false;
            };
            match self.attempt(request).await {
                Ok(response) => {
                    debug!(status = response.status, "Echo answered");
                    probe.resolve(Outcome::from_response(response, false));
                    break true;
                }
                Err(error) => match probe.on_failure(self.is_online(), self.config.retry_budget) {
                    FailureDisposition::Retry => {
                        debug!(%error, "Echo failed, resending after delay");
                        tokio::time::sleep(self.config.echo_retry_delay()).await;
                    }
                    FailureDisposition::Requeue | FailureDisposition::GiveUp => {
                        warn!(%error, "Echo probe failed, queue stays parked");
                        probe.resolve(Outcome::Unreachable);
                        break false;
                    }
                },
            }
        };

        if !confirmed {
            DispatcherMetrics::incr(&self.metrics.echo_failures);
        }
        self.finish_probe(confirmed);
    }

    fn finish_probe(self: &Arc<Self>, confirmed: bool) {
        let drained = {
            let mut state = self.state();
            state.connectivity.probe_finished();
            if !confirmed || state.shut_down || !state.connectivity.is_online() {
                return;
            }
            let mut drained = state.queue.take_all();
            for envelope in &mut drained {
                envelope.mark_dispatching();
                state.in_flight.insert(envelope.id());
            }
            drained
        };

        DispatcherMetrics::incr(&self.metrics.drains);
        if drained.is_empty() {
            debug!("Echo confirmed, nothing queued");
            return;
        }
        info!(count = drained.len(), "Echo confirmed, draining pending queue");

        // join_all polls in order, so resends start in submission order.
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            join_all(
                drained
                    .into_iter()
                    .map(|envelope| Arc::clone(&this).deliver(envelope)),
            )
            .await;
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle and observers
    // ------------------------------------------------------------------

    /// Cancel everything still queued and refuse further work.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let cancelled = {
            let mut state = self.state();
            state.shut_down = true;
            state.queue.take_all()
        };
        info!(cancelled = cancelled.len(), "Dispatcher shut down");
        for mut envelope in cancelled {
            self.resolve(&mut envelope, Outcome::Cancelled);
        }
    }

    pub fn is_online(&self) -> bool {
        self.state().connectivity.is_online()
    }

    pub fn probe_in_flight(&self) -> bool {
        self.state().connectivity.probe_in_flight()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn queued_ids(&self) -> Vec<EnvelopeId> {
        self.state().queue.ids()
    }

    pub fn is_queued(&self, id: EnvelopeId) -> bool {
        self.state().queue.contains(id)
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
