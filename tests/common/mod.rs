#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_dispatch::{
    Dispatcher, DispatcherConfig, Method, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

pub const BASE_URL: &str = "https://cj101d.ifdnrg.com/";
pub const DEVICE_ID: &str = "test-uuid";

pub fn echo_url() -> String {
    format!("{BASE_URL}device/{DEVICE_ID}")
}

pub fn url(path: &str) -> String {
    format!("{BASE_URL}{path}")
}

pub fn config() -> DispatcherConfig {
    DispatcherConfig::new(BASE_URL, DEVICE_ID)
}

pub fn dispatcher(server: &Arc<ScriptedServer>) -> Arc<Dispatcher<ScriptedServer>> {
    dispatcher_with(server, config())
}

pub fn dispatcher_with(
    server: &Arc<ScriptedServer>,
    config: DispatcherConfig,
) -> Arc<Dispatcher<ScriptedServer>> {
    init_tracing();
    Dispatcher::new(Arc::clone(server), config).expect("valid test config")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` on a 10ms tick (virtual time) for up to a minute.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..6_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within a minute of virtual time");
}

// ============================================================================
// Scripted server
// ============================================================================

struct Route {
    method: Method,
    url: String,
    status: u16,
    body: String,
    auto: bool,
}

struct Held {
    request: TransportRequest,
    reply: oneshot::Sender<Result<TransportResponse, TransportError>>,
}

#[derive(Default)]
struct ServerState {
    routes: Vec<Route>,
    held: Vec<Held>,
    log: Vec<(Instant, TransportRequest)>,
    lose: usize,
    fail: usize,
}

/// In-memory backend. Requests are held until [`ScriptedServer::respond`]
/// unless their route answers automatically.
#[derive(Default)]
pub struct ScriptedServer {
    state: Mutex<ServerState>,
    arrived: Notify,
}

impl ScriptedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the answer for `method url`.
    pub fn respond_with(&self, method: Method, url: &str, status: u16, body: &str, auto: bool) {
        let mut state = self.state.lock().unwrap();
        state.routes.retain(|r| !(r.method == method && r.url == url));
        state.routes.push(Route {
            method,
            url: url.to_string(),
            status,
            body: body.to_string(),
            auto,
        });
    }

    /// The next `n` requests vanish without an answer.
    pub fn lose_next(&self, n: usize) {
        self.state.lock().unwrap().lose += n;
    }

    /// The next `n` requests fail with a network error.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail += n;
    }

    /// Answer every held request from the route table; unrouted ones get 404.
    /// Returns how many were answered.
    pub fn respond(&self) -> usize {
        let (held, answers) = {
            let mut state = self.state.lock().unwrap();
            let held: Vec<Held> = state.held.drain(..).collect();
            let answers: Vec<TransportResponse> = held
                .iter()
                .map(|h| Self::answer(&state.routes, &h.request))
                .collect();
            (held, answers)
        };
        let count = held.len();
        for (h, answer) in held.into_iter().zip(answers) {
            let _ = h.reply.send(Ok(answer));
        }
        count
    }

    /// Drop every held request; their senders will time out.
    pub fn forget(&self) {
        self.state.lock().unwrap().held.clear();
    }

    pub fn held(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn arrival_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().log.iter().map(|(at, _)| *at).collect()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    /// Wait (in virtual time) until at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.arrived.notified();
                if self.request_count() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {n} requests, saw {}", self.request_count()));
    }

    fn answer(routes: &[Route], request: &TransportRequest) -> TransportResponse {
        routes
            .iter()
            .find(|r| r.method == request.method && r.url == request.url)
            .map_or(
                TransportResponse {
                    status: 404,
                    body: Vec::new(),
                },
                |r| TransportResponse {
                    status: r.status,
                    body: r.body.as_bytes().to_vec(),
                },
            )
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedServer {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            state.log.push((Instant::now(), request.clone()));
            self.arrived.notify_waiters();

            if state.lose > 0 {
                state.lose -= 1;
                None
            } else if state.fail > 0 {
                state.fail -= 1;
                return Err(TransportError::network("connection refused"));
            } else if let Some(route) = state
                .routes
                .iter()
                .find(|r| r.auto && r.method == request.method && r.url == request.url)
            {
                return Ok(TransportResponse {
                    status: route.status,
                    body: route.body.as_bytes().to_vec(),
                });
            } else {
                let (reply, rx) = oneshot::channel();
                state.held.push(Held { request, reply });
                Some(rx)
            }
        };

        match rx {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}
