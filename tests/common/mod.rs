//! Scripted in-memory transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest_identity_pool::{
    ChallengeSolver, ClientPool, Connector, HttpRequest, HttpResponse, PoolConfig,
    PoolConfigBuilder, ProxyDescriptor, Transport, TransportError,
};

pub const LIVENESS: &str = "https://www.example.test/robots.txt";
pub const METADATA: &str = "https://captcha.example.test/metadata";
pub const PROBE: &str = "https://users.example.test/authenticated";

pub type Reply = Result<HttpResponse, TransportError>;
type Responder = Box<dyn Fn(&HttpRequest) -> Option<Reply> + Send + Sync>;

/// One request as seen on the wire.
#[derive(Debug, Clone)]
pub struct Call {
    /// `address:port` of the proxy, `None` for the direct identity.
    pub proxy: Option<String>,
    pub request: HttpRequest,
}

#[derive(Default)]
pub struct MockState {
    scripted: Mutex<HashMap<(Option<String>, String), VecDeque<Reply>>>,
    responder: Mutex<Option<Responder>>,
    calls: Mutex<Vec<Call>>,
}

impl MockState {
    /// Queue a reply for any identity requesting `url`.
    pub fn reply(&self, url: &str, reply: Reply) {
        self.queue(None, url, reply);
    }

    /// Queue a reply for requests to `url` through one proxy.
    pub fn reply_via(&self, proxy: &ProxyDescriptor, url: &str, reply: Reply) {
        self.queue(Some(proxy.to_string()), url, reply);
    }

    fn queue(&self, proxy: Option<String>, url: &str, reply: Reply) {
        self.scripted
            .lock()
            .entry((proxy, url.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Answer requests dynamically; scripted replies take precedence.
    pub fn respond_with(&self, responder: impl Fn(&HttpRequest) -> Option<Reply> + Send + Sync + 'static) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, url: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.request.url == url)
            .cloned()
            .collect()
    }

    fn next(&self, proxy: &Option<String>, request: &HttpRequest) -> Reply {
        let mut scripted = self.scripted.lock();
        for key in [
            (proxy.clone(), request.url.clone()),
            (None, request.url.clone()),
        ] {
            if let Some(reply) = scripted.get_mut(&key).and_then(VecDeque::pop_front) {
                return reply;
            }
        }
        drop(scripted);

        if let Some(responder) = self.responder.lock().as_ref() {
            if let Some(reply) = responder(request) {
                return reply;
            }
        }
        Ok(HttpResponse::new(http::StatusCode::OK))
    }
}

pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl Connector for MockConnector {
    fn connect(&self, proxy: Option<&ProxyDescriptor>) -> reqwest_identity_pool::Result<Arc<dyn Transport>> {
        Ok(Arc::new(MockTransport {
            proxy: proxy.map(ToString::to_string),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockTransport {
    proxy: Option<String>,
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.state.calls.lock().push(Call {
            proxy: self.proxy.clone(),
            request: request.clone(),
        });
        self.state.next(&self.proxy, &request)
    }
}

/// Builder with test endpoints and no background metadata polling.
pub fn config() -> PoolConfigBuilder {
    PoolConfig::builder()
        .liveness_url(LIVENESS)
        .challenge_metadata_url(METADATA)
        .credential_probe_url(PROBE)
        .challenge_metadata_interval(None)
}

pub async fn pool(config: PoolConfigBuilder) -> (Arc<ClientPool>, Arc<MockState>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = Arc::new(MockState::default());
    let connector = Arc::new(MockConnector {
        state: Arc::clone(&state),
    });
    let pool = ClientPool::with_connector(config.build(), connector)
        .await
        .expect("pool builds");
    (pool, state)
}

pub fn proxy(n: u16) -> ProxyDescriptor {
    ProxyDescriptor::new(format!("10.0.0.{n}"), 1080)
}

pub fn status(code: u16) -> Reply {
    Ok(HttpResponse::new(
        http::StatusCode::from_u16(code).expect("valid status"),
    ))
}

/// Solver that records its calls and answers with a fixed token.
#[derive(Default)]
pub struct RecordingSolver {
    pub calls: Mutex<Vec<(String, Option<ProxyDescriptor>)>>,
}

#[async_trait]
impl ChallengeSolver for RecordingSolver {
    async fn solve(&self, site_key: &str, proxy: Option<&ProxyDescriptor>) -> anyhow::Result<String> {
        self.calls
            .lock()
            .push((site_key.to_string(), proxy.cloned()));
        Ok("solved-token".to_string())
    }
}
