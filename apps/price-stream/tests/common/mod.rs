//! Shared harness for the integration tests: a scripted price source and a
//! real tonic server on an ephemeral port backed by in-memory stores.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};

use price_stream::proto::price_service_client::PriceServiceClient;
use price_stream::proto::price_service_server::PriceServiceServer;
use price_stream::proto::{SubscribeRequest, SubscribeResponse};
use price_stream::{
    Backends, BroadcastFanout, HistoryStore, InMemoryHistoryStore, PipelineConfig,
    PriceObservation, PriceSource, PriceSourceError, PriceStreamServer, PriceStreamServerConfig,
    StoreError, SubscriptionCoordinator,
};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll interval used by test servers.
pub const POLL: Duration = Duration::from_millis(20);

/// Price source that knows a fixed set of instruments.
///
/// Each fetch returns the next tick: one second later than the previous one,
/// starting a second after construction, priced `base + tick`.
pub struct ScriptedSource {
    prices: HashMap<String, f64>,
    origin: DateTime<Utc>,
    tick: AtomicI64,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(prices: &[(&str, f64)]) -> Self {
        Self {
            prices: prices
                .iter()
                .map(|(code, price)| ((*code).to_string(), *price))
                .collect(),
            origin: Utc::now().trunc_subsecs(0) + TimeDelta::seconds(1),
            tick: AtomicI64::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceObservation, PriceSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(base) = self.prices.get(instrument) else {
            return Err(PriceSourceError::NotFound {
                instrument: instrument.to_string(),
            });
        };
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss)]
        let price = base + tick as f64;
        Ok(PriceObservation::new(
            instrument,
            self.origin + TimeDelta::seconds(tick),
            price,
        ))
    }
}

/// In-memory history store that fails every call while `down` is set.
pub struct SwitchableStore {
    inner: Arc<InMemoryHistoryStore>,
    down: Arc<AtomicBool>,
}

impl SwitchableStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SwitchableStore {
    async fn write(&self, observation: &PriceObservation) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write(observation).await
    }

    async fn query_range(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        self.check()?;
        self.inner.query_range(instrument, from, to).await
    }
}

/// A running server and the handles tests poke at.
pub struct TestServer {
    pub addr: SocketAddr,
    pub coordinator: Arc<SubscriptionCoordinator>,
    pub grpc: Arc<PriceStreamServer>,
    pub store: Arc<InMemoryHistoryStore>,
    pub source: Arc<ScriptedSource>,
    pub shutdown: CancellationToken,
    store_down: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(source: ScriptedSource) -> Self {
        Self::start_with(source, PriceStreamServerConfig::default()).await
    }

    pub async fn start_with(source: ScriptedSource, config: PriceStreamServerConfig) -> Self {
        let source = Arc::new(source);
        let store = Arc::new(InMemoryHistoryStore::new());
        let store_down = Arc::new(AtomicBool::new(false));
        let backends = Backends {
            source: Arc::clone(&source) as Arc<dyn PriceSource>,
            store: Arc::new(SwitchableStore {
                inner: Arc::clone(&store),
                down: Arc::clone(&store_down),
            }),
            fanout: Arc::new(BroadcastFanout::with_defaults()),
        };
        let coordinator = Arc::new(SubscriptionCoordinator::new(
            backends,
            PipelineConfig {
                poll_interval: POLL,
                delivery_buffer: config.delivery_buffer,
            },
        ));

        let shutdown = CancellationToken::new();
        let grpc = Arc::new(PriceStreamServer::new(
            Arc::clone(&coordinator),
            config,
            shutdown.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let service = PriceServiceServer::from_arc(Arc::clone(&grpc));
        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    server_shutdown.cancelled_owned(),
                )
                .await
                .unwrap();
        });

        Self {
            addr,
            coordinator,
            grpc,
            store,
            source,
            shutdown,
            store_down,
            handle,
        }
    }

    /// Make every history store call fail until set back to `false`.
    pub fn set_store_down(&self, down: bool) {
        self.store_down.store(down, Ordering::SeqCst);
    }

    pub async fn client(&self) -> PriceServiceClient<Channel> {
        PriceServiceClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    /// Cache a past observation `secs_ago` seconds before now.
    pub async fn seed(&self, instrument: &str, secs_ago: i64, price: f64) -> PriceObservation {
        let observation =
            PriceObservation::new(instrument, Utc::now() - TimeDelta::seconds(secs_ago), price);
        self.store.write(&observation).await.unwrap();
        observation
    }

    /// Cancel the shutdown token and give the server a moment to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), self.handle)
            .await
            .is_err()
        {
            abort.abort();
        }
    }
}

pub fn request(currencies: &[&str], start_time: &str) -> SubscribeRequest {
    SubscribeRequest {
        currencies: currencies.iter().map(|c| (*c).to_string()).collect(),
        start_time: start_time.to_string(),
    }
}

pub fn rfc3339_ago(secs: i64) -> String {
    (Utc::now() - TimeDelta::seconds(secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Next message of `stream`, failing the test on timeout, error or end.
pub async fn next(stream: &mut tonic::Streaming<SubscribeResponse>) -> SubscribeResponse {
    tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("timed out waiting for a price update")
        .expect("stream failed")
        .expect("stream ended")
}

/// Wait until `condition` holds, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
