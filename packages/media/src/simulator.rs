//! In-memory media engine.
//!
//! Behaves like the real engine as far as the coordination layer can tell:
//! ids are unique, closing cascades from transports to producers to
//! consumers, closing twice fails with [`MediaError::AlreadyClosed`] and
//! `can_consume` honours the client's codec list. No packets are moved.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use proximity_config::MediaConfig;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    Consumer, DtlsParameters, MediaEngine, MediaError, MediaKind, Producer, RtpCapabilities,
    RtpParameters, Transport, TransportOptions, TransportParams,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Operations that can be made to fail once, see
/// [`SimulatedMediaEngine::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailPoint {
    CreateTransport,
    Connect,
    Produce,
    Consume,
}

#[derive(Debug)]
struct Inner {
    capabilities: RtpCapabilities,
    announced_ip: String,
    min_port: u16,
    max_port: u16,
    next_port: AtomicU16,
    producers: Mutex<BTreeMap<String, Arc<SimProducer>>>,
    failures: Mutex<BTreeSet<FailPoint>>,
    open_transports: AtomicUsize,
    open_consumers: AtomicUsize,
    latency: Mutex<Duration>,
    died: CancellationToken,
}

impl Inner {
    async fn settle(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(&self, point: FailPoint) -> Result<(), MediaError> {
        if lock(&self.failures).remove(&point) {
            return Err(MediaError::Engine(format!("injected {point:?} failure")));
        }
        Ok(())
    }

    fn allocate_port(&self) -> u16 {
        let span = self.max_port.saturating_sub(self.min_port).saturating_add(1);
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        self.min_port + offset
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedMediaEngine {
    inner: Arc<Inner>,
}

impl Default for SimulatedMediaEngine {
    fn default() -> Self {
        Self::new(&MediaConfig::default())
    }
}

impl SimulatedMediaEngine {
    #[must_use]
    pub fn new(config: &MediaConfig) -> Self {
        let codecs = config
            .router
            .media_codecs
            .iter()
            .enumerate()
            .map(|(i, codec)| {
                let mut value = serde_json::to_value(codec).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert("preferredPayloadType".to_string(), json!(100 + i));
                }
                value
            })
            .collect::<Vec<_>>();

        let announced_ip = config
            .web_rtc_transport
            .listen_ips
            .first()
            .map_or_else(
                || "127.0.0.1".to_string(),
                |ip| ip.announced_ip.clone().unwrap_or_else(|| ip.ip.clone()),
            );

        log::debug!(
            "SimulatedMediaEngine: standing in for {} worker(s) (log level {}, tags {:?}), \
             max incoming bitrate {:?}, initial outgoing bitrate {}",
            config.num_workers,
            config.worker.log_level,
            config.worker.log_tags,
            config.web_rtc_transport.max_incoming_bitrate,
            config.web_rtc_transport.initial_available_outgoing_bitrate,
        );

        Self {
            inner: Arc::new(Inner {
                capabilities: RtpCapabilities(json!({
                    "codecs": codecs,
                    "headerExtensions": [],
                })),
                announced_ip,
                min_port: config.worker.rtc_min_port,
                max_port: config.worker.rtc_max_port,
                next_port: AtomicU16::new(0),
                producers: Mutex::new(BTreeMap::new()),
                failures: Mutex::new(BTreeSet::new()),
                open_transports: AtomicUsize::new(0),
                open_consumers: AtomicUsize::new(0),
                latency: Mutex::new(Duration::ZERO),
                died: CancellationToken::new(),
            }),
        }
    }

    /// Makes the next call reaching `point` fail with [`MediaError::Engine`].
    pub fn fail_next(&self, point: FailPoint) {
        lock(&self.inner.failures).insert(point);
    }

    /// Makes every transport, connect, produce and consume call suspend for
    /// `latency` before doing its work, like a round trip to a worker would.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Simulates the worker process dying.
    pub fn kill(&self) {
        log::error!("SimulatedMediaEngine: worker killed");
        self.inner.died.cancel();
    }

    #[must_use]
    pub fn open_producer_count(&self) -> usize {
        lock(&self.inner.producers).len()
    }

    #[must_use]
    pub fn open_consumer_count(&self) -> usize {
        self.inner.open_consumers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_transport_count(&self) -> usize {
        self.inner.open_transports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for SimulatedMediaEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities.clone()
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<(Arc<dyn Transport>, TransportParams), MediaError> {
        self.inner.settle().await;
        self.inner.check_failure(FailPoint::CreateTransport)?;

        let id = new_id();
        let protocol = if options.force_tcp { "tcp" } else { "udp" };
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": new_id(),
                "password": new_id(),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": format!("{protocol}candidate"),
                "ip": self.inner.announced_ip,
                "port": self.inner.allocate_port(),
                "priority": 1_076_302_079_u32,
                "protocol": protocol,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": new_id() }],
            }),
        };

        self.inner.open_transports.fetch_add(1, Ordering::SeqCst);
        log::trace!("SimulatedMediaEngine: created transport {id}");

        let transport = SimTransport {
            id,
            engine: Arc::downgrade(&self.inner),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            producers: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
        };

        Ok((Arc::new(transport) as Arc<dyn Transport>, params))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        lock(&self.inner.producers)
            .get(producer_id)
            .is_some_and(|producer| rtp_capabilities.supports(producer.kind.engine_kind()))
    }

    async fn died(&self) {
        self.inner.died.cancelled().await;
    }
}

#[derive(Debug)]
struct SimTransport {
    id: String,
    engine: Weak<Inner>,
    closed: AtomicBool,
    connected: AtomicBool,
    producers: Mutex<Vec<Arc<SimProducer>>>,
    consumers: Mutex<Vec<Arc<SimConsumer>>>,
}

impl SimTransport {
    fn engine(&self) -> Result<Arc<Inner>, MediaError> {
        self.engine
            .upgrade()
            .ok_or_else(|| MediaError::Engine("engine dropped".to_string()))
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::AlreadyClosed(format!("Transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError> {
        self.ensure_open()?;
        let engine = self.engine()?;
        engine.settle().await;
        engine.check_failure(FailPoint::Connect)?;

        if !dtls_parameters.0.is_object() {
            return Err(MediaError::InvalidParameters(format!(
                "DTLS parameters must be an object, got {}",
                dtls_parameters.0
            )));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::AlreadyConnected(self.id.clone()));
        }

        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, MediaError> {
        self.ensure_open()?;
        let engine = self.engine()?;
        engine.settle().await;
        engine.check_failure(FailPoint::Produce)?;

        if !rtp_parameters.0.is_object() {
            return Err(MediaError::InvalidParameters(format!(
                "RTP parameters must be an object, got {}",
                rtp_parameters.0
            )));
        }

        let producer = Arc::new(SimProducer {
            id: new_id(),
            kind,
            engine: Arc::downgrade(&engine),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(vec![]),
        });

        lock(&engine.producers).insert(producer.id.clone(), producer.clone());
        lock(&self.producers).push(producer.clone());
        log::trace!("SimulatedMediaEngine: {kind} producer {} on {}", producer.id, self.id);

        Ok(producer as Arc<dyn Producer>)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, MediaError> {
        self.ensure_open()?;
        let engine = self.engine()?;
        engine.settle().await;
        engine.check_failure(FailPoint::Consume)?;

        let producer = lock(&engine.producers)
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;

        let engine_kind = producer.kind.engine_kind();
        if !rtp_capabilities.supports(engine_kind) {
            return Err(MediaError::CannotConsume(producer_id.to_string()));
        }

        let codecs = rtp_capabilities
            .0
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|c| c.get("kind").and_then(Value::as_str) == Some(engine_kind.as_ref()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let consumer = Arc::new(SimConsumer {
            id: new_id(),
            kind: producer.kind,
            producer_id: producer.id.clone(),
            rtp_parameters: RtpParameters(json!({
                "codecs": codecs,
                "encodings": [{ "ssrc": engine.allocate_port() }],
                "mid": producer.id,
            })),
            engine: Arc::downgrade(&engine),
            closed: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
        });

        engine.open_consumers.fetch_add(1, Ordering::SeqCst);
        lock(&producer.consumers).push(Arc::downgrade(&consumer));
        lock(&self.consumers).push(consumer.clone());

        Ok(consumer as Arc<dyn Consumer>)
    }

    async fn close(&self) -> Result<(), MediaError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(MediaError::AlreadyClosed(format!("Transport {}", self.id)));
        }

        let producers = std::mem::take(&mut *lock(&self.producers));
        for producer in producers {
            producer.close_quietly();
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.close_quietly();
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.open_transports.fetch_sub(1, Ordering::SeqCst);
        }
        log::trace!("SimulatedMediaEngine: closed transport {}", self.id);

        Ok(())
    }
}

#[derive(Debug)]
struct SimProducer {
    id: String,
    kind: MediaKind,
    engine: Weak<Inner>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<SimConsumer>>>,
}

impl SimProducer {
    fn close_quietly(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(engine) = self.engine.upgrade() {
            lock(&engine.producers).remove(&self.id);
        }

        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_quietly();
        }

        true
    }
}

#[async_trait]
impl Producer for SimProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<(), MediaError> {
        if self.close_quietly() {
            Ok(())
        } else {
            Err(MediaError::AlreadyClosed(format!("Producer {}", self.id)))
        }
    }
}

#[derive(Debug)]
struct SimConsumer {
    id: String,
    kind: MediaKind,
    producer_id: String,
    rtp_parameters: RtpParameters,
    engine: Weak<Inner>,
    closed: AtomicBool,
    paused: AtomicBool,
}

impl SimConsumer {
    fn close_quietly(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.open_consumers.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    fn set_paused(&self, paused: bool) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::AlreadyClosed(format!("Consumer {}", self.id)));
        }
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Consumer for SimConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn consumer_type(&self) -> &str {
        "simple"
    }

    fn producer_paused(&self) -> bool {
        false
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.set_paused(true)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.set_paused(false)
    }

    async fn close(&self) -> Result<(), MediaError> {
        if self.close_quietly() {
            Ok(())
        } else {
            Err(MediaError::AlreadyClosed(format!("Consumer {}", self.id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn client_caps() -> RtpCapabilities {
        SimulatedMediaEngine::default().rtp_capabilities()
    }

    fn audio_only_caps() -> RtpCapabilities {
        RtpCapabilities(json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] }))
    }

    async fn producer(engine: &SimulatedMediaEngine, kind: MediaKind) -> Arc<dyn Producer> {
        let (transport, _) = engine
            .create_transport(&TransportOptions::default())
            .await
            .unwrap();
        transport
            .produce(kind, RtpParameters(json!({ "codecs": [] })))
            .await
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn router_capabilities_list_configured_codecs() {
        let caps = SimulatedMediaEngine::default().rtp_capabilities();

        let mime_types = caps.0["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["mimeType"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(mime_types, vec!["audio/opus", "video/VP8"]);
    }

    #[test_log::test(tokio::test)]
    async fn transports_get_unique_ids_and_configured_ports() {
        let engine = SimulatedMediaEngine::default();

        let (_, a) = engine.create_transport(&TransportOptions::default()).await.unwrap();
        let (_, b) = engine.create_transport(&TransportOptions::default()).await.unwrap();

        assert_ne!(a.id, b.id);
        let port = a.ice_candidates[0]["port"].as_u64().unwrap();
        assert!((10000..=11000).contains(&port));
        assert_eq!(a.ice_candidates[0]["ip"], "127.0.0.1");
        assert_eq!(engine.open_transport_count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn connecting_twice_fails() {
        let engine = SimulatedMediaEngine::default();
        let (transport, _) = engine.create_transport(&TransportOptions::default()).await.unwrap();

        transport.connect(DtlsParameters(json!({}))).await.unwrap();
        let err = transport.connect(DtlsParameters(json!({}))).await.unwrap_err();

        assert!(matches!(err, MediaError::AlreadyConnected(_)));
    }

    #[test_log::test(tokio::test)]
    async fn closing_twice_reports_already_closed() {
        let engine = SimulatedMediaEngine::default();
        let producer = producer(&engine, MediaKind::Audio).await;

        producer.close().await.unwrap();
        let err = producer.close().await.unwrap_err();

        assert!(err.is_already_closed());
        assert_eq!(engine.open_producer_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn can_consume_requires_a_matching_codec_kind() {
        let engine = SimulatedMediaEngine::default();
        let audio = producer(&engine, MediaKind::Audio).await;
        let video = producer(&engine, MediaKind::ScreenVideo).await;

        assert!(engine.can_consume(audio.id(), &audio_only_caps()));
        assert!(!engine.can_consume(video.id(), &audio_only_caps()));
        assert!(engine.can_consume(video.id(), &client_caps()));
        assert!(!engine.can_consume("missing", &client_caps()));
    }

    #[test_log::test(tokio::test)]
    async fn closing_a_producer_closes_its_consumers() {
        let engine = SimulatedMediaEngine::default();
        let producer = producer(&engine, MediaKind::Video).await;
        let (recv, _) = engine.create_transport(&TransportOptions::default()).await.unwrap();

        let consumer = recv.consume(producer.id(), &client_caps(), true).await.unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(engine.open_consumer_count(), 1);

        producer.close().await.unwrap();

        assert!(consumer.resume().await.unwrap_err().is_already_closed());
        assert!(consumer.close().await.unwrap_err().is_already_closed());
        assert_eq!(engine.open_consumer_count(), 0);
        assert!(!engine.can_consume(producer.id(), &client_caps()));
    }

    #[test_log::test(tokio::test)]
    async fn closing_a_transport_cascades() {
        let engine = SimulatedMediaEngine::default();
        let (send, _) = engine.create_transport(&TransportOptions::default()).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, RtpParameters(json!({})))
            .await
            .unwrap();

        send.close().await.unwrap();

        assert!(producer.close().await.unwrap_err().is_already_closed());
        assert!(send.close().await.unwrap_err().is_already_closed());
        assert_eq!(engine.open_transport_count(), 0);
        assert!(
            send.produce(MediaKind::Audio, RtpParameters(json!({})))
                .await
                .is_err()
        );
    }

    #[test_log::test(tokio::test)]
    async fn injected_failures_fire_once() {
        let engine = SimulatedMediaEngine::default();
        engine.fail_next(FailPoint::CreateTransport);

        assert!(engine.create_transport(&TransportOptions::default()).await.is_err());
        assert!(engine.create_transport(&TransportOptions::default()).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn latency_suspends_engine_calls() {
        let engine = SimulatedMediaEngine::default();
        engine.set_latency(Duration::from_millis(30));

        let started = tokio::time::Instant::now();
        let (transport, _) = engine.create_transport(&TransportOptions::default()).await.unwrap();
        transport.connect(DtlsParameters(json!({}))).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test_log::test(tokio::test)]
    async fn kill_resolves_died() {
        let engine = SimulatedMediaEngine::default();
        let watcher = engine.clone();
        let handle = tokio::spawn(async move { watcher.died().await });

        engine.kill();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
