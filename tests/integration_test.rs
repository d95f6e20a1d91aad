/// Integration tests for the wake-word server
///
/// Drives a real TCP supervisor with synthetic audio.

use futures::{SinkExt, StreamExt};
use std::f32::consts::PI;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use wakeword_server::detector::{samples_to_bytes, AudioSample, SAMPLE_RATE};
use wakeword_server::{
    AudioFormat, Detection, DetectorError, DetectorInfo, DetectorTemplate, EnergyConfig,
    EnergyTemplate, Frame, FrameCodec, KeywordDetector, Message, ServerConfig, SessionRegistry,
    SilentDetector, Supervisor, WindowSpec,
};

type Client = Framed<TcpStream, FrameCodec>;

/// Samples in one 100ms detector window
const WINDOW_SAMPLES: usize = 1600;

/// Generate synthetic audio tone
fn generate_tone(frequency: f32, num_samples: usize, amplitude: f32) -> Vec<AudioSample> {
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = amplitude * (2.0 * PI * frequency * t).sin();
            (sample * AudioSample::MAX as f32) as AudioSample
        })
        .collect()
}

fn detector_config() -> EnergyConfig {
    EnergyConfig {
        detector_name: "test".to_string(),
        window_ms: 100,
        stride_ms: 100,
        min_flush_ms: 50,
        trigger_windows: 1,
        refractory_windows: 0,
        ..Default::default()
    }
}

fn energy_template() -> Arc<dyn DetectorTemplate> {
    Arc::new(EnergyTemplate::new(detector_config(), "test-word", 0.5).unwrap())
}

/// Energy detector that panics on a window starting with `i16::MIN`
struct PoisonDetector {
    inner: Box<dyn KeywordDetector>,
}

impl KeywordDetector for PoisonDetector {
    fn info(&self) -> DetectorInfo {
        self.inner.info()
    }

    fn format(&self) -> AudioFormat {
        self.inner.format()
    }

    fn window(&self) -> WindowSpec {
        self.inner.window()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn process(
        &mut self,
        window: &[u8],
        stream_position: u64,
    ) -> Result<Vec<Detection>, DetectorError> {
        if window.starts_with(&AudioSample::MIN.to_le_bytes()) {
            panic!("poisoned window");
        }
        self.inner.process(window, stream_position)
    }
}

struct PoisonTemplate {
    inner: EnergyTemplate,
}

impl DetectorTemplate for PoisonTemplate {
    fn info(&self) -> DetectorInfo {
        self.inner.info()
    }

    fn instantiate(&self) -> Result<Box<dyn KeywordDetector>, DetectorError> {
        Ok(Box::new(PoisonDetector {
            inner: self.inner.instantiate()?,
        }))
    }
}

/// Energy detector that takes 50ms per window and counts its calls
struct SlowDetector {
    inner: Box<dyn KeywordDetector>,
    calls: Arc<AtomicUsize>,
}

impl KeywordDetector for SlowDetector {
    fn info(&self) -> DetectorInfo {
        self.inner.info()
    }

    fn format(&self) -> AudioFormat {
        self.inner.format()
    }

    fn window(&self) -> WindowSpec {
        self.inner.window()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn process(
        &mut self,
        window: &[u8],
        stream_position: u64,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.inner.process(window, stream_position)
    }
}

struct SlowTemplate {
    inner: EnergyTemplate,
    calls: Arc<AtomicUsize>,
}

impl DetectorTemplate for SlowTemplate {
    fn info(&self) -> DetectorInfo {
        self.inner.info()
    }

    fn instantiate(&self) -> Result<Box<dyn KeywordDetector>, DetectorError> {
        Ok(Box::new(SlowDetector {
            inner: self.inner.instantiate()?,
            calls: self.calls.clone(),
        }))
    }
}

struct TestServer {
    addr: SocketAddr,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

async fn start_server(template: Arc<dyn DetectorTemplate>, config: ServerConfig) -> TestServer {
    let supervisor = Supervisor::listen("127.0.0.1:0", template, &config)
        .await
        .unwrap();
    let addr = supervisor.local_addr().unwrap();
    let registry = supervisor.registry();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(supervisor.run(shutdown.clone()));

    TestServer {
        addr,
        registry,
        shutdown,
        handle,
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        shutdown_grace_secs: 1,
        ..Default::default()
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::default())
}

async fn recv(client: &mut Client) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for frame")
        .map(|frame| frame.expect("client decode failed").message)
}

/// Wait for `expected` events, then half-close and collect the rest
///
/// The server treats end of input as a disconnect, so events still owed for
/// audio already sent must be read before closing.
async fn finish(mut client: Client, expected: usize) -> Vec<Message> {
    let mut received = Vec::new();
    for _ in 0..expected {
        match recv(&mut client).await {
            Some(message) => received.push(message),
            None => return received,
        }
    }

    client.get_mut().shutdown().await.unwrap();
    while let Some(message) = recv(&mut client).await {
        received.push(message);
    }
    received
}

async fn describe(client: &mut Client) -> Message {
    client.send(Message::DescribeRequest.into()).await.unwrap();
    recv(client).await.expect("no describe-response")
}

async fn stream_audio(client: &mut Client, samples: &[AudioSample], chunks: usize) {
    client
        .send(
            Message::AudioStart {
                sample_rate: SAMPLE_RATE,
                format: "s16le".to_string(),
                channels: 1,
            }
            .into(),
        )
        .await
        .unwrap();

    let per_chunk = samples.len().div_ceil(chunks);
    for chunk in samples.chunks(per_chunk) {
        client
            .send(Frame::audio_chunk(samples_to_bytes(chunk)))
            .await
            .unwrap();
    }

    client.send(Message::AudioStop.into()).await.unwrap();
}

async fn wait_until_empty(registry: &SessionRegistry) {
    wait_until_empty_within(registry, Duration::from_secs(5)).await;
}

async fn wait_until_empty_within(registry: &SessionRegistry, limit: Duration) {
    tokio::time::timeout(limit, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions were not deregistered");
}

async fn stop(server: TestServer) {
    server.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_keyword_in_three_chunks_over_tcp() {
    let server = start_server(energy_template(), test_config()).await;
    let mut client = connect(server.addr).await;

    match describe(&mut client).await {
        Message::DescribeResponse {
            detector_name,
            sample_rate,
            format,
            channels,
            keywords,
            ..
        } => {
            assert_eq!(detector_name, "test");
            assert_eq!(sample_rate, 16000);
            assert_eq!(format, "s16le");
            assert_eq!(channels, 1);
            assert_eq!(keywords, vec!["test-word".to_string()]);
        }
        other => panic!("expected describe-response, got {:?}", other),
    }

    let keyword = generate_tone(440.0, WINDOW_SAMPLES, 0.9);
    stream_audio(&mut client, &keyword, 3).await;

    let received = finish(client, 1).await;
    assert_eq!(received.len(), 1, "unexpected events: {:?}", received);
    match &received[0] {
        Message::Detection {
            keyword_name,
            score,
            timestamp,
        } => {
            assert_eq!(keyword_name, "test-word");
            assert!(*score >= 0.5);
            assert_eq!(*timestamp, 100);
        }
        other => panic!("expected detection, got {:?}", other),
    }

    wait_until_empty(&server.registry).await;
    stop(server).await;
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let server = start_server(energy_template(), test_config()).await;

    let mut loud = connect(server.addr).await;
    let mut quiet = connect(server.addr).await;

    let keyword = generate_tone(440.0, WINDOW_SAMPLES * 2, 0.9);
    let silence = vec![0 as AudioSample; WINDOW_SAMPLES * 2];

    // Interleave both streams chunk by chunk
    let audio_start = Message::AudioStart {
        sample_rate: SAMPLE_RATE,
        format: "s16le".to_string(),
        channels: 1,
    };
    loud.send(audio_start.clone().into()).await.unwrap();
    quiet.send(audio_start.into()).await.unwrap();

    for (loud_chunk, quiet_chunk) in keyword.chunks(400).zip(silence.chunks(400)) {
        loud.send(Frame::audio_chunk(samples_to_bytes(loud_chunk)))
            .await
            .unwrap();
        quiet
            .send(Frame::audio_chunk(samples_to_bytes(quiet_chunk)))
            .await
            .unwrap();
    }

    loud.send(Message::AudioStop.into()).await.unwrap();
    quiet.send(Message::AudioStop.into()).await.unwrap();

    let (loud_events, quiet_events) = tokio::join!(finish(loud, 2), finish(quiet, 1));

    let timestamps: Vec<u64> = loud_events
        .iter()
        .filter_map(|m| match m {
            Message::Detection { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(timestamps, vec![100, 200]);

    assert_eq!(quiet_events, vec![Message::NotDetected]);

    stop(server).await;
}

#[tokio::test]
async fn test_many_sessions_each_detect_once() {
    let server = start_server(energy_template(), test_config()).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = connect(addr).await;
            let keyword = generate_tone(440.0, WINDOW_SAMPLES, 0.9);
            stream_audio(&mut client, &keyword, 4).await;
            finish(client, 1).await
        }));
    }

    for task in tasks {
        let events = task.await.unwrap();
        assert_eq!(events.len(), 1, "unexpected events: {:?}", events);
        assert!(matches!(events[0], Message::Detection { timestamp: 100, .. }));
    }

    wait_until_empty(&server.registry).await;
    stop(server).await;
}

#[tokio::test]
async fn test_malformed_client_does_not_affect_others() {
    let server = start_server(energy_template(), test_config()).await;

    let mut healthy = connect(server.addr).await;
    let mut broken = connect(server.addr).await;

    assert!(matches!(
        describe(&mut healthy).await,
        Message::DescribeResponse { .. }
    ));

    broken
        .get_mut()
        .write_all(b"this is not json\n")
        .await
        .unwrap();

    match recv(&mut broken).await {
        Some(Message::Error { code, .. }) => assert_eq!(code, "malformed-frame"),
        other => panic!("expected error frame, got {:?}", other),
    }
    assert!(recv(&mut broken).await.is_none());

    let keyword = generate_tone(440.0, WINDOW_SAMPLES, 0.9);
    stream_audio(&mut healthy, &keyword, 3).await;

    let events = finish(healthy, 1).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Message::Detection { .. }));

    stop(server).await;
}

#[tokio::test]
async fn test_detector_panic_is_contained_to_its_session() {
    let template = Arc::new(PoisonTemplate {
        inner: EnergyTemplate::new(detector_config(), "test-word", 0.5).unwrap(),
    });
    let server = start_server(template, test_config()).await;

    let mut poisoned = connect(server.addr).await;
    let mut healthy = connect(server.addr).await;

    let mut poison = vec![AudioSample::MIN; 1];
    poison.extend(vec![0 as AudioSample; WINDOW_SAMPLES - 1]);
    poisoned
        .send(
            Message::AudioStart {
                sample_rate: SAMPLE_RATE,
                format: "s16le".to_string(),
                channels: 1,
            }
            .into(),
        )
        .await
        .unwrap();
    poisoned
        .send(Frame::audio_chunk(samples_to_bytes(&poison)))
        .await
        .unwrap();

    match recv(&mut poisoned).await {
        Some(Message::Error { code, .. }) => assert_eq!(code, "detector-fault"),
        other => panic!("expected detector fault, got {:?}", other),
    }

    let keyword = generate_tone(440.0, WINDOW_SAMPLES, 0.9);
    stream_audio(&mut healthy, &keyword, 3).await;

    let events = finish(healthy, 1).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Message::Detection { timestamp: 100, .. }));

    wait_until_empty(&server.registry).await;
    stop(server).await;
}

#[tokio::test]
async fn test_clients_over_limit_get_server_busy() {
    let config = ServerConfig {
        max_sessions: 1,
        ..test_config()
    };
    let server = start_server(energy_template(), config).await;

    let mut first = connect(server.addr).await;
    assert!(matches!(
        describe(&mut first).await,
        Message::DescribeResponse { .. }
    ));
    assert_eq!(server.registry.len(), 1);

    let mut second = connect(server.addr).await;
    match recv(&mut second).await {
        Some(Message::Error { code, .. }) => assert_eq!(code, "server-busy"),
        other => panic!("expected server-busy, got {:?}", other),
    }
    assert!(recv(&mut second).await.is_none());

    // Capacity frees up once the first client leaves
    assert!(finish(first, 0).await.is_empty());
    wait_until_empty(&server.registry).await;

    let mut third = connect(server.addr).await;
    assert!(matches!(
        describe(&mut third).await,
        Message::DescribeResponse { .. }
    ));

    stop(server).await;
}

#[tokio::test]
async fn test_shutdown_closes_active_sessions() {
    let server = start_server(energy_template(), test_config()).await;

    let mut client = connect(server.addr).await;
    assert!(matches!(
        describe(&mut client).await,
        Message::DescribeResponse { .. }
    ));

    client
        .send(
            Message::AudioStart {
                sample_rate: SAMPLE_RATE,
                format: "s16le".to_string(),
                channels: 1,
            }
            .into(),
        )
        .await
        .unwrap();

    let silence = vec![0 as AudioSample; WINDOW_SAMPLES / 2];
    client
        .send(Frame::audio_chunk(samples_to_bytes(&silence)))
        .await
        .unwrap();

    let registry = server.registry.clone();
    stop(server).await;

    // Closed either cleanly or by reset, but no further events
    let next = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("connection was not closed");
    assert!(!matches!(next, Some(Ok(_))));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_client_drop_mid_stream_frees_session() {
    let calls = Arc::new(AtomicUsize::new(0));
    let template = Arc::new(SlowTemplate {
        inner: EnergyTemplate::new(detector_config(), "test-word", 0.5).unwrap(),
        calls: calls.clone(),
    });
    let server = start_server(template, test_config()).await;

    let mut client = connect(server.addr).await;
    client
        .send(
            Message::AudioStart {
                sample_rate: SAMPLE_RATE,
                format: "s16le".to_string(),
                channels: 1,
            }
            .into(),
        )
        .await
        .unwrap();

    // 40 windows in one chunk would keep the detector busy for two seconds
    let silence = vec![0 as AudioSample; WINDOW_SAMPLES * 40];
    client
        .send(Frame::audio_chunk(samples_to_bytes(&silence)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(server.registry.len(), 1);
    drop(client);

    wait_until_empty_within(&server.registry, Duration::from_secs(1)).await;

    let processed = calls.load(Ordering::SeqCst);
    assert!(processed < 40, "processed {} windows after disconnect", processed);

    // Nothing keeps evaluating once the session is gone
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), processed);

    stop(server).await;
}

#[tokio::test]
async fn test_silent_engine_reports_not_detected() {
    let template = Arc::new(SilentDetector::new(detector_config()));
    let server = start_server(template, test_config()).await;

    let mut client = connect(server.addr).await;
    match describe(&mut client).await {
        Message::DescribeResponse {
            detector_name,
            keywords,
            ..
        } => {
            assert_eq!(detector_name, "silent");
            assert!(keywords.is_empty());
        }
        other => panic!("expected describe-response, got {:?}", other),
    }

    let keyword = generate_tone(440.0, WINDOW_SAMPLES, 0.9);
    stream_audio(&mut client, &keyword, 3).await;

    assert_eq!(finish(client, 1).await, vec![Message::NotDetected]);

    stop(server).await;
}
