//! Per-connection protocol state machine
//!
//! Drives one client's frames through the session buffer into its private
//! detector and writes detection events back. Buffer mutation and detector
//! calls happen in sequence on the session's own task; outbound frames are
//! flushed before the next inbound frame is taken.
//!
//! A reader task decodes frames ahead of the session into a channel of one
//! slot, so it notices the peer going away while windows are still being
//! evaluated. No window is handed to the detector after that.

use crate::audio_buffer::{SessionBuffer, DEFAULT_CAPACITY_BYTES};
use crate::detector::{AudioFormat, Detection, KeywordDetector, WindowSpec};
use crate::error::SessionError;
use crate::protocol::{
    CodecError, Frame, FrameCodec, Message, DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_HEADER_BYTES,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

type Inbound = Result<Frame, CodecError>;

/// Protocol state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing received yet
    AwaitingDescribe,

    /// Between audio streams
    Idle,

    /// Inside an audio-start / audio-stop pair
    Streaming,

    /// Terminal
    Closed,
}

/// Limits and scoring applied to every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum score for a detection to be reported
    pub threshold: f32,

    /// Ceiling on buffered, unconsumed audio
    pub buffer_capacity_bytes: usize,

    pub max_header_bytes: usize,

    pub max_chunk_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            buffer_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_header_bytes, self.max_chunk_bytes)
    }
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub chunks_received: u64,
    pub samples_received: u64,
    pub windows_processed: u64,
    pub detections_emitted: u64,
    pub streams_started: u64,
}

/// One client's protocol session
pub struct Session<R, W> {
    id: Uuid,
    // Handed to the reader task when the session starts running
    reader: Option<FramedRead<R, FrameCodec>>,
    writer: FramedWrite<W, FrameCodec>,
    state: SessionState,
    // Taken out while a window is being processed on the blocking pool
    detector: Option<Box<dyn KeywordDetector>>,
    window: WindowSpec,
    buffer: SessionBuffer,
    format: AudioFormat,
    threshold: f32,
    keyword_filter: Option<Vec<String>>,
    // Samples dropped from the front of the buffer since audio-start
    stream_position: u64,
    // Leading buffered bytes that an earlier window already covered
    evaluated_tail: usize,
    stream_detections: u64,
    stats: SessionStats,
    shutdown: CancellationToken,
    // Cancelled on shutdown or when the peer disconnects
    closing: CancellationToken,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: Uuid,
        reader: R,
        writer: W,
        detector: Box<dyn KeywordDetector>,
        config: &SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let window = detector.window();
        let format = detector.format();

        Self {
            id,
            reader: Some(FramedRead::new(reader, config.codec())),
            writer: FramedWrite::new(writer, config.codec()),
            state: SessionState::AwaitingDescribe,
            detector: Some(detector),
            window,
            buffer: SessionBuffer::with_capacity(config.buffer_capacity_bytes),
            format,
            threshold: config.threshold,
            keyword_filter: None,
            stream_position: 0,
            evaluated_tail: 0,
            stream_detections: 0,
            stats: SessionStats::default(),
            closing: shutdown.child_token(),
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Run the session until the client disconnects, a session-fatal error
    /// occurs, or shutdown is requested
    ///
    /// Reportable errors are sent to the client as a single `error` frame
    /// before the connection is closed.
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        info!("Session {} started", self.id);

        let result = match self.reader.take() {
            Some(reader) => {
                let (mut frames, reader_task) = spawn_reader(reader, self.closing.clone());
                let result = self.drive(&mut frames).await;
                reader_task.abort();
                result
            }
            None => Ok(()),
        };

        if let Err(err) = &result {
            warn!("Session {} failed: {}", self.id, err);

            if err.is_reportable() {
                let frame = Frame::error(err.code(), err.to_string());
                if let Err(send_err) = self.writer.send(frame).await {
                    debug!("Could not deliver error frame: {}", send_err);
                }
            }
        }

        self.close().await;

        info!(
            "Session {} closed: {} frames, {} windows, {} detections",
            self.id,
            self.stats.frames_received,
            self.stats.windows_processed,
            self.stats.detections_emitted
        );

        result.map(|()| self.stats)
    }

    async fn drive(&mut self, frames: &mut mpsc::Receiver<Inbound>) -> Result<(), SessionError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closing.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        debug!("Session {} cancelled", self.id);
                    } else {
                        debug!("Session {} disconnected by client", self.id);
                    }
                    return Ok(());
                }
                next = frames.recv() => next,
            };

            let Some(frame) = next.transpose()? else {
                debug!("Session {} disconnected by client", self.id);
                return Ok(());
            };

            self.stats.frames_received += 1;
            self.handle_frame(frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        use SessionState::*;

        trace!("Session {} received {} in {:?}", self.id, frame.message.kind(), self.state);

        match (self.state, frame.message) {
            (AwaitingDescribe | Idle, Message::DescribeRequest) => {
                self.describe().await?;
                self.state = Idle;
                Ok(())
            }
            (AwaitingDescribe | Idle, Message::Detect { names }) => {
                debug!("Keyword filter set: {:?}", names);
                self.keyword_filter = names;
                Ok(())
            }
            (
                AwaitingDescribe | Idle,
                Message::AudioStart {
                    sample_rate,
                    format,
                    channels,
                },
            ) => self.start_stream(sample_rate, &format, channels),
            (Streaming, Message::AudioChunk) => {
                self.handle_chunk(frame.payload.unwrap_or_default()).await
            }
            (Streaming, Message::AudioStop) => self.stop_stream().await,
            (state, message) => Err(SessionError::ProtocolViolation(format!(
                "unexpected {} while {}",
                message.kind(),
                state_name(state)
            ))),
        }
    }

    async fn describe(&mut self) -> Result<(), SessionError> {
        let (info, format) = {
            let detector = self.detector()?;
            (detector.info(), detector.format())
        };

        self.send(Message::DescribeResponse {
            sample_rate: format.sample_rate,
            format: format.format.as_str().to_string(),
            channels: format.channels,
            detector_name: info.name,
            detector_version: info.version,
            keywords: info.keywords,
        })
        .await
    }

    fn start_stream(
        &mut self,
        sample_rate: u32,
        format: &str,
        channels: u16,
    ) -> Result<(), SessionError> {
        let declared = AudioFormat::from_wire(sample_rate, format, channels)?;

        if self.buffer.capacity() < self.window.window_bytes {
            return Err(SessionError::Config(format!(
                "buffer capacity of {} bytes cannot hold one {} byte detector window",
                self.buffer.capacity(),
                self.window.window_bytes
            )));
        }

        let detector = self.detector_mut()?;
        detector.check_format(&declared)?;
        detector.reset();

        self.format = declared;
        self.buffer.clear();
        self.stream_position = 0;
        self.evaluated_tail = 0;
        self.stream_detections = 0;
        self.stats.streams_started += 1;
        self.state = SessionState::Streaming;

        info!("Session {} audio started: {}", self.id, declared);
        Ok(())
    }

    async fn handle_chunk(&mut self, audio: Bytes) -> Result<(), SessionError> {
        self.stats.chunks_received += 1;
        self.stats.samples_received += (audio.len() / self.format.bytes_per_frame()) as u64;

        self.buffer.append(&audio)?;

        while self.buffer.len() >= self.window.window_bytes {
            // A closing session may finish the current window but gets no new one
            if self.closing.is_cancelled() {
                debug!("Session {} closing, {} bytes left unevaluated", self.id, self.buffer.len());
                return Ok(());
            }

            let Ok(window) = self.buffer.take_window(self.window.window_bytes) else {
                break;
            };

            self.evaluate(window).await?;

            self.buffer.drop_consumed(self.window.stride_bytes);
            self.stream_position += (self.window.stride_bytes / self.format.bytes_per_frame()) as u64;
            self.evaluated_tail = self.window.window_bytes - self.window.stride_bytes;
        }

        Ok(())
    }

    async fn stop_stream(&mut self) -> Result<(), SessionError> {
        let unevaluated = self.buffer.len().saturating_sub(self.evaluated_tail);

        if unevaluated > 0
            && unevaluated >= self.window.min_flush_bytes
            && !self.closing.is_cancelled()
        {
            debug!("Flushing final partial window of {} bytes", self.buffer.len());
            let window = self.buffer.take_window(self.buffer.len())?;
            self.evaluate(window).await?;
        }

        self.buffer.clear();

        if self.stream_detections == 0 {
            self.send(Message::NotDetected).await?;
        }

        self.state = SessionState::Idle;
        info!(
            "Session {} audio stopped after {} detections",
            self.id, self.stream_detections
        );
        Ok(())
    }

    /// Run one window through the detector and emit its detections in order
    async fn evaluate(&mut self, window: Bytes) -> Result<(), SessionError> {
        let mut detector = self
            .detector
            .take()
            .ok_or_else(|| SessionError::DetectorFault("detector unavailable".to_string()))?;
        let position = self.stream_position;

        let (detector, result) = tokio::task::spawn_blocking(move || {
            let result = detector.process(&window, position);
            (detector, result)
        })
        .await
        .map_err(|e| SessionError::DetectorFault(format!("detector panicked: {}", e)))?;

        self.detector = Some(detector);
        self.stats.windows_processed += 1;

        for detection in result? {
            self.emit(detection).await?;
        }

        Ok(())
    }

    async fn emit(&mut self, detection: Detection) -> Result<(), SessionError> {
        if detection.score < self.threshold {
            trace!(
                "Dropping '{}' below threshold: {:.2} < {:.2}",
                detection.keyword,
                detection.score,
                self.threshold
            );
            return Ok(());
        }

        if let Some(names) = &self.keyword_filter {
            if !names.contains(&detection.keyword) {
                trace!("Dropping '{}' not in keyword filter", detection.keyword);
                return Ok(());
            }
        }

        info!(
            "Session {} detected '{}': score={:.2}, timestamp={}ms",
            self.id, detection.keyword, detection.score, detection.timestamp_ms
        );

        self.send(Message::Detection {
            keyword_name: detection.keyword,
            score: detection.score,
            timestamp: detection.timestamp_ms,
        })
        .await?;

        self.stream_detections += 1;
        self.stats.detections_emitted += 1;
        Ok(())
    }

    /// Write and flush one frame
    async fn send(&mut self, frame: impl Into<Frame>) -> Result<(), SessionError> {
        self.writer.send(frame.into()).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.state = SessionState::Closed;
        self.buffer.clear();
        self.detector = None;

        if let Err(e) = self.writer.close().await {
            debug!("Error closing session {} writer: {}", self.id, e);
        }
    }

    fn detector(&self) -> Result<&dyn KeywordDetector, SessionError> {
        self.detector
            .as_deref()
            .ok_or_else(|| SessionError::DetectorFault("detector unavailable".to_string()))
    }

    fn detector_mut(&mut self) -> Result<&mut Box<dyn KeywordDetector>, SessionError> {
        self.detector
            .as_mut()
            .ok_or_else(|| SessionError::DetectorFault("detector unavailable".to_string()))
    }
}

/// Decode frames off the connection into a single-slot channel
///
/// `closing` is cancelled as soon as the read side reaches EOF or fails.
/// Malformed frames are forwarded so the session can report them.
fn spawn_reader<R>(
    mut reader: FramedRead<R, FrameCodec>,
    closing: CancellationToken,
) -> (mpsc::Receiver<Inbound>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(
        async move {
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(CodecError::Io(e))) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => break,
                }
            }

            closing.cancel();
        }
        .in_current_span(),
    );

    (rx, handle)
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::AwaitingDescribe => "awaiting describe",
        SessionState::Idle => "idle",
        SessionState::Streaming => "streaming",
        SessionState::Closed => "closed",
    }
}
