/// Wake-word test client
///
/// Streams a WAV file (or raw s16le mono audio from stdin, e.g. piped from
/// `sox -d -t raw -r 16000 -e signed-integer -b 16 -c 1 -`) to a running
/// server and prints every event it sends back.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use wakeword_server::config::ListenUri;
use wakeword_server::detector::{samples_to_bytes, SAMPLE_RATE};
use wakeword_server::protocol::{Frame, FrameCodec, Message};

#[derive(Parser, Debug)]
#[command(name = "wakeword-client", version, about = "Stream audio to a wake-word server")]
struct Cli {
    /// Server to connect to
    #[arg(long, env = "WAKEWORD_URI", default_value = "tcp://127.0.0.1:10400")]
    uri: String,

    /// 16-bit PCM WAV file; raw s16le mono 16kHz is read from stdin otherwise
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Samples per audio-chunk frame
    #[arg(long, default_value_t = 1024)]
    chunk_samples: usize,

    /// Only report these keywords
    #[arg(long)]
    keyword: Vec<String>,

    /// Pace WAV chunks at playback speed
    #[arg(long)]
    realtime: bool,

    /// How long to wait for events after audio-stop, in milliseconds
    #[arg(long, default_value_t = 1000)]
    linger_ms: u64,

    #[arg(long)]
    debug: bool,
}

struct WavAudio {
    sample_rate: u32,
    channels: u16,
    pcm: Vec<u8>,
}

fn read_wav(path: &PathBuf) -> Result<WavAudio> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "{} must be 16-bit integer PCM, got {} bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode WAV samples")?;

    info!(
        "Loaded {}: {} samples, {}Hz, {}ch",
        path.display(),
        samples.len(),
        spec.sample_rate,
        spec.channels
    );

    Ok(WavAudio {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        pcm: samples_to_bytes(&samples),
    })
}

fn print_event(message: &Message) {
    match message {
        Message::DescribeResponse {
            detector_name,
            detector_version,
            sample_rate,
            format,
            channels,
            keywords,
        } => println!(
            "INFO: {} v{} ({}Hz {} {}ch) keywords={:?}",
            detector_name, detector_version, sample_rate, format, channels, keywords
        ),
        Message::Detection {
            keyword_name,
            score,
            timestamp,
        } => println!(
            "DETECTED: {} score={:.2} at {}ms",
            keyword_name, score, timestamp
        ),
        Message::NotDetected => println!("NOT DETECTED"),
        Message::Error { code, message } => println!("ERROR [{}]: {}", code, message),
        other => println!("UNEXPECTED: {}", other.kind()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    wakeword_server::init_logging(cli.debug);

    let addr = match ListenUri::parse(&cli.uri)? {
        ListenUri::Tcp(addr) => addr,
        ListenUri::Stdio => bail!("the client needs a tcp:// server URI"),
    };

    let wav = cli.wav.as_ref().map(read_wav).transpose()?;
    let (sample_rate, channels) = wav
        .as_ref()
        .map(|w| (w.sample_rate, w.channels))
        .unwrap_or((SAMPLE_RATE, 1));

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    info!("Connected to {}", addr);

    let (mut sink, mut events) = Framed::new(stream, FrameCodec::default()).split();

    let printer = tokio::spawn(async move {
        while let Some(frame) = events.next().await {
            match frame {
                Ok(frame) => print_event(&frame.message),
                Err(e) => {
                    warn!("Failed to read event: {}", e);
                    break;
                }
            }
        }
        debug!("Server closed the connection");
    });

    sink.send(Message::DescribeRequest.into()).await?;

    if !cli.keyword.is_empty() {
        sink.send(
            Message::Detect {
                names: Some(cli.keyword.clone()),
            }
            .into(),
        )
        .await?;
    }

    sink.send(
        Message::AudioStart {
            sample_rate,
            format: "s16le".to_string(),
            channels,
        }
        .into(),
    )
    .await?;

    let chunk_bytes = cli.chunk_samples.max(1) * 2 * channels as usize;
    let mut sent = 0usize;

    match &wav {
        Some(wav) => {
            let pace = Duration::from_secs_f64(
                cli.chunk_samples as f64 / sample_rate.max(1) as f64,
            );
            for chunk in wav.pcm.chunks(chunk_bytes) {
                sink.send(Frame::audio_chunk(chunk.to_vec())).await?;
                sent += chunk.len();
                if cli.realtime {
                    tokio::time::sleep(pace).await;
                }
            }
        }
        None => {
            info!("Streaming stdin, press Ctrl+D to stop");
            let mut stdin = tokio::io::stdin();
            let mut chunk = vec![0u8; chunk_bytes];
            loop {
                let n = stdin.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                sink.send(Frame::audio_chunk(chunk[..n].to_vec())).await?;
                sent += n;
            }
        }
    }

    sink.send(Message::AudioStop.into()).await?;
    info!("Sent {} bytes of audio", sent);

    tokio::time::sleep(Duration::from_millis(cli.linger_ms)).await;
    sink.close().await?;

    if tokio::time::timeout(Duration::from_secs(5), printer).await.is_err() {
        warn!("Server did not close the connection");
    }

    Ok(())
}
