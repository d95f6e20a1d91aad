//! Wake-word server - streaming keyword detection over a framed protocol
//!
//! This library provides:
//! - A resumable codec for JSON-header + binary-payload frames
//! - Bounded per-session audio buffering
//! - Pluggable keyword detectors, one private instance per session
//! - A per-connection session state machine
//! - A TCP supervisor that isolates session failures

pub mod audio_buffer;
pub mod config;
pub mod detector;
pub mod error;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use audio_buffer::{BufferError, SessionBuffer};
pub use config::{ConfigError, Engine, ListenUri, ServerConfig};
pub use detector::{
    AudioFormat, Detection, DetectorError, DetectorInfo, DetectorTemplate, EnergyConfig,
    EnergyDetector, EnergyTemplate, KeywordDetector, SampleFormat, SilentDetector, WindowSpec,
};
pub use error::SessionError;
pub use protocol::{CodecError, Frame, FrameCodec, Message};
pub use session::{Session, SessionConfig, SessionState, SessionStats};
pub use supervisor::{serve_stdio, SessionRegistry, Supervisor};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
///
/// Logs go to stderr so stdout stays free for the stdio transport.
/// `RUST_LOG` takes precedence over the `debug` flag.
pub fn init_logging(debug: bool) {
    let default_filter = if debug {
        "wakeword_server=debug"
    } else {
        "wakeword_server=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
