//! ASR adapter: an opaque `transcribe(pcm) -> segments` step. The
//! production implementation wraps `whisper-rs`; tests substitute a
//! stub that returns canned segments.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperState};

/// One segment as returned by the transcriber, relative to the start
/// of the chunk that was passed to `transcribe`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub no_speech_prob: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLanguage {
    pub language: String,
    pub probability: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TranscribeOutput {
    pub segments: Vec<RawSegment>,
    pub language: Option<DetectedLanguage>,
}

/// Opaque transcriber seam. A session owns one instance (or, in
/// single-model mode, shares one behind a mutex) and calls
/// `transcribe` once per chunk. Implementations are blocking/CPU- or
/// GPU-bound; callers are expected to run them off the async runtime
/// (e.g. via `spawn_blocking`).
pub trait Transcriber: Send {
    fn transcribe(&mut self, pcm: &[f32]) -> Result<TranscribeOutput>;
}

#[derive(Clone, Debug)]
pub struct TranscribeOpts {
    pub dynamic_audio_ctx: bool,
    pub temperature_inc: Option<f32>,
    pub entropy_thold: Option<f32>,
    pub reinit_state: bool,
}

impl Default for TranscribeOpts {
    fn default() -> Self {
        Self {
            dynamic_audio_ctx: false,
            temperature_inc: None,
            entropy_thold: None,
            reinit_state: false,
        }
    }
}

const SAMPLE_RATE: i32 = 16_000;

/// `whisper-rs`-backed transcriber, reusing one `WhisperState` across
/// calls for performance (matches the reference server's one
/// long-lived `WhisperState` per session).
pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    state: WhisperState,
    language: Option<String>, // None = auto-detect
    initial_prompt: Option<String>,
    sampling_strategy: SamplingStrategy,
    opts: TranscribeOpts,
}

impl WhisperTranscriber {
    pub fn new(
        ctx: Arc<WhisperContext>,
        language: Option<String>,
        initial_prompt: Option<String>,
        sampling_strategy: SamplingStrategy,
        opts: TranscribeOpts,
    ) -> Result<Self> {
        let state = ctx.create_state()?;
        let language = language.filter(|l| !l.is_empty() && l != "auto");
        Ok(Self {
            ctx,
            state,
            language,
            initial_prompt,
            sampling_strategy,
            opts,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&mut self, pcm: &[f32]) -> Result<TranscribeOutput> {
        if self.opts.reinit_state {
            self.state = self.ctx.create_state()?;
        }

        let mut params = FullParams::new(self.sampling_strategy.clone());
        params.set_language(self.language.as_deref()); // None = auto-detect
        params.set_suppress_nst(true);
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        params.set_token_timestamps(false);
        params.set_no_context(true);

        if let Some(v) = self.opts.temperature_inc {
            params.set_temperature_inc(v);
        }
        if let Some(v) = self.opts.entropy_thold {
            params.set_entropy_thold(v);
        }
        if self.opts.dynamic_audio_ctx {
            // scale audio_ctx to buffer length, multiple of 64, min 384
            let needed = (pcm.len() as i32 * 1500) / (SAMPLE_RATE * 30);
            let aligned = ((needed + 63) / 64) * 64;
            params.set_audio_ctx(aligned.max(384));
        }
        if let Some(ref prompt) = self.initial_prompt {
            params.set_initial_prompt(prompt);
        }

        let start = Instant::now();
        self.state.full(params, pcm)?;
        let elapsed = start.elapsed().as_secs_f64();

        let audio_duration = pcm.len() as f64 / SAMPLE_RATE as f64;
        info!(
            "transcribed {:.2}s of audio in {:.2}s ({:.2}x realtime)",
            audio_duration,
            elapsed,
            audio_duration / elapsed.max(1e-6)
        );

        let n_segments = self.state.full_n_segments();
        let mut segments = Vec::with_capacity(n_segments.max(0) as usize);
        for i in 0..n_segments {
            let Some(segment) = self.state.get_segment(i) else {
                continue;
            };
            let text = segment.to_str_lossy()?.trim().to_string();
            if text.is_empty() {
                continue;
            }
            segments.push(RawSegment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text,
                no_speech_prob: segment.no_speech_probability(),
            });
        }

        // whisper.cpp only surfaces the winning language id from full(),
        // not its probability; auto-detection always reports full
        // confidence here and the Session applies its own threshold to
        // a caller-supplied probability for deliberate downgrades.
        let language = if self.language.is_none() {
            self.state
                .full_lang_id()
                .ok()
                .and_then(lang_id_to_str)
                .map(|lang| DetectedLanguage { language: lang.to_string(), probability: 1.0 })
        } else {
            None
        };

        Ok(TranscribeOutput { segments, language })
    }
}

/// Subset of whisper.cpp's language table, covering the languages the
/// gateway is expected to see in practice. Extend as needed.
fn lang_id_to_str(id: i32) -> Option<&'static str> {
    let table = [
        "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
        "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
        "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn",
    ];
    table.get(id as usize).copied()
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A deterministic stub transcriber for session/decode-loop tests
    /// that never loads a real model.
    pub struct StubTranscriber {
        pub responses: std::collections::VecDeque<TranscribeOutput>,
    }

    impl StubTranscriber {
        pub fn new(responses: Vec<TranscribeOutput>) -> Self {
            Self { responses: responses.into() }
        }
    }

    impl Transcriber for StubTranscriber {
        fn transcribe(&mut self, _pcm: &[f32]) -> Result<TranscribeOutput> {
            Ok(self.responses.pop_front().unwrap_or_default())
        }
    }
}
