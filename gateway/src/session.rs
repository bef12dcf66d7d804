//! Per-session audio buffering, the incremental decode loop, and
//! segment assembly. One `Session` is owned exclusively by the
//! gateway worker that accepted its stream and is mutated by exactly
//! two workers — the receive task and the decode task — under
//! `state`, a session-local mutex that is never held across I/O or a
//! transcriber call.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex as SyncMutex;
use shared_protocol::{Segment, ServerMessage};
use shared_transcriber::{RawSegment, TranscribeOutput, Transcriber};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

pub const RATE: f64 = 16_000.0;

const MAX_BUFFER_SECS: f64 = 45.0;
const CLIP_DISCARD_SECS: f64 = 30.0;
const STALL_THRESHOLD_SECS: f64 = 25.0;
const STALL_KEEP_SECS: f64 = 5.0;
const MIN_CHUNK_SECS: f64 = 1.0;
const NO_SPEECH_THRESH: f32 = 0.45;
const SAME_OUTPUT_THRESHOLD: u32 = 10;
const SHOW_PREV_OUT_THRESH: f64 = 5.0;
const ADD_PAUSE_THRESH: f64 = 3.0;
const SEND_LAST_N_SEGMENTS: usize = 10;

/// Metadata fixed at handshake time; never mutated after `Session::new`.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub uid: String,
    pub token: String,
    pub platform: String,
    pub meeting_id: String,
    pub meeting_url: String,
}

/// A request to republish a transcript onto the durable event log.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub uid: String,
    pub token: String,
    pub platform: String,
    pub meeting_id: String,
    pub segments: Vec<Segment>,
}

/// Channels the decode loop uses to ship results out, decoupling it
/// (a blocking, synchronous worker) from the async client-writer and
/// publisher tasks that actually perform I/O.
pub struct SessionSinks {
    pub to_client: UnboundedSender<ServerMessage>,
    pub to_publisher: UnboundedSender<PublishRequest>,
}

/// Contiguous PCM accumulation with bounded length and clip-on-overflow.
/// Private to `Session` — not a standalone public component.
struct RingBuffer {
    samples: Vec<f32>,
    frames_offset: f64, // seconds discarded from the head of the logical stream
}

impl RingBuffer {
    fn new() -> Self {
        Self { samples: Vec::new(), frames_offset: 0.0 }
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn total_duration(&self) -> f64 {
        self.samples.len() as f64 / RATE
    }

    fn append(&mut self, frame: &[f32], timestamp_offset: &mut f64) {
        if !self.samples.is_empty() && self.total_duration() > MAX_BUFFER_SECS {
            let drop_n = ((CLIP_DISCARD_SECS * RATE) as usize).min(self.samples.len());
            self.samples.drain(0..drop_n);
            self.frames_offset += CLIP_DISCARD_SECS;
            if *timestamp_offset < self.frames_offset {
                *timestamp_offset = self.frames_offset;
            }
        }
        self.samples.extend_from_slice(frame);
    }

    /// If the decoder has failed to consume 25s of buffered audio,
    /// force-advance `timestamp_offset` and drop all but the last 5s.
    fn clip_if_stalled(&mut self, timestamp_offset: &mut f64) {
        let consumed = *timestamp_offset - self.frames_offset;
        let unconsumed = self.total_duration() - consumed;
        if unconsumed > STALL_THRESHOLD_SECS {
            *timestamp_offset = self.frames_offset + self.total_duration() - STALL_KEEP_SECS;
        }
    }

    fn take_chunk(&self, timestamp_offset: f64) -> (Vec<f32>, f64) {
        let samples_taken = ((timestamp_offset - self.frames_offset) * RATE).max(0.0) as usize;
        let start = samples_taken.min(self.samples.len());
        let chunk = self.samples[start..].to_vec();
        let duration = chunk.len() as f64 / RATE;
        (chunk, duration)
    }
}

/// Repetition-debounce and transcript-assembly state.
struct AssemblyState {
    transcript: Vec<Segment>,
    prev_out: String,
    pending_partial: Option<Segment>,
    same_output_count: u32,
    end_time_for_same_output: Option<f64>,
    t_start: Option<Instant>, // wall clock of last successful decode; None while not idle
    pause_marked: bool,
}

impl AssemblyState {
    fn new() -> Self {
        Self {
            transcript: Vec::new(),
            prev_out: String::new(),
            pending_partial: None,
            same_output_count: 0,
            end_time_for_same_output: None,
            t_start: None,
            pause_marked: false,
        }
    }
}

struct SessionState {
    ring: RingBuffer,
    timestamp_offset: f64,
    assembly: AssemblyState,
    exit: bool,
    eos: bool,
    detected_language: Option<String>,
    detected_language_prob: Option<f32>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            timestamp_offset: 0.0,
            assembly: AssemblyState::new(),
            exit: false,
            eos: false,
            detected_language: None,
            detected_language_prob: None,
        }
    }

    /// Segment assembly. Returns the outbound response and whether
    /// the caller should sleep 100ms to give the model room to
    /// recover from an apparent pause (never slept here, since the
    /// session mutex must not be held across a deliberate wait).
    fn assemble(&mut self, segments: &[RawSegment], duration: f64) -> (Vec<Segment>, bool) {
        let n = segments.len();
        let mut offset: Option<f64> = None;

        if n > 1 && segments[n - 1].no_speech_prob <= NO_SPEECH_THRESH {
            for s in &segments[..n - 1] {
                if s.no_speech_prob <= NO_SPEECH_THRESH && s.start < s.end {
                    let start = self.timestamp_offset + s.start;
                    let end = self.timestamp_offset + duration.min(s.end);
                    self.assembly.transcript.push(Segment::new(start, end, s.text.clone(), true));
                }
            }
            offset = Some(duration.min(segments[n - 2].end));
        }

        let last = &segments[n - 1];
        let mut pending = None;
        if last.no_speech_prob <= NO_SPEECH_THRESH {
            let start = self.timestamp_offset + last.start;
            let end = self.timestamp_offset + duration.min(last.end);
            pending = Some(Segment::new(start, end, last.text.clone(), false));
        }

        let pending_text = pending.as_ref().map(|s| s.text.trim().to_string()).unwrap_or_default();
        let mut sleep_100ms = false;
        if !pending_text.is_empty() && pending_text == self.assembly.prev_out.trim() {
            self.assembly.same_output_count += 1;
            if self.assembly.end_time_for_same_output.is_none() {
                self.assembly.end_time_for_same_output = Some(last.end);
            }
            sleep_100ms = true;
        } else {
            self.assembly.same_output_count = 0;
            self.assembly.end_time_for_same_output = None;
        }

        if self.assembly.same_output_count > SAME_OUTPUT_THRESHOLD {
            let end_for_commit = self.assembly.end_time_for_same_output.unwrap_or(duration);
            let is_dup = self
                .assembly
                .transcript
                .last()
                .map(|s| s.text.trim().eq_ignore_ascii_case(pending_text.trim()))
                .unwrap_or(false);
            if !is_dup {
                let start = self.timestamp_offset;
                let end = self.timestamp_offset + duration.min(end_for_commit);
                self.assembly.transcript.push(Segment::new(start, end, pending_text, true));
            }
            offset = Some(duration.min(end_for_commit));
            self.assembly.same_output_count = 0;
            self.assembly.end_time_for_same_output = None;
            pending = None;
        } else {
            self.assembly.prev_out = pending_text;
        }

        if let Some(off) = offset {
            self.timestamp_offset += off;
        }

        self.assembly.pending_partial = pending;
        (self.build_response(), sleep_100ms)
    }

    fn build_response(&self) -> Vec<Segment> {
        let transcript = &self.assembly.transcript;
        let mut out = if transcript.len() > SEND_LAST_N_SEGMENTS {
            transcript[transcript.len() - SEND_LAST_N_SEGMENTS..].to_vec()
        } else {
            transcript.clone()
        };
        if let Some(p) = &self.assembly.pending_partial {
            out.push(p.clone());
        }
        out
    }

    /// If the transcriber returned nothing this round, re-emit the
    /// last response while within `show_prev_out_thresh`, and stop
    /// re-emitting once the silence has lasted past `add_pause_thresh`.
    fn maybe_pause_output(&mut self) -> Option<Vec<Segment>> {
        let now = Instant::now();
        let t_start = *self.assembly.t_start.get_or_insert(now);
        let elapsed = now.duration_since(t_start).as_secs_f64();

        let response = (elapsed < SHOW_PREV_OUT_THRESH && !self.assembly.pause_marked)
            .then(|| self.build_response());

        if elapsed > ADD_PAUSE_THRESH {
            self.assembly.pause_marked = true;
        }

        response
    }
}

/// A single client session: audio state, decode state, and the
/// metadata needed to route transcripts to the client and the event
/// log.
pub struct Session {
    pub identity: SessionIdentity,
    state: SyncMutex<SessionState>,
}

impl Session {
    pub fn new(identity: SessionIdentity) -> Arc<Self> {
        Arc::new(Self { identity, state: SyncMutex::new(SessionState::new()) })
    }

    pub fn ready_message(&self, backend: &'static str) -> ServerMessage {
        ServerMessage::ready(self.identity.uid.clone(), backend)
    }

    /// Append a frame received from the client.
    pub fn append_frame(&self, frame: &[f32]) {
        let mut st = self.state.lock();
        let SessionState { ring, timestamp_offset, .. } = &mut *st;
        ring.append(frame, timestamp_offset);
    }

    pub fn set_eos(&self, eos: bool) {
        self.state.lock().eos = eos;
    }

    pub fn eos(&self) -> bool {
        self.state.lock().eos
    }

    pub fn request_exit(&self) {
        self.state.lock().exit = true;
    }

    pub fn is_exiting(&self) -> bool {
        self.state.lock().exit
    }

    /// Current transcript snapshot, for tests and diagnostics.
    pub fn transcript(&self) -> Vec<Segment> {
        self.state.lock().assembly.transcript.clone()
    }

    /// Whether any buffered audio remains unconsumed by the decode
    /// loop. The receive side uses this to give the decoder a short
    /// grace period to flush a trailing partial after `END_OF_AUDIO`
    /// before tearing the connection down.
    pub fn has_pending_audio(&self) -> bool {
        let st = self.state.lock();
        let unconsumed = st.ring.total_duration() - (st.timestamp_offset - st.ring.frames_offset);
        unconsumed > 0.05
    }
}

/// An opaque transcriber seam shared across sessions in single-model
/// mode, or owned outright otherwise.
pub enum TranscriberHandle {
    Owned(Box<dyn Transcriber>),
    Shared(Arc<std::sync::Mutex<Box<dyn Transcriber>>>),
}

impl TranscriberHandle {
    fn transcribe(&mut self, pcm: &[f32]) -> Result<TranscribeOutput> {
        match self {
            TranscriberHandle::Owned(t) => t.transcribe(pcm),
            TranscriberHandle::Shared(m) => {
                let mut guard = m.lock().expect("transcriber mutex poisoned");
                guard.transcribe(pcm)
            }
        }
    }
}

/// Runs the decode loop to completion, i.e. until
/// `Session::request_exit` is observed. Intended to run inside
/// `tokio::task::spawn_blocking` — every suspension point here is a
/// plain thread sleep or a blocking transcriber call, never `.await`.
pub fn run_decode_loop(session: Arc<Session>, mut transcriber: TranscriberHandle, sinks: SessionSinks) {
    loop {
        if session.is_exiting() {
            return;
        }

        if session.state.lock().ring.is_empty() {
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        let (chunk, duration, eos) = {
            let mut st = session.state.lock();
            let SessionState { ring, timestamp_offset, eos, .. } = &mut *st;
            ring.clip_if_stalled(timestamp_offset);
            let (chunk, duration) = ring.take_chunk(*timestamp_offset);
            (chunk, duration, *eos)
        };

        // A trailing partial shorter than a full chunk is otherwise
        // never transcribed, since no more audio is coming once the
        // client has signalled end-of-speech.
        let flush_on_eos = eos && duration > 0.0;
        if duration < MIN_CHUNK_SECS && !flush_on_eos {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        let output = match transcriber.transcribe(&chunk) {
            Ok(out) => out,
            Err(e) => {
                warn!(uid = %session.identity.uid, error = %e, "transcriber error, dropping chunk");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let mut st = session.state.lock();

        if let Some(lang) = &output.language {
            if st.detected_language.is_none() && lang.probability > 0.5 {
                st.detected_language = Some(lang.language.clone());
                st.detected_language_prob = Some(lang.probability);
                let _ = sinks.to_client.send(ServerMessage::Language {
                    uid: session.identity.uid.clone(),
                    language: lang.language.clone(),
                    language_prob: lang.probability,
                });
            }
        }

        if output.segments.is_empty() || st.detected_language.is_none() {
            st.timestamp_offset += duration;
            let pause_response = st.maybe_pause_output();
            drop(st);
            if let Some(segments) = pause_response {
                send_transcript(&session, &sinks, segments);
            }
            thread::sleep(Duration::from_millis(250));
            continue;
        }

        st.assembly.t_start = None;
        st.assembly.pause_marked = false;
        let (response_segments, sleep_100ms) = st.assemble(&output.segments, duration);
        drop(st);

        if sleep_100ms {
            thread::sleep(Duration::from_millis(100));
        }

        send_transcript(&session, &sinks, response_segments);
    }
}

fn send_transcript(session: &Arc<Session>, sinks: &SessionSinks, segments: Vec<Segment>) {
    if segments.is_empty() {
        return;
    }
    let _ = sinks.to_client.send(ServerMessage::Transcript {
        uid: session.identity.uid.clone(),
        segments: segments.clone(),
    });
    let _ = sinks.to_publisher.send(PublishRequest {
        uid: session.identity.uid.clone(),
        token: session.identity.token.clone(),
        platform: session.identity.platform.clone(),
        meeting_id: session.identity.meeting_id.clone(),
        segments,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_transcriber::{test_support::StubTranscriber, DetectedLanguage};
    use tokio::sync::mpsc;

    fn identity(uid: &str) -> SessionIdentity {
        SessionIdentity {
            uid: uid.to_string(),
            token: "tok".into(),
            platform: "zoom".into(),
            meeting_id: "m1".into(),
            meeting_url: "https://example.invalid/m1".into(),
        }
    }

    fn run_one_round(
        session: &Arc<Session>,
        transcriber: &mut TranscriberHandle,
        chunk_secs: f64,
    ) -> (Vec<Segment>, bool) {
        let samples = vec![0.0_f32; (chunk_secs * RATE) as usize];
        session.append_frame(&samples);
        let (chunk, duration) = {
            let mut st = session.state.lock();
            let SessionState { ring, timestamp_offset, .. } = &mut *st;
            ring.clip_if_stalled(timestamp_offset);
            ring.take_chunk(*timestamp_offset)
        };
        let output = transcriber.transcribe(&chunk).unwrap();
        let mut st = session.state.lock();
        if st.detected_language.is_none() {
            st.detected_language = Some("en".into());
        }
        st.assembly.t_start = None;
        st.assembly.pause_marked = false;
        st.assemble(&output.segments, duration)
    }

    #[test]
    fn ring_buffer_clips_after_45_seconds() {
        let session = Session::new(identity("u1"));
        // 46 seconds in one shot triggers the overflow branch on append.
        session.append_frame(&vec![0.0_f32; (46.0 * RATE) as usize]);
        let st = session.state.lock();
        assert!(st.ring.total_duration() <= 46.0 - CLIP_DISCARD_SECS + 1.0);
        assert_eq!(st.ring.frames_offset, 0.0); // only clips on a *subsequent* append once > 45s
    }

    #[test]
    fn ring_buffer_clip_advances_frames_offset_on_next_append() {
        let session = Session::new(identity("u1"));
        session.append_frame(&vec![0.0_f32; (46.0 * RATE) as usize]);
        session.append_frame(&vec![0.0_f32; 10]);
        let st = session.state.lock();
        assert_eq!(st.ring.frames_offset, CLIP_DISCARD_SECS);
    }

    #[test]
    fn commit_via_repetition_after_eleven_identical_partials() {
        let session = Session::new(identity("u1"));
        let mut transcriber = TranscriberHandle::Owned(Box::new(StubTranscriber::new(
            (0..12)
                .map(|_| TranscribeOutput {
                    segments: vec![RawSegment {
                        start: 0.0,
                        end: 1.0,
                        text: "uh".into(),
                        no_speech_prob: 0.1,
                    }],
                    language: Some(DetectedLanguage { language: "en".into(), probability: 0.99 }),
                })
                .collect(),
        )));

        for _ in 0..12 {
            run_one_round(&session, &mut transcriber, 1.0);
        }

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].text, "uh");
        assert!(transcript[0].completed);
        assert_eq!(session.state.lock().assembly.same_output_count, 0);
    }

    #[test]
    fn happy_path_single_partial() {
        let session = Session::new(identity("u1"));
        let mut transcriber = TranscriberHandle::Owned(Box::new(StubTranscriber::new(vec![TranscribeOutput {
            segments: vec![RawSegment { start: 0.0, end: 1.0, text: "hello".into(), no_speech_prob: 0.1 }],
            language: Some(DetectedLanguage { language: "en".into(), probability: 0.99 }),
        }])));

        let (segments, _) = run_one_round(&session, &mut transcriber, 2.0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello");
        assert!(!segments[0].completed);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 1.0);
    }

    #[test]
    fn chunk_duration_under_one_second_never_transcribes() {
        assert!(0.5 < MIN_CHUNK_SECS);
    }

    #[test]
    fn eos_flushes_a_trailing_chunk_shorter_than_the_minimum() {
        let session = Session::new(identity("u1"));
        let mut transcriber = TranscriberHandle::Owned(Box::new(StubTranscriber::new(vec![TranscribeOutput {
            segments: vec![RawSegment { start: 0.0, end: 0.3, text: "hi".into(), no_speech_prob: 0.1 }],
            language: Some(DetectedLanguage { language: "en".into(), probability: 0.99 }),
        }])));

        session.append_frame(&vec![0.0_f32; (0.3 * RATE) as usize]);
        session.set_eos(true);

        let (chunk, duration, eos) = {
            let mut st = session.state.lock();
            let SessionState { ring, timestamp_offset, eos, .. } = &mut *st;
            ring.clip_if_stalled(timestamp_offset);
            let (chunk, duration) = ring.take_chunk(*timestamp_offset);
            (chunk, duration, *eos)
        };
        assert!(duration < MIN_CHUNK_SECS);
        assert!(eos, "eos must be observed to justify skipping the minimum-duration gate");

        let output = transcriber.transcribe(&chunk).unwrap();
        let mut st = session.state.lock();
        st.detected_language = Some("en".into());
        let (segments, _) = st.assemble(&output.segments, duration);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hi");
    }

    #[test]
    fn has_pending_audio_reflects_unconsumed_tail() {
        let session = Session::new(identity("u1"));
        assert!(!session.has_pending_audio());
        session.append_frame(&vec![0.0_f32; (1.0 * RATE) as usize]);
        assert!(session.has_pending_audio());
        session.state.lock().timestamp_offset = 1.0;
        assert!(!session.has_pending_audio());
    }

    #[tokio::test]
    async fn send_transcript_forwards_to_both_sinks() {
        let session = Session::new(identity("u1"));
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (pub_tx, mut pub_rx) = mpsc::unbounded_channel();
        let sinks = SessionSinks { to_client: client_tx, to_publisher: pub_tx };

        send_transcript(&session, &sinks, vec![Segment::new(0.0, 1.0, "hi", false)]);

        let client_msg = client_rx.recv().await.unwrap();
        assert!(matches!(client_msg, ServerMessage::Transcript { .. }));
        let pub_msg = pub_rx.recv().await.unwrap();
        assert_eq!(pub_msg.uid, "u1");
    }
}
