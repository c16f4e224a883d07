// Tests for the recorder: mime negotiation, header-first event ordering,
// interval switching, and idempotent start/stop.

use async_trait::async_trait;
use kaiwa_voice::audio::capture::{CapturedChunk, Capturer, MimeType};
use kaiwa_voice::audio::init_segment;
use kaiwa_voice::audio::recorder::{AudioRecorder, RecorderEvent};
use kaiwa_voice::config::AudioConfig;
use kaiwa_voice::error::{Result, VoiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Capture source that plays out a scripted chunk list
struct MockCapturer {
    supported: Vec<MimeType>,
    chunks: Vec<Vec<u8>>,
    fail_with: Option<fn() -> VoiceError>,
    capturing: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    intervals: Arc<Mutex<Vec<Duration>>>,
}

impl MockCapturer {
    fn new(supported: Vec<MimeType>, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            supported,
            chunks,
            fail_with: None,
            capturing: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
            intervals: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Capturer for MockCapturer {
    async fn start(&mut self, _interval: Duration) -> Result<mpsc::Receiver<CapturedChunk>> {
        if let Some(make_err) = self.fail_with {
            return Err(make_err());
        }

        self.capturing.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for (i, data) in chunks.into_iter().enumerate() {
                let chunk = CapturedChunk {
                    data,
                    captured_at_ms: i as u64 * 10,
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        Ok(rx)
    }

    async fn set_interval(&mut self, interval: Duration) -> Result<()> {
        self.intervals.lock().await.push(interval);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn supports(&self, mime: &MimeType) -> bool {
        self.supported.contains(mime)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn test_config() -> AudioConfig {
    AudioConfig {
        latency_ms: 50,
        header_probe_ms: 5,
    }
}

/// Drain recorder events until the terminal state transition or a timeout
async fn collect_events(mut rx: mpsc::Receiver<RecorderEvent>) -> Vec<RecorderEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(event)) => {
                let terminal = matches!(event, RecorderEvent::State(false));
                events.push(event);
                if terminal {
                    break;
                }
            }
            _ => break,
        }
    }
    events
}

#[tokio::test]
async fn negotiation_prefers_webm_opus() {
    let capturer = MockCapturer::new(MimeType::PREFERENCE_ORDER.to_vec(), vec![vec![1; 200]]);
    let (mut recorder, _rx) = AudioRecorder::new(Box::new(capturer), &test_config());

    assert!(recorder.start_recording().await.unwrap());
    assert_eq!(
        recorder.mime_type().unwrap().to_string(),
        "audio/webm;codecs=opus"
    );
}

#[tokio::test]
async fn negotiation_falls_back_in_preference_order() {
    let ogg_vorbis = MimeType::PREFERENCE_ORDER[3];
    let capturer = MockCapturer::new(vec![ogg_vorbis], vec![vec![1; 200]]);
    let (mut recorder, _rx) = AudioRecorder::new(Box::new(capturer), &test_config());

    assert!(recorder.start_recording().await.unwrap());
    assert_eq!(
        recorder.mime_type().unwrap().to_string(),
        "audio/ogg;codecs=vorbis"
    );
}

#[tokio::test]
async fn negotiation_fails_without_any_supported_pair() {
    let capturer = MockCapturer::new(vec![], vec![]);
    let (mut recorder, _rx) = AudioRecorder::new(Box::new(capturer), &test_config());

    match recorder.start_recording().await {
        Err(VoiceError::UnsupportedCodec) => {}
        other => panic!("expected UnsupportedCodec, got {:?}", other.map(|_| ())),
    }
    assert!(!recorder.is_recording());
}

#[tokio::test]
async fn header_precedes_buffers_and_is_emitted_once() {
    // ogg/opus has no canned init segment, so the probe chunk itself becomes
    // the header.
    let ogg_opus = MimeType::PREFERENCE_ORDER[2];
    let probe = vec![7u8; 150];
    let c1 = vec![1u8; 64];
    let c2 = vec![2u8; 64];
    let capturer = MockCapturer::new(vec![ogg_opus], vec![probe.clone(), c1.clone(), c2.clone()]);

    let (mut recorder, rx) = AudioRecorder::new(Box::new(capturer), &test_config());
    assert!(recorder.start_recording().await.unwrap());

    let events = collect_events(rx).await;

    let mut saw_header = false;
    let mut buffers = Vec::new();
    for event in &events {
        match event {
            RecorderEvent::Header(header) => {
                assert!(!saw_header, "header emitted twice");
                assert!(buffers.is_empty(), "buffer arrived before header");
                assert_eq!(header.mime_type, "audio/ogg;codecs=opus");
                assert_eq!(header.data, probe);
                saw_header = true;
            }
            RecorderEvent::Buffer { chunks, .. } => {
                assert!(saw_header, "buffer arrived before header");
                buffers.extend(chunks.clone());
            }
            RecorderEvent::State(_) => {}
        }
    }

    assert!(saw_header);
    assert_eq!(buffers, vec![c1, c2]);
}

#[tokio::test]
async fn webm_opus_header_uses_canned_init_segment() {
    let probe = vec![9u8; 300];
    let capturer = MockCapturer::new(vec![MimeType::WEBM_OPUS], vec![probe.clone(), vec![1; 32]]);

    let (mut recorder, rx) = AudioRecorder::new(Box::new(capturer), &test_config());
    assert!(recorder.start_recording().await.unwrap());

    let events = collect_events(rx).await;
    let expected = init_segment::precomputed(&MimeType::WEBM_OPUS).unwrap();

    let header = events
        .iter()
        .find_map(|e| match e {
            RecorderEvent::Header(h) => Some(h.clone()),
            _ => None,
        })
        .expect("no header emitted");

    assert_eq!(header.data, expected);
    assert_ne!(header.data, probe, "probe chunk should be discarded");
    assert!(
        header.data.len() >= init_segment::HEADER_MIN_BYTES
            && header.data.len() <= init_segment::HEADER_MAX_BYTES
    );
}

#[tokio::test]
async fn interval_switches_to_steady_latency_after_header() {
    let capturer = MockCapturer::new(
        vec![MimeType::WEBM_OPUS],
        vec![vec![1; 128], vec![2; 128], vec![3; 128]],
    );
    let intervals = Arc::clone(&capturer.intervals);

    let (mut recorder, rx) = AudioRecorder::new(Box::new(capturer), &test_config());
    assert!(recorder.start_recording().await.unwrap());

    let _ = collect_events(rx).await;

    let recorded = intervals.lock().await;
    assert_eq!(recorded.as_slice(), &[Duration::from_millis(50)]);
}

#[tokio::test]
async fn start_is_idempotent_while_recording() {
    // A long chunk script keeps the session alive across the second call
    let capturer = MockCapturer::new(vec![MimeType::WEBM_OPUS], vec![vec![1; 128]; 200]);
    let (mut recorder, _rx) = AudioRecorder::new(Box::new(capturer), &test_config());

    assert!(recorder.start_recording().await.unwrap());
    assert!(!recorder.start_recording().await.unwrap());
    assert!(recorder.is_recording());
}

#[tokio::test]
async fn stop_releases_device_and_is_idempotent() {
    let capturer = MockCapturer::new(vec![MimeType::WEBM_OPUS], vec![vec![1; 128]; 200]);
    let released = Arc::clone(&capturer.released);

    let (mut recorder, mut rx) = AudioRecorder::new(Box::new(capturer), &test_config());
    assert!(recorder.start_recording().await.unwrap());

    recorder.stop_recording().await.unwrap();
    assert!(!recorder.is_recording());
    assert!(released.load(Ordering::SeqCst), "device not released");

    // Terminal transition reaches subscribers
    let mut saw_stop = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
    {
        if matches!(event, RecorderEvent::State(false)) {
            saw_stop = true;
            break;
        }
    }
    assert!(saw_stop);

    recorder.stop_recording().await.unwrap();
}

#[tokio::test]
async fn permission_denied_surfaces_from_capturer() {
    let mut capturer = MockCapturer::new(vec![MimeType::WEBM_OPUS], vec![]);
    capturer.fail_with = Some(|| VoiceError::PermissionDenied);

    let (mut recorder, _rx) = AudioRecorder::new(Box::new(capturer), &test_config());

    match recorder.start_recording().await {
        Err(VoiceError::PermissionDenied) => {}
        other => panic!("expected PermissionDenied, got {:?}", other.map(|_| ())),
    }
    assert!(!recorder.is_recording());
}
