//! End-to-end turn through the assistant with an in-memory remote side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use posso_voice::enquiry::whatsapp::WhatsAppHandoff;
use posso_voice::voice::capture::SampleSink;
use posso_voice::voice::codec::{self, AudioBuffer};
use posso_voice::voice::gemini_live::{FunctionCall, OutboundMessage, OutboundQueue, SetupMessage};
use posso_voice::voice::{
    Assistant, AssistantHandle, AudioOutput, ConnectionState, InputSource, LiveConnector,
    LiveEvent, LiveLink, MicrophoneAccess, PlaybackHandle, Role, Snapshot,
};
use posso_voice::VoiceError;

type Remote = (OutboundQueue, mpsc::Sender<LiveEvent>);

#[derive(Default)]
struct LoopbackConnector {
    remotes: Mutex<Vec<Remote>>,
    setups: Mutex<Vec<String>>,
}

#[async_trait]
impl LiveConnector for LoopbackConnector {
    async fn connect(&self, _session_id: &str, setup: &SetupMessage) -> Result<LiveLink, VoiceError> {
        self.setups
            .lock()
            .push(serde_json::to_string(setup).unwrap());
        let (link, out_rx, event_tx) = LiveLink::pair(64);
        self.remotes.lock().push((out_rx, event_tx));
        Ok(link)
    }
}

#[derive(Default, Clone)]
struct Mic {
    sink: Arc<Mutex<Option<SampleSink>>>,
}

impl Mic {
    fn speak(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink(samples);
        }
    }

    fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl InputSource for Mic {
    fn sample_rate(&self) -> u32 {
        codec::INPUT_SAMPLE_RATE
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), VoiceError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), VoiceError> {
        self.sink.lock().take();
        Ok(())
    }
}

#[async_trait]
impl MicrophoneAccess for Mic {
    async fn acquire(&self) -> Result<Box<dyn InputSource>, VoiceError> {
        Ok(Box::new(self.clone()))
    }
}

#[derive(Default, Clone)]
struct Speaker {
    scheduled: Arc<Mutex<Vec<(PlaybackHandle, f64)>>>,
}

impl AudioOutput for Speaker {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn play(&mut self, handle: PlaybackHandle, _buffer: Arc<AudioBuffer>, start_at: f64) -> Result<(), VoiceError> {
        self.scheduled.lock().push((handle, start_at));
        Ok(())
    }

    fn stop(&mut self, _handle: PlaybackHandle) -> Result<(), VoiceError> {
        Ok(())
    }
}

async fn wait_for(handle: &AssistantHandle, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            rx.changed().await.expect("assistant task ended");
        }
    })
    .await
    .expect("timed out waiting for assistant state")
}

#[tokio::test]
async fn full_turn_with_enquiry() {
    let connector = Arc::new(LoopbackConnector::default());
    let mic = Mic::default();
    let speaker = Speaker::default();
    let (_ended_tx, ended_rx) = mpsc::unbounded_channel();
    let (handoff, mut prepared) = WhatsAppHandoff::new("447867597844");

    let (handle, task) = Assistant {
        connector: connector.clone(),
        microphone: Arc::new(mic.clone()),
        output: Box::new(speaker.clone()),
        playback_ended: ended_rx,
        handoff: Arc::new(handoff),
        model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
        voice: "Puck".into(),
        frame_size: 160,
    }
    .spawn();

    handle.start();
    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
    assert!(snapshot.recording);

    let setup = connector.setups.lock()[0].clone();
    assert!(setup.contains("open_enquiry_form"));
    assert!(setup.contains("\"voiceName\":\"Puck\""));

    let (mut outbound, events) = connector.remotes.lock().remove(0);

    // Microphone audio leaves in fixed frames.
    mic.speak(&[0.25; 100]);
    mic.speak(&[0.25; 100]);
    match tokio::time::timeout(Duration::from_secs(5), outbound.recv()).await {
        Ok(Some(OutboundMessage::Audio(frame))) => {
            assert_eq!(frame.samples().len(), 160);
            assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        }
        other => panic!("expected an audio frame, got {other:?}"),
    }

    // One server turn: speech, transcripts, a tool call, then turn complete.
    let chunk = codec::encode_base64(&codec::pcm_to_bytes(&[0i16; 2400]));
    for event in [
        LiveEvent::InputTranscript {
            text: "I'd like a demo, ".into(),
        },
        LiveEvent::InputTranscript {
            text: "I'm Jane Doe.".into(),
        },
        LiveEvent::Audio {
            data: chunk.clone(),
            sample_rate: 24_000,
        },
        LiveEvent::Audio {
            data: chunk,
            sample_rate: 24_000,
        },
        LiveEvent::OutputTranscript {
            text: "Thank you, Jane.".into(),
        },
        LiveEvent::ToolCall {
            calls: vec![FunctionCall {
                id: "call-1".into(),
                name: "open_enquiry_form".into(),
                args: serde_json::json!({
                    "customer_name": "Jane Doe",
                    "phone_number": "07700 900123",
                    "email_address": "jane@example.com",
                    "product_interest": "Dojo"
                }),
            }],
        },
        LiveEvent::TurnComplete,
    ] {
        events.send(event).await.unwrap();
    }

    let snapshot = wait_for(&handle, |s| s.transcript.len() == 2).await;
    assert_eq!(snapshot.transcript[0].role, Role::User);
    assert_eq!(snapshot.transcript[0].text, "I'd like a demo, I'm Jane Doe.");
    assert_eq!(snapshot.transcript[1].role, Role::Assistant);
    assert_eq!(snapshot.transcript[1].text, "Thank you, Jane.");

    // Chunks were scheduled back to back (0.1 s each).
    let scheduled = speaker.scheduled.lock().clone();
    assert_eq!(scheduled.len(), 2);
    assert!((scheduled[1].1 - scheduled[0].1 - 0.1).abs() < 1e-9);

    // The enquiry reached the hand-off and the call was acknowledged.
    let message = tokio::time::timeout(Duration::from_secs(5), prepared.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.customer_name, "Jane Doe");
    assert!(message.url.starts_with("https://wa.me/447867597844?text="));
    assert!(message.url.contains("Dojo"));
    assert!(message.url.contains("No%20additional%20notes"));

    let ack = loop {
        match tokio::time::timeout(Duration::from_secs(5), outbound.recv()).await {
            Ok(Some(OutboundMessage::ToolResponse(responses))) => break responses,
            Ok(Some(_)) => continue,
            other => panic!("expected a tool response, got {other:?}"),
        }
    };
    assert_eq!(ack[0].id, "call-1");
    assert_eq!(ack[0].response["result"], "ok, enquiry opened successfully");

    // Hang up: capture released, connection closed.
    handle.stop();
    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
    assert!(!snapshot.recording);
    assert!(!mic.is_open());
    let closed = loop {
        match tokio::time::timeout(Duration::from_secs(5), outbound.recv()).await {
            Ok(Some(OutboundMessage::Close)) => break true,
            Ok(Some(_)) => continue,
            _ => break false,
        }
    };
    assert!(closed);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn remote_error_surfaces_connection_message() {
    let connector = Arc::new(LoopbackConnector::default());
    let mic = Mic::default();
    let (_ended_tx, ended_rx) = mpsc::unbounded_channel();
    let (handoff, _prepared) = WhatsAppHandoff::new("447867597844");

    let (handle, _task) = Assistant {
        connector: connector.clone(),
        microphone: Arc::new(mic.clone()),
        output: Box::new(Speaker::default()),
        playback_ended: ended_rx,
        handoff: Arc::new(handoff),
        model: "gemini-test".into(),
        voice: "Puck".into(),
        frame_size: 4096,
    }
    .spawn();

    handle.start();
    wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
    let events = connector.remotes.lock()[0].1.clone();
    events
        .send(LiveEvent::Error {
            message: "WebSocket error: reset".into(),
        })
        .await
        .unwrap();

    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Error).await;
    assert_eq!(snapshot.last_error.as_deref(), Some("Connection error occurred."));
    assert!(!mic.is_open());

    // The user can start again from the error state.
    handle.start();
    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(snapshot.last_error, None);
    assert!(mic.is_open());
}
