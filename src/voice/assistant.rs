//! The event-processing task that drives a [`SessionChannel`].
//!
//! Everything that mutates session state runs here, one input at a time:
//! UI commands, connect outcomes, server events and playback completions.
//! Microphone acquisition and connecting run in spawned tasks and report
//! back through the same queue, tagged with the session generation that
//! asked for them, so a `stop()` issued meanwhile simply makes the result
//! stale.
//!
//! The UI side holds an [`AssistantHandle`]: commands go in, [`Snapshot`]s
//! come out through a `watch` channel.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::capture::{InputSource, MicrophoneAccess};
use super::gemini_live::{build_setup_message, LiveConnector, LiveLink};
use super::playback::{AudioOutput, PlaybackHandle};
use super::session::{SessionChannel, Snapshot};
use super::transcript::Feedback;
use super::LiveEvent;
use crate::enquiry::{EnquiryBridge, EnquiryHandoff};
use crate::error::VoiceError;

/// Commands issued by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Feedback { index: usize, tag: Feedback },
    Shutdown,
}

/// Results coming back from spawned work.
enum Internal {
    Opened {
        generation: u64,
        result: Result<(Box<dyn InputSource>, LiveLink), VoiceError>,
    },
    Live {
        generation: u64,
        event: LiveEvent,
    },
}

/// UI-side handle to a running assistant.
#[derive(Clone)]
pub struct AssistantHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl AssistantHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(?command, "Assistant task already finished");
        }
    }

    /// Start a session, tearing down any running one first.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn set_feedback(&self, index: usize, tag: Feedback) {
        self.send(Command::Feedback { index, tag });
    }

    /// Stop any session and end the task.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }
}

/// Everything an assistant needs from its environment.
pub struct Assistant {
    pub connector: Arc<dyn LiveConnector>,
    pub microphone: Arc<dyn MicrophoneAccess>,
    pub output: Box<dyn AudioOutput>,
    /// Natural-completion notifications from `output`.
    pub playback_ended: mpsc::UnboundedReceiver<PlaybackHandle>,
    pub handoff: Arc<dyn EnquiryHandoff>,
    pub model: String,
    pub voice: String,
    pub frame_size: usize,
}

impl Assistant {
    /// Spawn the event-processing task.
    pub fn spawn(self) -> (AssistantHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let handle = AssistantHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        let task = tokio::spawn(self.run(command_rx, snapshot_tx));
        (handle, task)
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>, snapshots: watch::Sender<Snapshot>) {
        let Assistant {
            connector,
            microphone,
            output,
            mut playback_ended,
            handoff,
            model,
            voice,
            frame_size,
        } = self;

        let mut channel = SessionChannel::new(output, EnquiryBridge::new(handoff), frame_size);
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => {
                        let generation = channel.start();
                        spawn_connect(
                            generation,
                            connector.clone(),
                            microphone.clone(),
                            model.clone(),
                            voice.clone(),
                            internal_tx.clone(),
                        );
                    }
                    Some(Command::Stop) => channel.stop(),
                    Some(Command::Feedback { index, tag }) => channel.set_feedback(index, tag),
                    Some(Command::Shutdown) | None => {
                        channel.stop();
                        publish(&snapshots, &channel);
                        break;
                    }
                },
                Some(internal) = internal_rx.recv() => match internal {
                    Internal::Opened { generation, result: Ok((source, link)) } => {
                        let LiveLink { sender, events } = link;
                        if channel.on_open(generation, source, sender) {
                            spawn_forwarder(generation, events, internal_tx.clone());
                        }
                    }
                    Internal::Opened { generation, result: Err(e) } => {
                        channel.on_start_failed(generation, e);
                    }
                    Internal::Live { generation, event } => channel.handle_event(generation, event),
                },
                Some(handle) = playback_ended.recv() => channel.on_playback_ended(handle),
            }

            publish(&snapshots, &channel);
        }

        tracing::debug!("Assistant task finished");
    }
}

fn publish(snapshots: &watch::Sender<Snapshot>, channel: &SessionChannel) {
    let next = channel.snapshot();
    snapshots.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Acquire the microphone, then connect; report the outcome as `generation`.
fn spawn_connect(
    generation: u64,
    connector: Arc<dyn LiveConnector>,
    microphone: Arc<dyn MicrophoneAccess>,
    model: String,
    voice: String,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        let session_id = uuid::Uuid::new_v4().to_string();
        let result: Result<(Box<dyn InputSource>, LiveLink), VoiceError> = async {
            let source = microphone.acquire().await?;
            let setup = build_setup_message(&model, &voice);
            let link = connector.connect(&session_id, &setup).await?;
            Ok((source, link))
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!(session_id = %session_id, generation, error = %e, "Voice session start failed");
        }
        if internal_tx.send(Internal::Opened { generation, result }).is_err() {
            tracing::debug!(session_id = %session_id, "Assistant gone before connect finished");
        }
    });
}

/// Forward server events of one session into the processing queue.
fn spawn_forwarder(
    generation: u64,
    mut events: mpsc::Receiver<LiveEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, LiveEvent::Closed { .. });
            if internal_tx.send(Internal::Live { generation, event }).is_err() || closed {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enquiry::test_support::RecordingHandoff;
    use crate::voice::capture::test_support::FakeMicrophone;
    use crate::voice::gemini_live::{OutboundQueue, SetupMessage};
    use crate::voice::playback::test_support::ManualOutput;
    use crate::voice::session::{ConnectionState, START_FAILURE_MESSAGE};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Connector whose remote ends are handed to the test.
    #[derive(Default)]
    struct FakeConnector {
        remotes: Mutex<Vec<(OutboundQueue, mpsc::Sender<LiveEvent>)>>,
        fail: bool,
    }

    #[async_trait]
    impl LiveConnector for FakeConnector {
        async fn connect(&self, _session_id: &str, setup: &SetupMessage) -> Result<LiveLink, VoiceError> {
            assert!(setup.setup.model.starts_with("models/"));
            if self.fail {
                return Err(VoiceError::Connection("refused".into()));
            }
            let (link, out_rx, event_tx) = LiveLink::pair(64);
            self.remotes.lock().push((out_rx, event_tx));
            Ok(link)
        }
    }

    fn spawn_with(
        connector: Arc<FakeConnector>,
        microphone: Arc<FakeMicrophone>,
    ) -> (AssistantHandle, JoinHandle<()>, mpsc::UnboundedSender<PlaybackHandle>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let assistant = Assistant {
            connector,
            microphone,
            output: Box::new(ManualOutput::default()),
            playback_ended: ended_rx,
            handoff: Arc::new(RecordingHandoff::default()),
            model: "gemini-test".into(),
            voice: "Puck".into(),
            frame_size: 4,
        };
        let (handle, task) = assistant.spawn();
        (handle, task, ended_tx)
    }

    async fn wait_for(handle: &AssistantHandle, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        })
        .await
        .expect("snapshot condition not reached")
    }

    #[tokio::test]
    async fn start_connects_and_records() {
        let connector = Arc::new(FakeConnector::default());
        let microphone = Arc::new(FakeMicrophone::default());
        let (handle, _task, _ended) = spawn_with(connector.clone(), microphone.clone());

        handle.start();
        let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
        assert!(snapshot.recording);
        assert!(microphone.last_probe().unwrap().is_running());
        assert_eq!(connector.remotes.lock().len(), 1);
    }

    #[tokio::test]
    async fn denied_microphone_ends_in_error() {
        let connector = Arc::new(FakeConnector::default());
        let microphone = Arc::new(FakeMicrophone {
            deny: true,
            ..Default::default()
        });
        let (handle, _task, _ended) = spawn_with(connector.clone(), microphone);

        handle.start();
        let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Error).await;
        assert_eq!(snapshot.last_error.as_deref(), Some(START_FAILURE_MESSAGE));
        assert!(connector.remotes.lock().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_ends_in_error() {
        let connector = Arc::new(FakeConnector {
            fail: true,
            ..Default::default()
        });
        let (handle, _task, _ended) = spawn_with(connector, Arc::new(FakeMicrophone::default()));

        handle.start();
        let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Error).await;
        assert_eq!(snapshot.last_error.as_deref(), Some(START_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn server_turn_reaches_transcript() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, _task, _ended) = spawn_with(connector.clone(), Arc::new(FakeMicrophone::default()));

        handle.start();
        wait_for(&handle, |s| s.state == ConnectionState::Connected).await;

        let events = connector.remotes.lock()[0].1.clone();
        events
            .send(LiveEvent::InputTranscript { text: "Hello".into() })
            .await
            .unwrap();
        events.send(LiveEvent::TurnComplete).await.unwrap();

        let snapshot = wait_for(&handle, |s| !s.transcript.is_empty()).await;
        assert_eq!(snapshot.transcript.len(), 1);
        assert_eq!(snapshot.transcript[0].text, "Hello");

        handle.set_feedback(0, Feedback::Down);
        let snapshot = wait_for(&handle, |s| s.transcript[0].feedback.is_some()).await;
        assert_eq!(snapshot.transcript[0].feedback, Some(Feedback::Down));
    }

    #[tokio::test]
    async fn restart_never_runs_two_captures() {
        let connector = Arc::new(FakeConnector::default());
        let microphone = Arc::new(FakeMicrophone::default());
        let (handle, _task, _ended) = spawn_with(connector.clone(), microphone.clone());

        handle.start();
        wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
        let first = microphone.last_probe().unwrap();

        handle.start();
        wait_for(&handle, |_| connector.remotes.lock().len() == 2).await;
        wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
        let second = microphone.last_probe().unwrap();

        assert!(!first.is_running());
        assert!(second.is_running());
    }

    #[tokio::test]
    async fn remote_close_and_shutdown() {
        let connector = Arc::new(FakeConnector::default());
        let microphone = Arc::new(FakeMicrophone::default());
        let (handle, task, _ended) = spawn_with(connector.clone(), microphone.clone());

        handle.start();
        wait_for(&handle, |s| s.state == ConnectionState::Connected).await;
        let events = connector.remotes.lock()[0].1.clone();
        events.send(LiveEvent::Closed { reason: None }).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
        assert!(!snapshot.recording);
        assert!(!microphone.last_probe().unwrap().is_running());

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
