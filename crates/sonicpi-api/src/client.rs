//! Host callback interface.
//!
//! Callbacks run on control plane threads (the message listener and the
//! audio worker), never on the thread that called into the API. Marshalling
//! onto a UI thread is left to the implementation.

use crate::audio::ProcessedAudio;
use crate::events::{ApiEvent, BufferInfo, CueInfo, MessageInfo, MidiInfo, StatusInfo, VersionInfo};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;

/// Receiver of control plane events. One method per event kind.
pub trait ApiClient: Send + Sync {
    fn report(&self, info: &MessageInfo);
    fn status(&self, info: &StatusInfo);
    fn cue(&self, info: &CueInfo);
    fn midi(&self, info: &MidiInfo);
    fn version(&self, info: &VersionInfo);
    fn buffer(&self, info: &BufferInfo);
    /// A new processed audio snapshot has been published.
    ///
    /// The snapshot comes from a small fixed pool; a clone kept past the next
    /// few frames keeps its slot busy and newer frames get dropped.
    fn audio_data_available(&self, _audio: &Arc<ProcessedAudio>) {}
}

/// Route an event to the matching client method.
pub fn deliver(client: &dyn ApiClient, event: &ApiEvent) {
    match event {
        ApiEvent::Report(info) => client.report(info),
        ApiEvent::Status(info) => client.status(info),
        ApiEvent::Cue(info) => client.cue(info),
        ApiEvent::Midi(info) => client.midi(info),
        ApiEvent::Version(info) => client.version(info),
        ApiEvent::Buffer(info) => client.buffer(info),
        // Snapshots reach callback clients straight from the audio worker.
        ApiEvent::AudioDataAvailable => {}
    }
}

/// Client that forwards every event into a channel.
///
/// Useful for hosts that prefer to pull events on their own thread.
#[derive(Clone)]
pub struct ChannelClient {
    tx: Sender<ApiEvent>,
    forward_audio: bool,
}

impl ChannelClient {
    /// Create a client and the receiving end of its event channel.
    pub fn new() -> (Self, Receiver<ApiEvent>) {
        let (tx, rx) = unbounded();
        (
            Self {
                tx,
                forward_audio: true,
            },
            rx,
        )
    }

    /// Skip audio notifications; hosts can still poll
    /// [`crate::AudioPipeline::latest`].
    pub fn without_audio(mut self) -> Self {
        self.forward_audio = false;
        self
    }

    fn forward(&self, event: ApiEvent) {
        // Receiver dropped means the host stopped listening.
        let _ = self.tx.send(event);
    }
}

impl ApiClient for ChannelClient {
    fn report(&self, info: &MessageInfo) {
        self.forward(ApiEvent::Report(info.clone()));
    }

    fn status(&self, info: &StatusInfo) {
        self.forward(ApiEvent::Status(info.clone()));
    }

    fn cue(&self, info: &CueInfo) {
        self.forward(ApiEvent::Cue(info.clone()));
    }

    fn midi(&self, info: &MidiInfo) {
        self.forward(ApiEvent::Midi(info.clone()));
    }

    fn version(&self, info: &VersionInfo) {
        self.forward(ApiEvent::Version(info.clone()));
    }

    fn buffer(&self, info: &BufferInfo) {
        self.forward(ApiEvent::Buffer(info.clone()));
    }

    fn audio_data_available(&self, _audio: &Arc<ProcessedAudio>) {
        if self.forward_audio {
            self.forward(ApiEvent::AudioDataAvailable);
        }
    }
}
