//! Typed events delivered to the host.
//!
//! Every inbound message the runtime sends is classified into one of these.
//! They are produced by the listener thread, handed to the host client by
//! value and not retained afterwards.

use std::time::Instant;

/// Kind of a [`MessageInfo`] report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    StartupError,
    RuntimeError,
    SyntaxError,
    Message,
    Info,
    InfoText,
    Multi,
    /// Diagnostics raised by the control plane itself (decode or transport
    /// failures, unknown messages are not reported).
    Internal,
}

/// One line of a multi-part log message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageData {
    pub text: String,
    pub style: i32,
}

/// Text or diagnostic output from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub kind: MessageType,
    pub text: String,
    pub style: i32,
    pub job_id: i32,
    pub thread_name: String,
    pub runtime: String,
    pub backtrace: String,
    pub line: i32,
    pub error_line_string: String,
    pub line_num_string: String,
    pub multi: Vec<MessageData>,
}

impl MessageInfo {
    pub fn new(kind: MessageType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            style: 0,
            job_id: 0,
            thread_name: String::new(),
            runtime: String::new(),
            backtrace: String::new(),
            line: 0,
            error_line_string: String::new(),
            line_num_string: String::new(),
            multi: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// Readiness acknowledgement.
    Ack,
    AllComplete,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub kind: StatusType,
    pub id: String,
}

/// A cue observed on the runtime's event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueInfo {
    pub time: String,
    pub address: String,
    pub id: i32,
    pub args: String,
    /// Monotonically increasing per listener.
    pub index: u64,
    pub arrival: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiType {
    Out,
    In,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiInfo {
    pub kind: MidiType,
    pub port_info: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub num: i32,
    pub latest_version: String,
    pub latest_version_num: i32,
    pub last_checked_day: i32,
    pub last_checked_month: i32,
    pub last_checked_year: i32,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Replace the buffer named by `id`.
    Replace,
    /// Replace the buffer at `buffer_index`.
    ReplaceIndex,
    /// Replace `start_line..=finish_line` and move the cursor.
    ReplaceLines,
    /// Run the buffer at `buffer_index`.
    RunIndex,
}

/// An editor buffer update requested by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub kind: BufferType,
    pub id: String,
    pub buffer_index: i32,
    pub content: String,
    pub line: i32,
    pub index: i32,
    pub line_number: i32,
    pub start_line: i32,
    pub finish_line: i32,
    pub point_line: i32,
    pub point_index: i32,
}

impl BufferInfo {
    pub fn new(kind: BufferType) -> Self {
        Self {
            kind,
            id: String::new(),
            buffer_index: 0,
            content: String::new(),
            line: 0,
            index: 0,
            line_number: 0,
            start_line: 0,
            finish_line: 0,
            point_line: 0,
            point_index: 0,
        }
    }
}

/// Everything the control plane can tell the host.
#[derive(Debug, Clone)]
pub enum ApiEvent {
    Report(MessageInfo),
    Status(StatusInfo),
    Cue(CueInfo),
    Midi(MidiInfo),
    Version(VersionInfo),
    Buffer(BufferInfo),
    /// A new audio snapshot is ready; read it with
    /// [`crate::AudioPipeline::latest`]. Carries no snapshot so queued
    /// notifications never pin audio storage.
    AudioDataAvailable,
}

impl ApiEvent {
    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ApiEvent::Report(_) => "report",
            ApiEvent::Status(_) => "status",
            ApiEvent::Cue(_) => "cue",
            ApiEvent::Midi(_) => "midi",
            ApiEvent::Version(_) => "version",
            ApiEvent::Buffer(_) => "buffer",
            ApiEvent::AudioDataAvailable => "audio",
        }
    }
}
