//! Address pattern → event classification.
//!
//! The table is fixed: each known address maps to one event kind and an
//! expected argument layout. Unknown addresses classify to `None`; argument
//! mismatches are [`ApiError::Decode`] errors for that message only.

use crate::error::{ApiError, Result};
use crate::events::{
    ApiEvent, BufferInfo, BufferType, CueInfo, MessageData, MessageInfo, MessageType, MidiInfo,
    MidiType, StatusInfo, StatusType, VersionInfo,
};
use rosc::{OscMessage, OscType};
use std::time::Instant;

/// Stateful classifier; owns the cue sequence counter.
#[derive(Debug, Default)]
pub struct Classifier {
    next_cue_index: u64,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one inbound message.
    pub fn classify(&mut self, msg: &OscMessage, arrival: Instant) -> Result<Option<ApiEvent>> {
        let mut args = Args::new(msg);
        let event = match msg.addr.as_str() {
            "/log/multi_message" => {
                let mut info = MessageInfo::new(MessageType::Multi, "");
                info.job_id = args.int()?;
                info.thread_name = args.string()?;
                info.runtime = args.string()?;
                let count = args.int()?;
                if count < 0 {
                    return Err(ApiError::decode(&msg.addr, "negative message count"));
                }
                for _ in 0..count {
                    let style = args.int()?;
                    let text = args.string()?;
                    info.multi.push(MessageData { text, style });
                }
                ApiEvent::Report(info)
            }
            "/log/info" => {
                let style = args.int()?;
                let mut info = MessageInfo::new(MessageType::Info, args.string()?);
                info.style = style;
                ApiEvent::Report(info)
            }
            "/info" => ApiEvent::Report(MessageInfo::new(MessageType::InfoText, args.string()?)),
            "/error" => {
                let job_id = args.int()?;
                let mut info = MessageInfo::new(MessageType::RuntimeError, args.string()?);
                info.job_id = job_id;
                info.backtrace = args.string()?;
                info.line = args.int()?;
                ApiEvent::Report(info)
            }
            "/syntax_error" => {
                let job_id = args.int()?;
                let mut info = MessageInfo::new(MessageType::SyntaxError, args.string()?);
                info.job_id = job_id;
                info.error_line_string = args.string()?;
                info.line = args.int()?;
                info.line_num_string = args.string()?;
                ApiEvent::Report(info)
            }
            "/exited-with-boot-error" => {
                ApiEvent::Report(MessageInfo::new(MessageType::StartupError, args.string()?))
            }
            "/incoming/osc" => {
                let time = args.string()?;
                let id = args.int()?;
                let address = args.string()?;
                let cue_args = args.string()?;
                let index = self.next_cue_index;
                self.next_cue_index += 1;
                ApiEvent::Cue(CueInfo {
                    time,
                    address,
                    id,
                    args: cue_args,
                    index,
                    arrival,
                })
            }
            "/buffer/replace" => {
                let mut info = BufferInfo::new(BufferType::Replace);
                info.id = args.string()?;
                info.content = args.string()?;
                info.line = args.int()?;
                info.index = args.int()?;
                info.line_number = args.int()?;
                ApiEvent::Buffer(info)
            }
            "/buffer/replace-idx" => {
                let mut info = BufferInfo::new(BufferType::ReplaceIndex);
                info.buffer_index = args.int()?;
                info.content = args.string()?;
                info.line = args.int()?;
                info.index = args.int()?;
                info.line_number = args.int()?;
                ApiEvent::Buffer(info)
            }
            "/buffer/replace-lines" => {
                let mut info = BufferInfo::new(BufferType::ReplaceLines);
                info.id = args.string()?;
                info.content = args.string()?;
                info.start_line = args.int()?;
                info.finish_line = args.int()?;
                info.point_line = args.int()?;
                info.point_index = args.int()?;
                ApiEvent::Buffer(info)
            }
            "/buffer/run-idx" => {
                let mut info = BufferInfo::new(BufferType::RunIndex);
                info.buffer_index = args.int()?;
                ApiEvent::Buffer(info)
            }
            "/ack" => ApiEvent::Status(StatusInfo {
                kind: StatusType::Ack,
                id: args.optional_string(),
            }),
            "/runs/all-completed" => ApiEvent::Status(StatusInfo {
                kind: StatusType::AllComplete,
                id: args.optional_string(),
            }),
            "/exited" => ApiEvent::Status(StatusInfo {
                kind: StatusType::Exited,
                id: args.optional_string(),
            }),
            "/version" => ApiEvent::Version(VersionInfo {
                version: args.string()?,
                num: args.int()?,
                latest_version: args.string()?,
                latest_version_num: args.int()?,
                last_checked_day: args.int()?,
                last_checked_month: args.int()?,
                last_checked_year: args.int()?,
                platform: args.string()?,
            }),
            "/midi/out-ports" => ApiEvent::Midi(MidiInfo {
                kind: MidiType::Out,
                port_info: args.string()?,
            }),
            "/midi/in-ports" => ApiEvent::Midi(MidiInfo {
                kind: MidiType::In,
                port_info: args.string()?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Sequential typed access to message arguments.
struct Args<'a> {
    msg: &'a OscMessage,
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(msg: &'a OscMessage) -> Self {
        Self { msg, pos: 0 }
    }

    fn next(&mut self) -> Result<&'a OscType> {
        let arg = self.msg.args.get(self.pos).ok_or_else(|| {
            ApiError::decode(&self.msg.addr, format!("missing argument {}", self.pos))
        })?;
        self.pos += 1;
        Ok(arg)
    }

    fn int(&mut self) -> Result<i32> {
        let pos = self.pos;
        match self.next()? {
            OscType::Int(i) => Ok(*i),
            OscType::Long(l) => i32::try_from(*l).map_err(|_| {
                ApiError::decode(&self.msg.addr, format!("argument {} out of range", pos))
            }),
            OscType::Float(f) => Ok(*f as i32),
            OscType::Double(d) => Ok(*d as i32),
            other => Err(ApiError::decode(
                &self.msg.addr,
                format!("argument {} should be an int, got {:?}", pos, other),
            )),
        }
    }

    fn string(&mut self) -> Result<String> {
        let pos = self.pos;
        match self.next()? {
            OscType::String(s) => Ok(s.clone()),
            other => Err(ApiError::decode(
                &self.msg.addr,
                format!("argument {} should be a string, got {:?}", pos, other),
            )),
        }
    }

    fn optional_string(&mut self) -> String {
        match self.msg.args.get(self.pos) {
            Some(OscType::String(s)) => {
                self.pos += 1;
                s.clone()
            }
            _ => String::new(),
        }
    }
}
