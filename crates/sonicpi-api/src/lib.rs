//! Sonic Pi API - Control plane for the Sonic Pi live-coding runtime.
//!
//! This crate lets a host application (an editor, a GUI, a CLI) drive the
//! runtime without knowing how it is started or spoken to:
//!
//! - **Paths** - Application and user folder layout
//! - **Ports** - Discovery helper output parsed into named port roles
//! - **Process** - Spawning, watching and terminating runtime processes
//! - **OSC** - Outbound requests and the inbound listener thread
//! - **Dispatch** - Inbound messages classified into typed events
//! - **Settings** - User preferences injected into submitted code
//! - **Audio** - Spectrum analysis of captured audio for visualisers
//! - **API** - The session state machine tying it all together
//!
//! # Architecture
//!
//! A [`SonicPiApi`] owns one session. Hosts implement [`ApiClient`] (or use
//! [`ChannelClient`]) and receive every [`ApiEvent`] on control plane
//! threads. Requests go out through [`SonicPiApi`] methods, which are only
//! accepted once the runtime has acknowledged startup.
//!
//! ```no_run
//! use sonicpi_api::{ChannelClient, SonicPiApi};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let (client, events) = ChannelClient::new();
//! let mut api = SonicPiApi::new(Arc::new(client));
//! api.init(Path::new("/opt/sonic-pi"))?;
//! api.wait_for_server()?;
//! api.run("workspace_zero", "play 60")?;
//! while let Ok(event) = events.recv() {
//!     println!("{}", event.kind_name());
//! }
//! # Ok::<(), sonicpi_api::ApiError>(())
//! ```

pub mod api;
pub mod audio;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod listener;
pub mod osc;
pub mod paths;
pub mod ports;
pub mod process;
pub mod settings;

pub use api::{discover_ports, SessionState, SonicPiApi};
pub use audio::{AudioPipeline, ProcessedAudio};
pub use client::{ApiClient, ChannelClient};
pub use error::{ApiError, Result};
pub use events::{
    ApiEvent, BufferInfo, BufferType, CueInfo, MessageData, MessageInfo, MessageType, MidiInfo,
    MidiType, StatusInfo, StatusType, VersionInfo,
};
pub use paths::{ApiPath, LogOption, Paths};
pub use ports::{PortId, PortRegistry};
pub use process::{HelperCommand, OutputSink, ProcessSupervisor};
pub use settings::{ApiOptions, ApiSettings};
