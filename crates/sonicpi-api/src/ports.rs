//! Port registry for the session.
//!
//! Every participant (GUI, runtime, synthesis engine, cue bus, MIDI bridge,
//! websocket) talks over its own UDP port. The set is negotiated once at
//! startup by running the discovery helper and parsing its `name: port`
//! output; the registry is read-only afterwards.

use crate::error::{ApiError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Named port roles.
///
/// The names match the symbols printed by the discovery helper and cannot be
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortId {
    GuiListenToServer,
    GuiSendToServer,
    ServerListenToGui,
    ServerSendToGui,
    Scsynth,
    ScsynthSend,
    ServerOscCues,
    ErlangRouter,
    OscMidiOut,
    OscMidiIn,
    Websocket,
}

impl PortId {
    pub const ALL: [PortId; 11] = [
        PortId::GuiListenToServer,
        PortId::GuiSendToServer,
        PortId::ServerListenToGui,
        PortId::ServerSendToGui,
        PortId::Scsynth,
        PortId::ScsynthSend,
        PortId::ServerOscCues,
        PortId::ErlangRouter,
        PortId::OscMidiOut,
        PortId::OscMidiIn,
        PortId::Websocket,
    ];

    /// Roles without which a session cannot start.
    pub const MANDATORY: [PortId; 5] = [
        PortId::GuiListenToServer,
        PortId::GuiSendToServer,
        PortId::ServerListenToGui,
        PortId::ServerSendToGui,
        PortId::Scsynth,
    ];

    /// Order in which ports are passed to the runtime on its command line.
    pub const SERVER_ARGS: [PortId; 9] = [
        PortId::ServerListenToGui,
        PortId::ServerSendToGui,
        PortId::Scsynth,
        PortId::ScsynthSend,
        PortId::ServerOscCues,
        PortId::ErlangRouter,
        PortId::OscMidiOut,
        PortId::OscMidiIn,
        PortId::Websocket,
    ];

    /// The name used by the discovery helper.
    pub fn name(self) -> &'static str {
        match self {
            PortId::GuiListenToServer => "gui-listen-to-server",
            PortId::GuiSendToServer => "gui-send-to-server",
            PortId::ServerListenToGui => "server-listen-to-gui",
            PortId::ServerSendToGui => "server-send-to-gui",
            PortId::Scsynth => "scsynth",
            PortId::ScsynthSend => "scsynth-send",
            PortId::ServerOscCues => "server-osc-cues",
            PortId::ErlangRouter => "erlang-router",
            PortId::OscMidiOut => "osc-midi-out",
            PortId::OscMidiIn => "osc-midi-in",
            PortId::Websocket => "websocket",
        }
    }

    /// Parse a helper name. Underscores and dashes are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().replace('_', "-");
        PortId::ALL.into_iter().find(|id| id.name() == normalized)
    }

    pub fn is_mandatory(self) -> bool {
        PortId::MANDATORY.contains(&self)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved role → port assignments for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRegistry {
    ports: BTreeMap<PortId, u16>,
}

impl PortRegistry {
    /// Parse discovery helper output into a complete registry.
    ///
    /// Lines look like `gui-listen-to-server: 51235`. Blank lines and unknown
    /// names are skipped. Fails if a known role carries an invalid port or a
    /// mandatory role is missing; nothing is resolvable on failure.
    pub fn resolve(output: &str) -> Result<Self> {
        let line_re = Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_-]*)\s*:\s*(\S+)\s*$")
            .map_err(|e| ApiError::PortResolution(e.to_string()))?;

        let mut ports = BTreeMap::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let Some(caps) = line_re.captures(line) else {
                log::debug!("[PORTS] Ignoring discovery line: {:?}", line);
                continue;
            };
            let Some(id) = PortId::from_name(&caps[1]) else {
                log::debug!("[PORTS] Ignoring unknown port name '{}'", &caps[1]);
                continue;
            };
            let port = parse_port(&caps[2]).ok_or_else(|| {
                ApiError::PortResolution(format!("invalid port value '{}' for {}", &caps[2], id))
            })?;
            if ports.insert(id, port).is_some() {
                log::warn!("[PORTS] Port {} listed twice, using {}", id, port);
            }
        }

        let missing: Vec<&str> = PortId::MANDATORY
            .iter()
            .filter(|id| !ports.contains_key(*id))
            .map(|id| id.name())
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::PortResolution(format!(
                "missing mandatory ports: {}",
                missing.join(", ")
            )));
        }

        for (id, port) in &ports {
            log::info!("[PORTS] {}: {}", id, port);
        }
        Ok(Self { ports })
    }

    /// Build a registry directly from pairs, without mandatory-role checks.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (PortId, u16)>,
    {
        Self {
            ports: pairs.into_iter().collect(),
        }
    }

    /// Port for a role, or `None` if that channel is disabled this session.
    pub fn port(&self, id: PortId) -> Option<u16> {
        self.ports.get(&id).copied()
    }

    /// Port for a role, failing if absent.
    pub fn require(&self, id: PortId) -> Result<u16> {
        self.port(id).ok_or(ApiError::PortUnavailable(id))
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortId, u16)> + '_ {
        self.ports.iter().map(|(id, port)| (*id, *port))
    }

    /// Ports in runtime command-line order. Absent roles are passed as `-1`
    /// so positions stay stable.
    pub fn server_args(&self) -> Vec<String> {
        PortId::SERVER_ARGS
            .iter()
            .map(|id| match self.port(*id) {
                Some(port) => port.to_string(),
                None => "-1".to_string(),
            })
            .collect()
    }
}

fn parse_port(value: &str) -> Option<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
