//! User preferences and control plane options.
//!
//! Both are stored as TOML. [`ApiSettings`] are the user-facing preferences
//! that get injected ahead of submitted code; [`ApiOptions`] tune the control
//! plane itself (timeouts, audio sizes, launch commands).

use crate::error::Result;
use crate::paths::LogOption;
use crate::process::HelperCommand;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const PREFERENCE_SUFFIX: &str = " #__nosave__ set by Qt GUI user preferences.\n";

/// User preferences injected as directives ahead of submitted code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub log_synths: bool,
    pub log_cues: bool,
    pub check_args: bool,
    pub enable_external_synths: bool,
    pub timing_guarantees: bool,
    /// MIDI channel used by default, `-1` for all channels.
    pub default_midi_channel: i32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            log_synths: true,
            log_cues: false,
            check_args: true,
            enable_external_synths: true,
            timing_guarantees: false,
            default_midi_channel: -1,
        }
    }
}

impl ApiSettings {
    /// Prefix `code` with one directive line per preference.
    ///
    /// Each directive is prepended in turn, so the MIDI defaults line ends up
    /// first. The exact text is what the runtime expects.
    pub fn preprocess(&self, code: &str) -> String {
        let mut directives: Vec<String> = Vec::with_capacity(6);
        if !self.log_synths {
            directives.push("use_debug false".to_string());
        }
        if !self.log_cues {
            directives.push("use_cue_logging false".to_string());
        }
        if self.check_args {
            directives.push("use_arg_checks true".to_string());
        }
        if self.enable_external_synths {
            directives.push("use_external_synths true".to_string());
        }
        if self.timing_guarantees {
            directives.push("use_timing_guarantees true".to_string());
        }
        let channel = if self.default_midi_channel == -1 {
            "*".to_string()
        } else {
            self.default_midi_channel.to_string()
        };
        directives.push(format!("use_midi_defaults channel: \"{}\"", channel));

        let mut out = String::new();
        for directive in directives.iter().rev() {
            out.push_str(directive);
            out.push_str(PREFERENCE_SUFFIX);
        }
        out.push_str(code);
        out
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(path, &toml::to_string_pretty(self)?)
    }
}

/// Tunables for the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiOptions {
    /// How long `wait_for_server` waits for the readiness acknowledgement.
    #[serde(with = "millis")]
    pub readiness_timeout: Duration,
    /// Interval between readiness pings.
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// Upper bound for one-shot helpers (discovery, cleanup).
    #[serde(with = "millis")]
    pub helper_timeout: Duration,
    /// Grace window between the exit request and a forced kill.
    #[serde(with = "millis")]
    pub termination_grace: Duration,
    /// Samples per channel analysed per frame.
    pub audio_frame_size: usize,
    /// Initial maximum spectrum bucket count.
    pub max_buckets: usize,
    pub log_option: LogOption,
    /// Override the runtime launch command. Port arguments are appended.
    pub runtime_command: Option<HelperCommand>,
    /// Override the port discovery command.
    pub port_discovery_command: Option<HelperCommand>,
    /// Override the cleanup command run at shutdown.
    pub cleanup_command: Option<HelperCommand>,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_millis(500),
            helper_timeout: Duration::from_secs(10),
            termination_grace: Duration::from_secs(3),
            audio_frame_size: 4096,
            max_buckets: 64,
            log_option: LogOption::File,
            runtime_command: None,
            port_discovery_command: None,
            cleanup_command: None,
        }
    }
}

impl ApiOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(path, &toml::to_string_pretty(self)?)
    }
}

fn save_toml(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
