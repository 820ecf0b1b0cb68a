//! Filesystem locations used by a session.
//!
//! Everything hangs off two roots: the application root passed to
//! [`crate::SonicPiApi::init`] and the user's home directory, under which the
//! `.sonic-pi` user folder holds logs and configuration.

use crate::error::{ApiError, Result};
use directories::BaseDirs;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Named locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiPath {
    /// Application root.
    RootPath,
    /// Ruby interpreter used to run the server scripts.
    RubyPath,
    RubyServerPath,
    PortDiscoveryPath,
    FetchUrlPath,
    SamplePath,
    UserPath,
    ServerErrorLogPath,
    ServerOutputLogPath,
    ProcessLogPath,
    SCSynthLogPath,
    InitScriptPath,
    ExitScriptPath,
    GUILogPath,
    TaskRegisterPath,
}

/// Where helper and runtime output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOption {
    /// Append to the log files in the user log directory.
    #[default]
    File,
    /// Pass through to the console.
    Console,
}

/// Resolved locations for one session.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    paths: BTreeMap<ApiPath, PathBuf>,
    home_writable: bool,
}

impl Paths {
    /// Resolve all locations from the application root and the user's home
    /// directory.
    ///
    /// The root must exist. The user log directory is created if possible;
    /// when it cannot be, [`Paths::home_writable`] reports `false` and callers
    /// should log to the console instead.
    pub fn resolve(root: &Path, home: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| ApiError::Path {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !root.is_dir() {
            return Err(ApiError::Path {
                path: root,
                reason: "application root is not a directory".to_string(),
            });
        }

        let server_bin = root.join("app").join("server").join("ruby").join("bin");
        let user = home.join(".sonic-pi");
        let log = user.join("log");

        let mut paths = BTreeMap::new();
        paths.insert(ApiPath::RootPath, root.clone());
        paths.insert(ApiPath::RubyPath, find_ruby(&root));
        paths.insert(ApiPath::RubyServerPath, server_bin.join("sonic-pi-server.rb"));
        paths.insert(ApiPath::PortDiscoveryPath, server_bin.join("port-discovery.rb"));
        paths.insert(ApiPath::FetchUrlPath, server_bin.join("fetch-url.rb"));
        paths.insert(ApiPath::InitScriptPath, server_bin.join("init-script.rb"));
        paths.insert(ApiPath::ExitScriptPath, server_bin.join("exit-script.rb"));
        paths.insert(ApiPath::TaskRegisterPath, server_bin.join("task-register.rb"));
        paths.insert(ApiPath::SamplePath, root.join("etc").join("samples"));
        paths.insert(ApiPath::ServerErrorLogPath, log.join("server-errors.log"));
        paths.insert(ApiPath::ServerOutputLogPath, log.join("server-output.log"));
        paths.insert(ApiPath::ProcessLogPath, log.join("processes.log"));
        paths.insert(ApiPath::SCSynthLogPath, log.join("scsynth.log"));
        paths.insert(ApiPath::GUILogPath, log.join("gui.log"));
        paths.insert(ApiPath::UserPath, user);

        let home_writable = match fs::create_dir_all(&log) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[PATHS] Cannot create log directory {}: {}", log.display(), e);
                false
            }
        };

        Ok(Self { paths, home_writable })
    }

    /// Resolve using the current user's home directory.
    pub fn resolve_for_current_user(root: &Path) -> Result<Self> {
        Self::resolve(root, &home_dir()?)
    }

    pub fn get(&self, path: ApiPath) -> Option<&Path> {
        self.paths.get(&path).map(PathBuf::as_path)
    }

    /// Like [`Paths::get`], failing for unresolved paths.
    pub fn require(&self, path: ApiPath) -> Result<&Path> {
        self.get(path).ok_or_else(|| ApiError::Path {
            path: PathBuf::new(),
            reason: format!("{:?} has not been resolved", path),
        })
    }

    pub fn home_writable(&self) -> bool {
        self.home_writable
    }

    /// Default location of the settings file.
    pub fn config_file(&self) -> Option<PathBuf> {
        self.get(ApiPath::UserPath)
            .map(|user| user.join("config").join("api.toml"))
    }
}

/// The current user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| ApiError::Path {
            path: PathBuf::new(),
            reason: "could not determine home directory".to_string(),
        })
}

/// Prefer the bundled interpreter, fall back to `ruby` from PATH.
fn find_ruby(root: &Path) -> PathBuf {
    let exe = if cfg!(windows) { "ruby.exe" } else { "ruby" };
    let bundled = root
        .join("app")
        .join("server")
        .join("native")
        .join("ruby")
        .join("bin")
        .join(exe);
    if bundled.exists() {
        bundled
    } else {
        PathBuf::from(exe)
    }
}
