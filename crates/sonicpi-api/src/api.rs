//! Session lifecycle.
//!
//! [`SonicPiApi`] sequences everything else: it resolves paths, discovers
//! ports, starts the runtime process and the message channel, waits for the
//! runtime to acknowledge, forwards requests while the session is live and
//! tears it all down again.
//!
//! ```text
//! Start --init--> Initializing --wait_for_server--> Created
//!                      |                  |
//!                      +----- failure ----+--> Invalid
//! ```
//!
//! `shutdown` from any state releases everything and returns to `Start`.
//! `init` is accepted from `Start` and `Invalid`.

use crate::audio::AudioPipeline;
use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use crate::events::{StatusInfo, StatusType};
use crate::listener::OscListener;
use crate::osc::{self, OscSender};
use crate::paths::{self, ApiPath, LogOption, Paths};
use crate::ports::{PortId, PortRegistry};
use crate::process::{HelperCommand, OutputSink, ProcessId, ProcessSupervisor};
use crate::settings::{ApiOptions, ApiSettings};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use rosc::{OscMessage, OscType};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT_HELLO: &str = "QtClient/1/hello";
const WORKSPACE_NAMES: [&str; 10] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Initializing,
    Created,
    Invalid,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Start => "start",
            SessionState::Initializing => "initializing",
            SessionState::Created => "created",
            SessionState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Audio settings requested by the host, applied whenever the pipeline is
/// (re)created.
#[derive(Debug, Clone, Copy)]
struct AudioRequest {
    enabled: bool,
    spectrum: bool,
    max_buckets: usize,
}

/// Control plane for one live-coding session.
///
/// All state (paths, ports, session id) belongs to this instance, so several
/// independent sessions can coexist in one process.
pub struct SonicPiApi {
    client: Arc<dyn ApiClient>,
    options: ApiOptions,
    settings: ApiSettings,
    home: Option<PathBuf>,
    guid: String,
    state: SessionState,
    paths: Paths,
    ports: PortRegistry,
    supervisor: ProcessSupervisor,
    server: Option<ProcessId>,
    sender: Option<OscSender>,
    listener: Option<OscListener>,
    ready_rx: Option<Receiver<()>>,
    report_exit: Arc<AtomicBool>,
    audio: Option<AudioPipeline>,
    audio_request: AudioRequest,
}

impl SonicPiApi {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self::with_options(client, ApiOptions::default())
    }

    pub fn with_options(client: Arc<dyn ApiClient>, options: ApiOptions) -> Self {
        let audio_request = AudioRequest {
            enabled: false,
            spectrum: false,
            max_buckets: options.max_buckets,
        };
        Self {
            client,
            options,
            settings: ApiSettings::default(),
            home: None,
            guid: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Start,
            paths: Paths::default(),
            ports: PortRegistry::default(),
            supervisor: ProcessSupervisor::new(),
            server: None,
            sender: None,
            listener: None,
            ready_rx: None,
            report_exit: Arc::new(AtomicBool::new(false)),
            audio: None,
            audio_request,
        }
    }

    /// Use `home` instead of the current user's home directory.
    pub fn with_home<P: Into<PathBuf>>(mut self, home: P) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Unique id of this control plane, sent with every request.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn options(&self) -> &ApiOptions {
        &self.options
    }

    /// Replace the options. Not allowed while a session is starting or live.
    pub fn set_options(&mut self, options: ApiOptions) -> Result<()> {
        self.require_not(&[SessionState::Initializing, SessionState::Created], "set_options")?;
        self.audio_request.max_buckets = options.max_buckets;
        self.options = options;
        Ok(())
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    /// Replace the preferences injected into subsequently run code.
    pub fn set_settings(&mut self, settings: ApiSettings) {
        self.settings = settings;
    }

    /// Persist the current preferences to the user config file.
    pub fn save_settings(&self) -> Result<()> {
        let path = self.paths.config_file().ok_or_else(|| ApiError::Path {
            path: PathBuf::new(),
            reason: "paths are not resolved".to_string(),
        })?;
        self.settings.save(&path)
    }

    pub fn path(&self, path: ApiPath) -> Option<&Path> {
        self.paths.get(path)
    }

    pub fn port(&self, port: PortId) -> Option<u16> {
        self.ports.port(port)
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn max_workspaces(&self) -> u32 {
        WORKSPACE_NAMES.len() as u32
    }

    /// Whether the runtime process is alive.
    pub fn is_server_running(&self) -> bool {
        self.server.is_some_and(|id| self.supervisor.is_running(id))
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server.and_then(|id| self.supervisor.pid(id))
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(OscListener::is_running)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a session rooted at `root`.
    ///
    /// Resolves paths, runs port discovery, starts the message channel and
    /// spawns the runtime. On failure everything started so far is torn down
    /// and the session is `Invalid`; `init` may then be retried.
    pub fn init(&mut self, root: &Path) -> Result<()> {
        self.require_not(&[SessionState::Initializing, SessionState::Created], "init")?;
        self.teardown(Duration::ZERO);

        log::info!("[API] Initializing session {} at {}", self.guid, root.display());
        self.state = SessionState::Initializing;
        match self.start_session(root) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("[API] Startup failed: {}", e);
                self.teardown(Duration::ZERO);
                self.state = SessionState::Invalid;
                Err(e)
            }
        }
    }

    fn start_session(&mut self, root: &Path) -> Result<()> {
        log::info!("1. Resolving paths...");
        let home = match &self.home {
            Some(home) => home.clone(),
            None => paths::home_dir()?,
        };
        self.paths = Paths::resolve(root, &home)?;
        self.load_settings();

        log::info!("2. Discovering ports...");
        self.ports = discover_ports(&self.supervisor, &self.paths, &self.options)?;

        // Listen before the runtime can possibly answer.
        log::info!("3. Starting message channel...");
        let (ready_tx, ready_rx) = bounded(1);
        self.listener = Some(OscListener::start(
            self.ports.require(PortId::GuiListenToServer)?,
            Arc::clone(&self.client),
            Some(ready_tx),
        )?);
        self.sender = Some(OscSender::new(self.ports.require(PortId::ServerListenToGui)?)?);
        self.ready_rx = Some(ready_rx);

        log::info!("4. Starting runtime...");
        let runtime = match &self.options.runtime_command {
            Some(cmd) => cmd.clone(),
            None => ruby_script(&self.paths, ApiPath::RubyServerPath)?,
        };
        let mut args = vec!["-u".to_string()];
        args.extend(self.ports.server_args());
        let (stdout, stderr) = self.output_sinks()?;
        let id = self
            .supervisor
            .spawn("runtime", &runtime, &args, stdout, stderr)?;
        self.server = Some(id);

        let client = Arc::clone(&self.client);
        let report_exit = Arc::clone(&self.report_exit);
        self.supervisor.watch(id, move |code| {
            if report_exit.load(Ordering::SeqCst) {
                log::error!("[API] Runtime exited unexpectedly (code {:?})", code);
                client.status(&StatusInfo {
                    kind: StatusType::Exited,
                    id: code.map(|c| c.to_string()).unwrap_or_default(),
                });
            }
        });
        Ok(())
    }

    /// Block until the runtime acknowledges startup or the readiness timeout
    /// elapses.
    pub fn wait_for_server(&mut self) -> Result<()> {
        self.require(SessionState::Initializing, "wait_for_server")?;
        match self.await_ack() {
            Ok(()) => {
                self.state = SessionState::Created;
                self.report_exit.store(true, Ordering::SeqCst);
                self.start_audio();
                log::info!("[API] Runtime ready, session {} created", self.guid);
                Ok(())
            }
            Err(e) => {
                log::error!("[API] Runtime not ready: {}", e);
                self.teardown(Duration::ZERO);
                self.state = SessionState::Invalid;
                Err(e)
            }
        }
    }

    fn await_ack(&self) -> Result<()> {
        let timeout = self.options.readiness_timeout;
        let deadline = Instant::now() + timeout;
        let (Some(sender), Some(ready_rx)) = (&self.sender, &self.ready_rx) else {
            return Err(ApiError::Transport("message channel not started".to_string()));
        };

        log::info!("[API] Waiting for runtime (up to {:?})...", timeout);
        let ping = osc::msg("/ping", vec![osc::s(self.guid.as_str()), osc::s(CLIENT_HELLO)]);
        loop {
            if let Err(e) = sender.send(ping.clone()) {
                log::debug!("[API] Ping failed: {}", e);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ApiError::ReadinessTimeout(timeout));
            }
            match ready_rx.recv_timeout(self.options.ping_interval.min(deadline - now)) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ApiError::Transport("listener stopped".to_string()))
                }
            }

            if let Some(id) = self.server {
                if !self.supervisor.is_running(id) {
                    return Err(ApiError::RuntimeExited(self.supervisor.exit_code(id)));
                }
            }
        }
    }

    /// End the session. Safe to call in any state and more than once.
    ///
    /// Asks the runtime to exit, stops the listener, terminates the runtime
    /// (forcibly after the grace window) and runs the cleanup helper. Failures
    /// are logged, never returned.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Start && self.server.is_none() && self.listener.is_none() {
            return;
        }
        log::info!("[API] Shutting down session {}", self.guid);
        self.report_exit.store(false, Ordering::SeqCst);

        if self.server.is_some() {
            if let Some(sender) = &self.sender {
                if let Err(e) = sender.send(osc::msg("/exit", vec![osc::s(self.guid.as_str())])) {
                    log::warn!("[API] Could not ask runtime to exit: {}", e);
                }
            }
        }
        self.teardown(self.options.termination_grace);
        self.run_cleanup();
        self.state = SessionState::Start;
        log::info!("[API] Shutdown complete");
    }

    /// Release every resource of the current attempt.
    fn teardown(&mut self, grace: Duration) {
        self.report_exit.store(false, Ordering::SeqCst);
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.sender = None;
        self.ready_rx = None;
        if let Some(id) = self.server.take() {
            match self.supervisor.terminate(id, grace) {
                Ok(true) => log::warn!("[API] Runtime had to be killed"),
                Ok(false) => {}
                Err(e) => log::error!("[API] Failed to terminate runtime: {}", e),
            }
        }
        self.supervisor.join_watchers();
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }
        self.ports = PortRegistry::default();
    }

    fn run_cleanup(&self) {
        let cleanup = match &self.options.cleanup_command {
            Some(cmd) => cmd.clone(),
            None => match ruby_script(&self.paths, ApiPath::ExitScriptPath) {
                Ok(cmd) => cmd,
                Err(e) => {
                    log::debug!("[API] No cleanup script: {}", e);
                    return;
                }
            },
        };
        match self
            .supervisor
            .run_and_wait(&cleanup, self.options.helper_timeout)
        {
            Ok(out) if out.success() => log::info!("[API] Cleanup complete"),
            Ok(out) => log::warn!(
                "[API] {}",
                ApiError::HelperFailed {
                    command: cleanup.to_string(),
                    code: out.code,
                }
            ),
            Err(e) => log::warn!("[API] Cleanup failed: {}", e),
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Run `code` as the contents of buffer `buffer_id`.
    pub fn run(&self, buffer_id: &str, code: &str) -> Result<()> {
        self.save_and_run_buffer(buffer_id, code)
    }

    /// Save buffer `name` with `code` and run it.
    pub fn save_and_run_buffer(&self, name: &str, code: &str) -> Result<()> {
        let code = self.settings.preprocess(code);
        self.send_request(
            "run",
            "/save-and-run-buffer",
            vec![osc::s(name), osc::s(code), osc::s(name)],
        )
    }

    /// Stop all running jobs.
    pub fn stop(&self) -> Result<()> {
        self.send_request("stop", "/stop-all-jobs", vec![])
    }

    /// Ask the runtime to insert a newline with indentation; the result
    /// arrives as a `Buffer(ReplaceLines)` event.
    pub fn buffer_new_line_and_indent(
        &self,
        point_line: i32,
        point_index: i32,
        first_line: i32,
        code: &str,
        file_name: &str,
        id: &str,
    ) -> Result<()> {
        self.send_request(
            "buffer_new_line_and_indent",
            "/buffer-newline-and-indent",
            vec![
                osc::s(id),
                osc::s(file_name),
                osc::s(code),
                OscType::Int(point_line),
                OscType::Int(point_index),
                OscType::Int(first_line),
            ],
        )
    }

    /// Request every workspace; contents arrive as `Buffer` events.
    pub fn load_workspaces(&self) -> Result<()> {
        for name in WORKSPACE_NAMES {
            self.send_request(
                "load_workspaces",
                "/load-buffer",
                vec![osc::s(format!("workspace_{}", name))],
            )?;
        }
        Ok(())
    }

    /// Save workspace contents by slot. Slots beyond
    /// [`SonicPiApi::max_workspaces`] are skipped.
    pub fn save_workspaces(&self, workspaces: &BTreeMap<u32, String>) -> Result<()> {
        for (slot, content) in workspaces {
            let Some(name) = WORKSPACE_NAMES.get(*slot as usize) else {
                log::warn!("[API] Ignoring workspace slot {}", slot);
                continue;
            };
            self.send_request(
                "save_workspaces",
                "/save-buffer",
                vec![osc::s(format!("workspace_{}", name)), osc::s(content.as_str())],
            )?;
        }
        Ok(())
    }

    /// Send a message to the runtime as is.
    pub fn send_osc(&self, msg: OscMessage) -> Result<()> {
        self.require(SessionState::Created, "send_osc")?;
        self.sender()?.send(msg)
    }

    /// Requests carry the session id as first argument.
    fn send_request(&self, operation: &'static str, addr: &str, args: Vec<OscType>) -> Result<()> {
        self.require(SessionState::Created, operation)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(osc::s(self.guid.as_str()));
        full.extend(args);
        self.sender()?.send_msg(addr, full)
    }

    fn sender(&self) -> Result<&OscSender> {
        self.sender
            .as_ref()
            .ok_or_else(|| ApiError::Transport("message channel not started".to_string()))
    }

    // ========================================================================
    // Audio
    // ========================================================================

    /// The audio pipeline, available while the session is `Created`.
    pub fn audio(&self) -> Option<&AudioPipeline> {
        self.audio.as_ref()
    }

    pub fn audio_processor_enable(&mut self, enable: bool) {
        self.audio_request.enabled = enable;
        if let Some(audio) = &self.audio {
            audio.enable(enable);
        }
    }

    pub fn audio_processor_enable_fft(&mut self, enable: bool) {
        self.audio_request.spectrum = enable;
        if let Some(audio) = &self.audio {
            audio.enable_spectrum(enable);
        }
    }

    pub fn audio_processor_set_max_fft_buckets(&mut self, buckets: usize) {
        self.audio_request.max_buckets = buckets;
        if let Some(audio) = &self.audio {
            audio.set_max_buckets(buckets);
        }
    }

    /// The host has finished with the last audio snapshot.
    pub fn audio_processor_consumed_audio(&self) {
        if let Some(audio) = &self.audio {
            audio.acknowledge_consumed();
        }
    }

    fn start_audio(&mut self) {
        let audio = AudioPipeline::new(
            self.options.audio_frame_size,
            self.audio_request.max_buckets,
            Some(Arc::clone(&self.client)),
        );
        audio.enable_spectrum(self.audio_request.spectrum);
        audio.enable(self.audio_request.enabled);
        self.audio = Some(audio);
    }

    // ========================================================================
    // Logs and helpers
    // ========================================================================

    /// Contents of the runtime's output and error logs, best effort.
    pub fn logs(&self) -> String {
        let mut out = String::new();
        for path in [
            ApiPath::ServerOutputLogPath,
            ApiPath::ServerErrorLogPath,
            ApiPath::ProcessLogPath,
        ] {
            let Some(file) = self.paths.get(path) else { continue };
            if let Ok(content) = fs::read_to_string(file) {
                if !content.is_empty() {
                    out.push_str(&format!("# {}\n", file.display()));
                    out.push_str(&content);
                    if !content.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    fn output_sinks(&self) -> Result<(OutputSink, OutputSink)> {
        let use_files =
            self.options.log_option == LogOption::File && self.paths.home_writable();
        if !use_files {
            return Ok((OutputSink::Inherit, OutputSink::Inherit));
        }
        Ok((
            OutputSink::File(self.paths.require(ApiPath::ServerOutputLogPath)?.to_path_buf()),
            OutputSink::File(self.paths.require(ApiPath::ServerErrorLogPath)?.to_path_buf()),
        ))
    }

    fn load_settings(&mut self) {
        let Some(path) = self.paths.config_file() else { return };
        if !path.exists() {
            return;
        }
        match ApiSettings::load(&path) {
            Ok(settings) => {
                log::info!("[API] Loaded settings from {}", path.display());
                self.settings = settings;
            }
            Err(e) => log::warn!("[API] Ignoring settings file {}: {}", path.display(), e),
        }
    }

    fn require(&self, state: SessionState, operation: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(ApiError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn require_not(&self, states: &[SessionState], operation: &'static str) -> Result<()> {
        if states.contains(&self.state) {
            Err(ApiError::InvalidState {
                operation,
                state: self.state,
            })
        } else {
            Ok(())
        }
    }
}

/// Run the port discovery helper and parse its output.
///
/// Uses the configured discovery command, or the runtime's own discovery
/// script under `paths`.
pub fn discover_ports(
    supervisor: &ProcessSupervisor,
    paths: &Paths,
    options: &ApiOptions,
) -> Result<PortRegistry> {
    let discovery = match &options.port_discovery_command {
        Some(cmd) => cmd.clone(),
        None => ruby_script(paths, ApiPath::PortDiscoveryPath)?,
    };
    let output = supervisor.run_and_wait(&discovery, options.helper_timeout)?;
    if !output.success() {
        return Err(ApiError::PortResolution(format!(
            "discovery helper exited with code {:?}",
            output.code
        )));
    }
    PortRegistry::resolve(&output.stdout)
}

/// Default commands run the bundled scripts from the application root.
fn ruby_script(paths: &Paths, script: ApiPath) -> Result<HelperCommand> {
    let ruby = paths.require(ApiPath::RubyPath)?;
    let script = paths.require(script)?;
    Ok(HelperCommand::new(ruby)
        .arg("--enable-frozen-string-literal")
        .arg("-E")
        .arg("utf-8")
        .arg(script.display().to_string())
        .current_dir(paths.require(ApiPath::RootPath)?))
}

impl Drop for SonicPiApi {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::client::ChannelClient;
    use crate::events::{ApiEvent, MessageType};
    use rosc::OscPacket;
    use std::net::UdpSocket;
    use std::thread;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sh(script: &str) -> HelperCommand {
        HelperCommand::new("sh").arg("-c").arg(script)
    }

    fn discovery(gui_listen: u16, server_listen: u16) -> HelperCommand {
        sh(&format!(
            "printf 'gui-listen-to-server: {}\\ngui-send-to-server: {}\\nserver-listen-to-gui: {}\\n\
             server-send-to-gui: {}\\nscsynth: {}\\n'",
            gui_listen,
            free_port(),
            server_listen,
            free_port(),
            free_port()
        ))
    }

    struct Fixture {
        root: tempfile::TempDir,
        _home: tempfile::TempDir,
        api: SonicPiApi,
        events: crossbeam_channel::Receiver<ApiEvent>,
    }

    fn fixture(options: ApiOptions) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let (client, events) = ChannelClient::new();
        let api = SonicPiApi::with_options(Arc::new(client), options).with_home(home.path());
        Fixture {
            root,
            _home: home,
            api,
            events,
        }
    }

    fn options(gui_listen: u16, server_listen: u16, runtime: HelperCommand) -> ApiOptions {
        ApiOptions {
            readiness_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_millis(50),
            helper_timeout: Duration::from_secs(5),
            termination_grace: Duration::from_millis(200),
            port_discovery_command: Some(discovery(gui_listen, server_listen)),
            runtime_command: Some(runtime),
            cleanup_command: Some(sh("exit 0")),
            ..ApiOptions::default()
        }
    }

    /// Stands in for the runtime's message handling: acks pings and forwards
    /// every other message to the test.
    fn stub_runtime(
        sock: UdpSocket,
        gui_listen: u16,
        ack: bool,
    ) -> (thread::JoinHandle<()>, crossbeam_channel::Receiver<OscMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        sock.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let handle = thread::spawn(move || {
            let reply = OscSender::new(gui_listen).unwrap();
            let mut buf = [0u8; 65536];
            let deadline = Instant::now() + Duration::from_secs(20);
            while Instant::now() < deadline {
                let Ok((size, _)) = sock.recv_from(&mut buf) else { continue };
                let Ok((_, OscPacket::Message(m))) = rosc::decoder::decode_udp(&buf[..size]) else {
                    continue;
                };
                if m.addr == "/ping" {
                    if ack {
                        let _ = reply.send_msg("/ack", vec![osc::s(CLIENT_HELLO)]);
                    }
                    continue;
                }
                let exit = m.addr == "/exit";
                let _ = tx.send(m);
                if exit {
                    break;
                }
            }
        });
        (handle, rx)
    }

    #[test]
    fn test_end_to_end_session() {
        let runtime_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = runtime_sock.local_addr().unwrap().port();
        let gui_listen = free_port();
        let (stub, outbound) = stub_runtime(runtime_sock, gui_listen, true);

        let mut f = fixture(options(gui_listen, server_listen, sh("exec sleep 30")));
        f.api.init(f.root.path()).unwrap();
        assert_eq!(f.api.state(), SessionState::Initializing);
        assert_eq!(f.api.port(PortId::GuiListenToServer), Some(gui_listen));
        assert!(f.api.is_server_running());

        f.api.wait_for_server().unwrap();
        assert_eq!(f.api.state(), SessionState::Created);
        assert!(f.api.audio().is_some());

        f.api.run("a", "play 60").unwrap();
        let run = outbound.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(run.addr, "/save-and-run-buffer");
        assert_eq!(run.args[0], osc::s(f.api.guid()));
        assert_eq!(run.args[1], osc::s("a"));
        match &run.args[2] {
            OscType::String(code) => assert!(code.ends_with("\nplay 60")),
            other => panic!("unexpected code argument {:?}", other),
        }

        let cue = OscSender::new(gui_listen).unwrap();
        for _ in 0..2 {
            cue.send_msg(
                "/incoming/osc",
                vec![osc::s("0.5"), OscType::Int(42), osc::s("/cue/beat"), osc::s("[]")],
            )
            .unwrap();
        }
        let mut indices = Vec::new();
        while indices.len() < 2 {
            match f.events.recv_timeout(Duration::from_secs(5)).unwrap() {
                ApiEvent::Cue(info) => {
                    assert_eq!(info.id, 42);
                    indices.push(info.index);
                }
                _ => continue,
            }
        }
        assert!(indices[1] > indices[0]);

        f.api.shutdown();
        assert_eq!(f.api.state(), SessionState::Start);
        assert!(!f.api.is_listening());
        assert!(!f.api.is_server_running());
        assert!(f.api.server_pid().is_none());

        let exit = outbound.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exit.addr, "/exit");
        stub.join().unwrap();

        // The listen port is free again.
        UdpSocket::bind(("127.0.0.1", gui_listen)).unwrap();
    }

    #[test]
    fn test_readiness_timeout_is_bounded_and_retryable() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = silent.local_addr().unwrap().port();
        let gui_listen = free_port();

        let mut opts = options(gui_listen, server_listen, sh("exec sleep 30"));
        opts.readiness_timeout = Duration::from_millis(300);
        let mut f = fixture(opts);
        f.api.init(f.root.path()).unwrap();

        let start = Instant::now();
        let err = f.api.wait_for_server().unwrap_err();
        assert!(matches!(err, ApiError::ReadinessTimeout(_)));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(f.api.state(), SessionState::Invalid);
        assert!(!f.api.is_server_running());
        assert!(!f.api.is_listening());

        f.api.shutdown();
        f.api.shutdown();
        assert_eq!(f.api.state(), SessionState::Start);

        // Retry after the failure.
        f.api.init(f.root.path()).unwrap();
        assert_eq!(f.api.state(), SessionState::Initializing);
        f.api.shutdown();
    }

    #[test]
    fn test_incomplete_ports_leave_session_invalid() {
        let mut opts = options(free_port(), free_port(), sh("exec sleep 30"));
        opts.port_discovery_command = Some(sh("echo 'gui-listen-to-server: 4000'"));
        let mut f = fixture(opts);

        let err = f.api.init(f.root.path()).unwrap_err();
        assert!(matches!(err, ApiError::PortResolution(_)));
        assert_eq!(f.api.state(), SessionState::Invalid);
        assert!(f.api.ports().is_empty());
        assert!(f.api.server_pid().is_none());
        assert!(matches!(
            f.api.run("a", "play 60"),
            Err(ApiError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failing_discovery_helper() {
        let mut opts = options(free_port(), free_port(), sh("exec sleep 30"));
        opts.port_discovery_command = Some(sh("exit 1"));
        let mut f = fixture(opts);
        assert!(matches!(
            f.api.init(f.root.path()),
            Err(ApiError::PortResolution(_))
        ));
    }

    #[test]
    fn test_spawn_failure_releases_ports() {
        let gui_listen = free_port();
        let opts = options(gui_listen, free_port(), HelperCommand::new("/no/such/runtime"));
        let mut f = fixture(opts);

        let err = f.api.init(f.root.path()).unwrap_err();
        assert!(matches!(err, ApiError::Spawn { .. }));
        assert_eq!(f.api.state(), SessionState::Invalid);
        assert!(!f.api.is_listening());
        UdpSocket::bind(("127.0.0.1", gui_listen)).unwrap();
    }

    #[test]
    fn test_runtime_dying_during_startup() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = silent.local_addr().unwrap().port();
        let mut f = fixture(options(free_port(), server_listen, sh("exit 4")));
        f.api.init(f.root.path()).unwrap();
        let err = f.api.wait_for_server().unwrap_err();
        assert!(matches!(err, ApiError::RuntimeExited(Some(4))));
        assert_eq!(f.api.state(), SessionState::Invalid);
    }

    #[test]
    fn test_unexpected_exit_reported_as_status() {
        let runtime_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = runtime_sock.local_addr().unwrap().port();
        let gui_listen = free_port();
        let (_stub, _outbound) = stub_runtime(runtime_sock, gui_listen, true);

        let mut f = fixture(options(gui_listen, server_listen, sh("sleep 1")));
        f.api.init(f.root.path()).unwrap();
        f.api.wait_for_server().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = false;
        while Instant::now() < deadline && !exited {
            if let Ok(ApiEvent::Status(status)) =
                f.events.recv_timeout(Duration::from_millis(100))
            {
                exited = status.kind == StatusType::Exited;
            }
        }
        assert!(exited);
        // Still Created: the host decides what to do.
        assert_eq!(f.api.state(), SessionState::Created);
        f.api.shutdown();
    }

    #[test]
    fn test_default_commands_run_from_root() {
        let root = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let paths = Paths::resolve(root.path(), home.path()).unwrap();
        let cmd = ruby_script(&paths, ApiPath::RubyServerPath).unwrap();
        assert_eq!(cmd.args[..3], ["--enable-frozen-string-literal", "-E", "utf-8"]);
        assert!(cmd.args[3].ends_with("sonic-pi-server.rb"));
        assert_eq!(
            cmd.current_dir.as_deref(),
            paths.get(ApiPath::RootPath)
        );
    }

    #[test]
    fn test_requests_require_created_state() {
        let f = fixture(ApiOptions::default());
        assert!(matches!(f.api.stop(), Err(ApiError::InvalidState { .. })));
        assert!(matches!(
            f.api.send_osc(osc::msg("/ping", vec![])),
            Err(ApiError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        let mut f = fixture(ApiOptions::default());
        f.api.shutdown();
        f.api.shutdown();
        assert_eq!(f.api.state(), SessionState::Start);
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_workspaces_and_editor_requests() {
        let runtime_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = runtime_sock.local_addr().unwrap().port();
        let gui_listen = free_port();
        let (_stub, outbound) = stub_runtime(runtime_sock, gui_listen, true);

        let mut f = fixture(options(gui_listen, server_listen, sh("exec sleep 30")));
        f.api.init(f.root.path()).unwrap();
        f.api.wait_for_server().unwrap();

        let mut workspaces = BTreeMap::new();
        workspaces.insert(2, "play 64".to_string());
        workspaces.insert(99, "ignored".to_string());
        f.api.save_workspaces(&workspaces).unwrap();
        let save = outbound.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(save.addr, "/save-buffer");
        assert_eq!(save.args[1], osc::s("workspace_two"));
        assert_eq!(save.args[2], osc::s("play 64"));

        f.api
            .buffer_new_line_and_indent(3, 7, 0, "live_loop :a do", "workspace_zero", "ed-1")
            .unwrap();
        let indent = outbound.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(indent.addr, "/buffer-newline-and-indent");
        assert_eq!(indent.args[1], osc::s("ed-1"));
        assert_eq!(indent.args[4], OscType::Int(3));
        assert_eq!(indent.args[6], OscType::Int(0));

        f.api.load_workspaces().unwrap();
        for name in WORKSPACE_NAMES {
            let load = outbound.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(load.addr, "/load-buffer");
            assert_eq!(load.args[1], osc::s(format!("workspace_{}", name)));
        }

        f.api.stop().unwrap();
        assert_eq!(
            outbound.recv_timeout(Duration::from_secs(5)).unwrap().addr,
            "/stop-all-jobs"
        );
        f.api.shutdown();
    }

    #[test]
    fn test_decode_errors_reach_host_without_ending_session() {
        let runtime_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = runtime_sock.local_addr().unwrap().port();
        let gui_listen = free_port();
        let (_stub, _outbound) = stub_runtime(runtime_sock, gui_listen, true);

        let mut f = fixture(options(gui_listen, server_listen, sh("exec sleep 30")));
        f.api.init(f.root.path()).unwrap();
        f.api.wait_for_server().unwrap();

        let runtime = OscSender::new(gui_listen).unwrap();
        runtime.send_msg("/error", vec![osc::s("bad")]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_internal = false;
        while Instant::now() < deadline && !saw_internal {
            if let Ok(ApiEvent::Report(info)) = f.events.recv_timeout(Duration::from_millis(100)) {
                saw_internal = info.kind == MessageType::Internal;
            }
        }
        assert!(saw_internal);
        assert_eq!(f.api.state(), SessionState::Created);
        assert!(f.api.is_listening());
        f.api.shutdown();
    }

    #[test]
    fn test_audio_settings_survive_until_created() {
        let runtime_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_listen = runtime_sock.local_addr().unwrap().port();
        let gui_listen = free_port();
        let (_stub, _outbound) = stub_runtime(runtime_sock, gui_listen, true);

        let mut opts = options(gui_listen, server_listen, sh("exec sleep 30"));
        opts.audio_frame_size = 64;
        let mut f = fixture(opts);
        f.api.audio_processor_enable(true);
        f.api.audio_processor_enable_fft(true);
        f.api.audio_processor_set_max_fft_buckets(5);
        f.api.init(f.root.path()).unwrap();
        f.api.wait_for_server().unwrap();

        let audio = f.api.audio().unwrap();
        assert!(audio.is_enabled());
        audio.feed(&[0.5; 128]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut notified = false;
        while Instant::now() < deadline && !notified {
            notified = matches!(
                f.events.recv_timeout(Duration::from_millis(100)),
                Ok(ApiEvent::AudioDataAvailable)
            );
        }
        assert!(notified);
        let snapshot = audio.latest().unwrap();
        assert!(snapshot.spectrum_quantized[0].len() <= 5);
        drop(snapshot);
        f.api.audio_processor_consumed_audio();
        assert!(f.api.audio().unwrap().latest().is_none());
        f.api.shutdown();
        assert!(f.api.audio().is_none());
    }

    #[test]
    fn test_saved_settings_are_loaded_by_next_init() {
        let mut opts = options(free_port(), free_port(), sh("exec sleep 30"));
        opts.port_discovery_command = Some(sh("exit 1"));
        let mut f = fixture(opts);

        // No user folder before the first init.
        assert!(matches!(f.api.save_settings(), Err(ApiError::Path { .. })));

        assert!(f.api.init(f.root.path()).is_err());
        let saved = ApiSettings {
            log_cues: true,
            timing_guarantees: true,
            default_midi_channel: 3,
            ..ApiSettings::default()
        };
        f.api.set_settings(saved.clone());
        f.api.save_settings().unwrap();

        let file = f.api.path(ApiPath::UserPath).unwrap().join("config").join("api.toml");
        assert_eq!(ApiSettings::load(&file).unwrap(), saved);

        f.api.set_settings(ApiSettings::default());
        assert!(f.api.init(f.root.path()).is_err());
        assert_eq!(f.api.settings(), &saved);
    }
}
