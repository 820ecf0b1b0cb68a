//! Inbound half of the message channel.
//!
//! A dedicated thread blocks on the GUI listen socket, decodes each datagram,
//! classifies it and dispatches the event to the host client synchronously.
//! Stopping sets a flag and sends a wake datagram to the socket so the
//! blocking receive returns; a read timeout backs that up.

use crate::client::{deliver, ApiClient};
use crate::dispatch::Classifier;
use crate::error::{ApiError, Result};
use crate::events::{ApiEvent, MessageInfo, MessageType, StatusType};
use crossbeam_channel::Sender;
use rosc::OscPacket;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_DATAGRAM: usize = 65536;

/// Background receiver bound to one local port.
pub struct OscListener {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OscListener {
    /// Bind `127.0.0.1:<port>` and start the listener thread.
    ///
    /// Every classified event goes to `client`. Readiness acknowledgements are
    /// additionally signalled on `ready_tx` when given.
    pub fn start(
        port: u16,
        client: Arc<dyn ApiClient>,
        ready_tx: Option<Sender<()>>,
    ) -> Result<Self> {
        let sock = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .map_err(|e| ApiError::Transport(format!("cannot bind listener port {}: {}", port, e)))?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = sock.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("osc-listener".to_string())
            .spawn(move || listen_loop(sock, thread_stop, client, ready_tx))?;

        log::info!("[OSC] Listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and join the listener thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(waker) = UdpSocket::bind("127.0.0.1:0") {
            let _ = waker.send_to(&[], self.local_addr);
        }
        if thread.join().is_err() {
            log::error!("[OSC] Listener thread panicked");
        }
        log::info!("[OSC] Listener on {} stopped", self.local_addr);
    }
}

impl Drop for OscListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    sock: UdpSocket,
    stop: Arc<AtomicBool>,
    client: Arc<dyn ApiClient>,
    ready_tx: Option<Sender<()>>,
) {
    let mut classifier = Classifier::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !stop.load(Ordering::SeqCst) {
        let size = match sock.recv_from(&mut buf) {
            Ok((size, _)) => size,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("[OSC] Receive failed: {}", e);
                report_internal(client.as_ref(), format!("receive failed: {}", e));
                continue;
            }
        };
        // Wake datagram or anything that raced the stop request.
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if size == 0 {
            continue;
        }

        let arrival = Instant::now();
        let packet = match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, packet)) => packet,
            Err(e) => {
                log::warn!("[OSC] Dropping undecodable datagram ({} bytes): {:?}", size, e);
                report_internal(client.as_ref(), format!("undecodable datagram: {:?}", e));
                continue;
            }
        };

        let mut messages = Vec::new();
        flatten(packet, &mut messages);
        dispatch_all(
            messages,
            arrival,
            &mut classifier,
            client.as_ref(),
            ready_tx.as_ref(),
            &stop,
        );
    }
}

/// Classify and deliver in order. Nothing is delivered once `stop` is set,
/// even in the middle of a bundle.
fn dispatch_all(
    messages: Vec<rosc::OscMessage>,
    arrival: Instant,
    classifier: &mut Classifier,
    client: &dyn ApiClient,
    ready_tx: Option<&Sender<()>>,
    stop: &AtomicBool,
) {
    for msg in messages {
        if stop.load(Ordering::SeqCst) {
            log::debug!("[OSC] Stop requested, discarding {}", msg.addr);
            return;
        }
        match classifier.classify(&msg, arrival) {
            Ok(Some(event)) => {
                if let (ApiEvent::Status(status), Some(tx)) = (&event, ready_tx) {
                    if status.kind == StatusType::Ack {
                        let _ = tx.try_send(());
                    }
                }
                log::trace!("[OSC] {} -> {}", msg.addr, event.kind_name());
                deliver(client, &event);
            }
            Ok(None) => log::debug!("[OSC] Unhandled address {}", msg.addr),
            Err(e) => {
                log::warn!("[OSC] {}", e);
                report_internal(client, e.to_string());
            }
        }
    }
}

/// Bundles are unpacked depth-first, preserving order.
fn flatten(packet: OscPacket, out: &mut Vec<rosc::OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out);
            }
        }
    }
}

fn report_internal(client: &dyn ApiClient, text: String) {
    client.report(&MessageInfo::new(MessageType::Internal, text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChannelClient;
    use crate::events::BufferType;
    use crate::osc::{msg, s, OscSender};
    use rosc::{OscBundle, OscTime, OscType};

    fn start_listener() -> (OscListener, crossbeam_channel::Receiver<ApiEvent>, OscSender) {
        let (client, rx) = ChannelClient::new();
        let listener = OscListener::start(0, Arc::new(client), None).unwrap();
        let sender = OscSender::new(listener.local_addr().port()).unwrap();
        (listener, rx, sender)
    }

    fn recv(rx: &crossbeam_channel::Receiver<ApiEvent>) -> ApiEvent {
        rx.recv_timeout(Duration::from_secs(2)).expect("event")
    }

    #[test]
    fn test_round_trip_buffer_fields() {
        let (mut listener, rx, sender) = start_listener();
        sender
            .send_msg(
                "/buffer/replace",
                vec![
                    s("workspace_zero"),
                    s("play 60"),
                    OscType::Int(1),
                    OscType::Int(4),
                    OscType::Int(12),
                ],
            )
            .unwrap();

        match recv(&rx) {
            ApiEvent::Buffer(info) => {
                assert_eq!(info.kind, BufferType::Replace);
                assert_eq!(info.id, "workspace_zero");
                assert_eq!(info.content, "play 60");
                assert_eq!((info.line, info.index, info.line_number), (1, 4, 12));
            }
            other => panic!("unexpected event {:?}", other),
        }
        listener.stop();
    }

    #[test]
    fn test_dispatch_order_matches_send_order() {
        let (mut listener, rx, sender) = start_listener();
        for i in 0..50 {
            sender
                .send_msg("/buffer/run-idx", vec![OscType::Int(i)])
                .unwrap();
        }
        for i in 0..50 {
            match recv(&rx) {
                ApiEvent::Buffer(info) => assert_eq!(info.buffer_index, i),
                other => panic!("unexpected event {:?}", other),
            }
        }
        listener.stop();
    }

    #[test]
    fn test_malformed_message_does_not_stop_listener() {
        let (mut listener, rx, sender) = start_listener();
        sender.send_raw(b"garbage").unwrap();
        sender.send_msg("/error", vec![s("oops")]).unwrap();
        sender.send_msg("/unknown/address", vec![]).unwrap();
        sender.send_msg("/info", vec![s("still alive")]).unwrap();

        let mut internal = 0;
        loop {
            match recv(&rx) {
                ApiEvent::Report(info) if info.kind == MessageType::Internal => internal += 1,
                ApiEvent::Report(info) => {
                    assert_eq!(info.kind, MessageType::InfoText);
                    assert_eq!(info.text, "still alive");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(internal, 2);
        assert!(listener.is_running());
        listener.stop();
    }

    #[test]
    fn test_bundles_are_flattened_in_order() {
        let (mut listener, rx, sender) = start_listener();
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: OscTime::from((1, 0)),
            content: vec![
                OscPacket::Message(msg("/midi/out-ports", vec![s("out")])),
                OscPacket::Message(msg("/midi/in-ports", vec![s("in")])),
            ],
        });
        sender
            .send_raw(&rosc::encoder::encode(&bundle).unwrap())
            .unwrap();
        assert!(matches!(recv(&rx), ApiEvent::Midi(m) if m.port_info == "out"));
        assert!(matches!(recv(&rx), ApiEvent::Midi(m) if m.port_info == "in"));
        listener.stop();
    }

    #[test]
    fn test_ack_signals_readiness() {
        let (client, _rx) = ChannelClient::new();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let mut listener = OscListener::start(0, Arc::new(client), Some(ready_tx)).unwrap();
        let sender = OscSender::new(listener.local_addr().port()).unwrap();
        sender.send_msg("/ack", vec![s("QtClient/1/hello")]).unwrap();
        assert!(ready_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        listener.stop();
    }

    #[test]
    fn test_stop_is_prompt_idempotent_and_silences_dispatch() {
        let (mut listener, rx, sender) = start_listener();
        let start = Instant::now();
        listener.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!listener.is_running());
        listener.stop();

        let _ = sender.send_msg("/info", vec![s("late")]);
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }

    /// Raises the shared stop flag as soon as it sees a MIDI event.
    struct StopOnMidi {
        stop: Arc<AtomicBool>,
        seen: std::sync::Mutex<Vec<String>>,
    }

    impl ApiClient for StopOnMidi {
        fn report(&self, _info: &MessageInfo) {}
        fn status(&self, _info: &crate::events::StatusInfo) {}
        fn cue(&self, _info: &crate::events::CueInfo) {}
        fn midi(&self, info: &crate::events::MidiInfo) {
            self.seen.lock().unwrap().push(info.port_info.clone());
            self.stop.store(true, Ordering::SeqCst);
        }
        fn version(&self, _info: &crate::events::VersionInfo) {}
        fn buffer(&self, _info: &crate::events::BufferInfo) {}
    }

    #[test]
    fn test_stop_mid_bundle_discards_remaining_messages() {
        let stop = Arc::new(AtomicBool::new(false));
        let client = StopOnMidi {
            stop: Arc::clone(&stop),
            seen: std::sync::Mutex::new(Vec::new()),
        };
        let messages = vec![
            msg("/midi/out-ports", vec![s("first")]),
            msg("/midi/in-ports", vec![s("second")]),
            msg("/midi/out-ports", vec![s("third")]),
        ];

        dispatch_all(
            messages,
            Instant::now(),
            &mut Classifier::new(),
            &client,
            None,
            &stop,
        );

        assert_eq!(*client.seen.lock().unwrap(), vec!["first".to_string()]);
    }
}
