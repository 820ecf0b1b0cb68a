//! Outbound half of the message channel.
//!
//! Messages to the runtime are fire-and-forget UDP datagrams. A failed send
//! is reported to the caller but never affects the session: live-coding
//! control traffic tolerates occasional loss.

use crate::error::{ApiError, Result};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// UDP-based OSC sender targeting one local port.
#[derive(Clone)]
pub struct OscSender {
    sock: Arc<UdpSocket>,
    target: SocketAddr,
}

impl OscSender {
    /// Create a sender for `127.0.0.1:<port>`, bound to an ephemeral port.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_target(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    pub fn with_target(target: SocketAddr) -> Result<Self> {
        let sock = UdpSocket::bind("127.0.0.1:0")?;
        sock.set_nonblocking(true)?;
        Ok(Self {
            sock: Arc::new(sock),
            target,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send a prepared message.
    pub fn send(&self, msg: OscMessage) -> Result<()> {
        let addr = msg.addr.clone();
        let buf = encoder::encode(&OscPacket::Message(msg))?;
        self.send_raw(&buf).map_err(|e| {
            log::warn!("[OSC] Failed to send {} to {}: {}", addr, self.target, e);
            e
        })
    }

    /// Send a message with the given address and arguments.
    pub fn send_msg(&self, addr: &str, args: Vec<OscType>) -> Result<()> {
        self.send(msg(addr, args))
    }

    /// Send pre-encoded bytes.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        match self.sock.send_to(bytes, self.target) {
            Ok(_) => Ok(()),
            Err(e) => Err(ApiError::Transport(e.to_string())),
        }
    }
}

impl std::fmt::Debug for OscSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscSender")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Build an OSC message.
pub fn msg(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

/// Shorthand for a string argument.
pub fn s<S: Into<String>>(value: S) -> OscType {
    OscType::String(value.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sender_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = OscSender::new(port).unwrap();
        sender
            .send_msg("/stop-all-jobs", vec![s("guid")])
            .unwrap();

        let mut buf = [0u8; 1024];
        let (size, _) = receiver.recv_from(&mut buf).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
        match packet {
            OscPacket::Message(m) => {
                assert_eq!(m.addr, "/stop-all-jobs");
                assert_eq!(m.args, vec![OscType::String("guid".into())]);
            }
            OscPacket::Bundle(_) => panic!("Expected message packet"),
        }
    }

    #[test]
    fn test_msg_helper() {
        let m = msg("/ping", vec![s("a"), OscType::Int(42)]);
        assert_eq!(m.addr, "/ping");
        assert_eq!(m.args.len(), 2);
    }
}
