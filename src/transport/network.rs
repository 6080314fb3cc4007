//! TCP transport with the debuggee's text handshake.
//!
//! The debuggee opens the connection and sends `CONNECT <version> DEBUGGER`
//! terminated by a blank line; the adapter answers with its protocol
//! version (plus the configured password, if any) and a newline. Everything
//! after the handshake terminator is binary frames.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::net::{TcpListener, TcpStream};

use crate::protocol::{Frame, PROTOCOL_VERSION};

use super::{drain_write, Drive, NetworkOptions, LISTENER, STREAM};

const READ_CHUNK: usize = 64 * 1024;

// A well-behaved debuggee sends ~20 bytes of handshake; anything much
// larger is not our protocol.
const MAX_HANDSHAKE: usize = 4096;

enum Phase {
    AwaitingClient,
    Handshake(Vec<u8>),
    Connected,
}

pub(crate) struct NetworkTransport {
    options: NetworkOptions,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    phase: Phase,
    write_buf: Vec<u8>,
}

impl NetworkTransport {
    pub(crate) fn new(options: NetworkOptions) -> Self {
        Self {
            options,
            listener: None,
            stream: None,
            local_addr: None,
            phase: Phase::AwaitingClient,
            write_buf: Vec::new(),
        }
    }

    pub(crate) fn listen(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.options.host, self.options.port)
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("{err}")))?;

        let mut listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        registry.register(&mut listener, LISTENER, mio::Interest::READABLE)?;
        self.local_addr = Some(bound);
        self.listener = Some(listener);

        log::debug!("listening on {bound}");
        Ok(())
    }

    pub(crate) fn communication_string(&self) -> String {
        let port = self
            .local_addr
            .map(|addr| addr.port())
            .unwrap_or(self.options.port);

        format!("NetworkClient;{}:{}", self.options.host, port)
    }

    pub(crate) fn send(&mut self, frame: &Frame) -> io::Result<()> {
        frame.encode(&mut self.write_buf);
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stream) = &mut self.stream {
            drain_write(&mut self.write_buf, stream)?;
        }

        Ok(())
    }

    pub(crate) fn handle_event(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<Drive> {
        match token {
            LISTENER => self.accept(registry),
            STREAM => {
                let mut drive = Drive::default();
                if writable {
                    self.flush()?;
                }
                if readable {
                    drive = self.read()?;
                }
                Ok(drive)
            }
            _ => Ok(Drive::default()),
        }
    }

    fn accept(&mut self, registry: &mio::Registry) -> io::Result<Drive> {
        let Some(listener) = &self.listener else {
            return Ok(Drive::default());
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) if self.stream.is_some() => {
                    // One debuggee per session. Closing the socket is the
                    // whole rejection.
                    log::warn!("rejecting second debugger connection from {peer}");
                    drop(stream);
                }
                Ok((mut stream, peer)) => {
                    log::debug!("debuggee connected from {peer}");
                    registry.register(
                        &mut stream,
                        STREAM,
                        mio::Interest::READABLE | mio::Interest::WRITABLE,
                    )?;
                    self.stream = Some(stream);
                    self.phase = Phase::Handshake(Vec::new());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(Drive::default())
    }

    fn read(&mut self) -> io::Result<Drive> {
        let mut drive = Drive::default();
        let Some(stream) = &mut self.stream else {
            return Ok(drive);
        };

        let mut incoming = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    drive.closed = true;
                    break;
                }
                Ok(n) => incoming.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        match std::mem::replace(&mut self.phase, Phase::AwaitingClient) {
            Phase::AwaitingClient => {}
            Phase::Connected => {
                drive.bytes = incoming;
                self.phase = Phase::Connected;
            }
            Phase::Handshake(mut buf) => {
                buf.extend_from_slice(&incoming);

                match split_handshake(&buf) {
                    Some((message, rest)) => {
                        let rest = rest.to_vec();
                        if let Some(version) = parse_connect(&message) {
                            log::debug!("debugger handshake, client version {version}");
                            if version != PROTOCOL_VERSION {
                                log::warn!(
                                    "debuggee speaks protocol version {version}, expected {PROTOCOL_VERSION}"
                                );
                            }

                            let response = match &self.options.password {
                                Some(password) => format!("{PROTOCOL_VERSION};{password}\n"),
                                None => format!("{PROTOCOL_VERSION}\n"),
                            };
                            self.write_buf.extend_from_slice(response.as_bytes());
                            self.phase = Phase::Connected;

                            drive.connected = true;
                            drive.bytes = rest;
                            self.flush()?;
                        } else {
                            log::warn!("malformed debugger handshake: {message:?}");
                            self.drop_client();
                        }
                    }
                    None if buf.len() > MAX_HANDSHAKE => {
                        log::warn!("handshake overflow, dropping client");
                        self.drop_client();
                    }
                    None => self.phase = Phase::Handshake(buf),
                }
            }
        }

        Ok(drive)
    }

    fn drop_client(&mut self) {
        self.stream = None;
        self.phase = Phase::AwaitingClient;
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
        }
        self.listener = None;
        self.phase = Phase::AwaitingClient;
        self.write_buf.clear();
    }
}

/// Splits an accumulated handshake buffer at the first blank-line
/// terminator, returning the message text and the residual bytes.
fn split_handshake(buf: &[u8]) -> Option<(String, &[u8])> {
    for (terminator, len) in [(&b"\r\n\r\n"[..], 4), (&b"\n\n"[..], 2)] {
        if let Some(pos) = buf.windows(len).position(|w| w == terminator) {
            let message = String::from_utf8_lossy(&buf[..pos]).into_owned();
            return Some((message, &buf[pos + len..]));
        }
    }

    None
}

/// Parses `CONNECT <version> DEBUGGER`, case-insensitively.
fn parse_connect(message: &str) -> Option<u32> {
    let mut words = message.split_whitespace();

    let connect = words.next()?;
    let version = words.next()?;
    let debugger = words.next()?;

    if !connect.eq_ignore_ascii_case("CONNECT")
        || !debugger.eq_ignore_ascii_case("DEBUGGER")
        || words.next().is_some()
    {
        return None;
    }

    version.parse().ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn connect_line() {
        assert_eq!(parse_connect("CONNECT 12 DEBUGGER"), Some(12));
        assert_eq!(parse_connect("connect 9 debugger"), Some(9));
        assert_eq!(parse_connect("CONNECT twelve DEBUGGER"), None);
        assert_eq!(parse_connect("CONNECT 12 DEBUGGER extra"), None);
        assert_eq!(parse_connect("DISCONNECT 12 DEBUGGER"), None);
    }

    #[test]
    fn handshake_split_keeps_residual_bytes() {
        let buf = b"CONNECT 12 DEBUGGER\n\n\x02\x00\x00\x00";
        let (message, rest) = split_handshake(buf).unwrap();

        assert_eq!(message, "CONNECT 12 DEBUGGER");
        assert_eq!(rest, &[0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn handshake_split_crlf() {
        let buf = b"CONNECT 12 DEBUGGER\r\n\r\n";
        let (message, rest) = split_handshake(buf).unwrap();

        assert_eq!(message, "CONNECT 12 DEBUGGER");
        assert!(rest.is_empty());
    }

    #[test]
    fn handshake_incomplete() {
        assert!(split_handshake(b"CONNECT 12 DEB").is_none());
    }
}
