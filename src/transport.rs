//! Transports for the debugger channel.
//!
//! The adapter listens and the debuggee connects, over one of three
//! transports: named pipes on Windows, named FIFOs on POSIX, or TCP. All
//! variants speak the same frame stream; the differences are confined to
//! connection establishment and I/O readiness. The transport owns its
//! descriptors, its [mio::Poll] instance and the accumulation buffer;
//! callers drive it by calling [Transport::poll_events] in a loop.

#[cfg(unix)]
pub mod fifo;
pub mod network;
#[cfg(windows)]
pub mod pipe;

use std::{
    io::{self, Write},
    time::Duration,
};

use rand::Rng as _;

use crate::protocol::{pending_frame_size, Frame};

/// Token reserved for the session waker.
pub(crate) const WAKER: mio::Token = mio::Token(0);
/// Token for the listening endpoint (TCP listener or pipe servers).
pub(crate) const LISTENER: mio::Token = mio::Token(1);
/// Token for the connected byte stream.
pub(crate) const STREAM: mio::Token = mio::Token(2);
/// Token for the debuggee-to-adapter pipe, where the transport has one
/// descriptor per direction.
#[cfg(windows)]
pub(crate) const PIPE_READ: mio::Token = mio::Token(3);
/// Token for the adapter-to-debuggee pipe.
#[cfg(windows)]
pub(crate) const PIPE_WRITE: mio::Token = mio::Token(4);

/// Drain interval for transports without readiness events (FIFOs).
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Something that happened on the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The debuggee attached; frames flow from here on.
    Connected,
    /// A complete frame arrived.
    Frame(Frame),
    /// The peer went away. Terminal.
    Closed,
}

/// What the debuggee connects with. Selected from the launch arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// POSIX named FIFOs, the default on unix.
    Fifo,
    /// Windows named pipes, the default there.
    NamedPipes,
    /// TCP, for remote debuggees or tests.
    Network,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(windows) {
            TransportKind::NamedPipes
        } else {
            TransportKind::Fifo
        }
    }
}

/// Connection parameters for the network transport.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Address to bind.
    pub host: String,
    /// Port to bind; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Optional password appended to the handshake response.
    pub password: Option<String>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            password: None,
        }
    }
}

/// Outcome of driving a transport variant, bubbled up to the event loop.
#[derive(Debug, Default)]
pub(crate) struct Drive {
    pub(crate) connected: bool,
    pub(crate) closed: bool,
    pub(crate) bytes: Vec<u8>,
}

enum Inner {
    Network(network::NetworkTransport),
    #[cfg(unix)]
    Fifo(fifo::FifoTransport),
    #[cfg(windows)]
    Pipe(pipe::PipeTransport),
}

/// A listening or connected debugger channel.
pub struct Transport {
    poll: mio::Poll,
    events: mio::Events,
    inner: Inner,
    accumulator: FrameAccumulator,
    connected: bool,
    pending_close: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("communication", &self.communication_string())
            .field("connected", &self.connected)
            .finish()
    }
}

impl Transport {
    /// Creates a TCP transport.
    pub fn network(options: NetworkOptions) -> io::Result<Self> {
        Self::with_inner(Inner::Network(network::NetworkTransport::new(options)))
    }

    /// Creates a FIFO transport. The debugger options string is written
    /// into the connection-descriptor file during [listen](Self::listen).
    #[cfg(unix)]
    pub fn fifo(debugger_options: String) -> io::Result<Self> {
        Self::with_inner(Inner::Fifo(fifo::FifoTransport::new(debugger_options)))
    }

    /// Creates a named-pipe transport.
    #[cfg(windows)]
    pub fn named_pipes() -> io::Result<Self> {
        Self::with_inner(Inner::Pipe(pipe::PipeTransport::new()))
    }

    fn with_inner(inner: Inner) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(64),
            inner,
            accumulator: FrameAccumulator::default(),
            connected: false,
            pending_close: false,
        })
    }

    /// Creates a waker that interrupts a blocked [poll_events](Self::poll_events).
    pub fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), WAKER)
    }

    /// Starts listening for the debuggee.
    pub fn listen(&mut self) -> io::Result<()> {
        let registry = self.poll.registry();
        match &mut self.inner {
            Inner::Network(t) => t.listen(registry),
            #[cfg(unix)]
            Inner::Fifo(t) => t.listen(),
            #[cfg(windows)]
            Inner::Pipe(t) => t.listen(registry),
        }
    }

    /// Opens the adapter-side descriptors for transports where the adapter
    /// attaches after launching the debuggee (FIFOs). A no-op elsewhere.
    /// Returns true when this call freshly connected the channel.
    pub fn connect(&mut self) -> io::Result<bool> {
        match &mut self.inner {
            #[cfg(unix)]
            Inner::Fifo(t) => {
                let drive = t.connect()?;
                Ok(self.absorb(drive))
            }
            _ => Ok(false),
        }
    }

    /// The string the debuggee uses to find this channel, injected into its
    /// environment at launch.
    pub fn communication_string(&self) -> String {
        match &self.inner {
            Inner::Network(t) => t.communication_string(),
            #[cfg(unix)]
            Inner::Fifo(t) => t.communication_string(),
            #[cfg(windows)]
            Inner::Pipe(t) => t.communication_string(),
        }
    }

    /// True once the debuggee has attached.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True for transports that need periodic drain ticks instead of
    /// readiness events.
    pub fn needs_tick(&self) -> bool {
        match &self.inner {
            #[cfg(unix)]
            Inner::Fifo(_) => true,
            _ => false,
        }
    }

    /// Queues a frame for delivery and flushes as much as the channel
    /// accepts without blocking.
    pub fn send(&mut self, frame: &Frame) -> io::Result<()> {
        log::trace!(
            "sending frame cmd={} size={}",
            frame.command,
            frame.data_size()
        );

        match &mut self.inner {
            Inner::Network(t) => t.send(frame),
            #[cfg(unix)]
            Inner::Fifo(t) => t.send(frame),
            #[cfg(windows)]
            Inner::Pipe(t) => t.send(frame),
        }
    }

    /// Waits for channel activity and returns the resulting events.
    ///
    /// The timeout is capped at [POLL_INTERVAL] for transports that drain
    /// on ticks. A waker interrupt returns an empty event list.
    pub fn poll_events(&mut self, timeout: Option<Duration>) -> io::Result<Vec<TransportEvent>> {
        let timeout = if self.needs_tick() {
            Some(timeout.map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL)))
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        // Copy out the readiness facts so the borrow on self.events ends
        // before driving the variant.
        let ready: Vec<(mio::Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();

        let mut out = Vec::new();
        for (token, readable, writable) in ready {
            if token == WAKER {
                continue;
            }

            let drive = match &mut self.inner {
                Inner::Network(t) => t.handle_event(self.poll.registry(), token, readable, writable)?,
                #[cfg(unix)]
                Inner::Fifo(_) => Drive::default(),
                #[cfg(windows)]
                Inner::Pipe(t) => t.handle_event(token, readable, writable)?,
            };
            self.collect(drive, &mut out);
        }

        // Tick-driven transports drain on every wakeup, evented or not.
        #[cfg(unix)]
        {
            let drive = match &mut self.inner {
                Inner::Fifo(t) => Some(t.tick()?),
                _ => None,
            };
            if let Some(drive) = drive {
                self.collect(drive, &mut out);
            }
        }

        Ok(out)
    }

    fn collect(&mut self, drive: Drive, out: &mut Vec<TransportEvent>) {
        if self.absorb(drive) {
            out.push(TransportEvent::Connected);
        }

        for frame in self.accumulator.drain_frames() {
            out.push(TransportEvent::Frame(frame));
        }

        if self.take_closed() {
            out.push(TransportEvent::Closed);
        }
    }

    // Returns true when this drive freshly connected the channel.
    fn absorb(&mut self, drive: Drive) -> bool {
        self.accumulator.push(&drive.bytes);

        if drive.closed {
            self.pending_close = true;
        }

        if drive.connected && !self.connected {
            self.connected = true;
            return true;
        }

        false
    }

    fn take_closed(&mut self) -> bool {
        std::mem::take(&mut self.pending_close)
    }

    /// Closes the channel and removes any filesystem artifacts.
    pub fn close(&mut self) {
        match &mut self.inner {
            Inner::Network(t) => t.close(),
            #[cfg(unix)]
            Inner::Fifo(t) => t.close(),
            #[cfg(windows)]
            Inner::Pipe(t) => t.close(),
        }
        self.connected = false;
    }
}

/// Accumulates raw bytes into complete frames.
///
/// The buffer is rolling: bytes append at the tail, and as many complete
/// frames as possible are split off the head. Feeding a byte stream in any
/// chunking yields the same frame sequence.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
}

impl FrameAccumulator {
    /// Appends raw bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Splits off every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();

        loop {
            let Some(size) = pending_frame_size(&self.buf) else {
                if !self.buf.is_empty() {
                    log::trace!("short read ({} header bytes)", self.buf.len());
                }
                break;
            };

            if self.buf.len() < size {
                log::trace!("partial frame ({}/{} bytes)", self.buf.len(), size);
                break;
            }

            frames.push(Frame::parse(&self.buf[..size]));
            self.buf.drain(..size);
        }

        frames
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Generates the 8-hex-digit channel token, from a cryptographic RNG.
pub(crate) fn random_token() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

/// Writes as much of `buf` as the descriptor accepts without blocking,
/// draining written bytes from the front. Returns false if the writer can
/// accept no more for now.
pub(crate) fn drain_write(buf: &mut Vec<u8>, w: &mut impl Write) -> io::Result<bool> {
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                buf.drain(..n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(true)
}
