//! Windows named-pipe transport.
//!
//! Two pipe servers are created, one per direction, under names the
//! debuggee derives from its communication string. The channel counts as
//! connected only once the debuggee has attached to both.

use std::io::{self, Read, Write};

use mio::windows::NamedPipe;

use crate::protocol::Frame;

use super::{drain_write, random_token, Drive, PIPE_READ, PIPE_WRITE};

const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct PipeTransport {
    /// Debuggee-to-adapter pipe; the adapter reads here.
    name_a: String,
    /// Adapter-to-debuggee pipe; the adapter writes here.
    name_b: String,
    read_pipe: Option<NamedPipe>,
    write_pipe: Option<NamedPipe>,
    read_connected: bool,
    write_connected: bool,
    announced: bool,
    write_buf: Vec<u8>,
}

impl PipeTransport {
    pub(crate) fn new() -> Self {
        let token = random_token();

        Self {
            name_a: format!(r"\\.\pipe\PureBasic_DebuggerPipeA_{token}"),
            name_b: format!(r"\\.\pipe\PureBasic_DebuggerPipeB_{token}"),
            read_pipe: None,
            write_pipe: None,
            read_connected: false,
            write_connected: false,
            announced: false,
            write_buf: Vec::new(),
        }
    }

    pub(crate) fn listen(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let mut read_pipe = NamedPipe::new(&self.name_a)?;
        let mut write_pipe = NamedPipe::new(&self.name_b)?;

        registry.register(
            &mut read_pipe,
            PIPE_READ,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )?;
        registry.register(
            &mut write_pipe,
            PIPE_WRITE,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )?;

        // Both servers accept concurrently; completion is signalled through
        // readiness events.
        for pipe in [&read_pipe, &write_pipe] {
            match pipe.connect() {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        self.read_pipe = Some(read_pipe);
        self.write_pipe = Some(write_pipe);

        log::debug!("listening on {} / {}", self.name_a, self.name_b);
        Ok(())
    }

    pub(crate) fn communication_string(&self) -> String {
        format!("NamedPipes;{};{}", self.name_a, self.name_b)
    }

    pub(crate) fn send(&mut self, frame: &Frame) -> io::Result<()> {
        frame.encode(&mut self.write_buf);
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.write_connected {
            return Ok(());
        }

        if let Some(pipe) = &mut self.write_pipe {
            drain_write(&mut self.write_buf, pipe)?;
        }

        Ok(())
    }

    pub(crate) fn handle_event(
        &mut self,
        token: mio::Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<Drive> {
        let mut drive = Drive::default();

        match token {
            PIPE_READ => {
                self.read_connected = true;
                if readable {
                    drive = self.read()?;
                }
            }
            PIPE_WRITE => {
                self.write_connected = true;
                if writable {
                    self.flush()?;
                }
            }
            _ => return Ok(drive),
        }

        if self.read_connected && self.write_connected && !self.announced {
            self.announced = true;
            drive.connected = true;
        }

        Ok(drive)
    }

    fn read(&mut self) -> io::Result<Drive> {
        let mut drive = Drive::default();
        let Some(pipe) = &mut self.read_pipe else {
            return Ok(drive);
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => {
                    drive.closed = true;
                    break;
                }
                Ok(n) => drive.bytes.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    drive.closed = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(drive)
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut pipe) = self.write_pipe.take() {
            let _ = pipe.flush();
            let _ = pipe.disconnect();
        }
        if let Some(pipe) = self.read_pipe.take() {
            let _ = pipe.disconnect();
        }

        self.read_connected = false;
        self.write_connected = false;
        self.write_buf.clear();
    }
}
