//! POSIX named-FIFO transport.
//!
//! Two FIFOs are created in the temp directory, one per direction, and a
//! connection-descriptor file at a well-known path tells launching
//! debuggees where to attach. FIFOs have no readiness events to register,
//! so the transport drains on fixed ticks with non-blocking reads.
//!
//! The read side must stay open across empty polls: `EAGAIN` means "no data
//! yet", and tearing down the descriptor instead would raise `SIGPIPE` in
//! the debuggee the next time it writes. The write side cannot be opened
//! non-blocking until the debuggee has opened its read end (`ENXIO`), so
//! opening is retried on every tick and outgoing bytes queue up meanwhile.

use std::{
    ffi::CString,
    fs,
    io::{self, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::protocol::Frame;

use super::{random_token, Drive};

/// Well-known path of the connection-descriptor file.
pub const DESCRIPTOR_PATH: &str = "/tmp/.pbdebugger.out";

const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct FifoTransport {
    /// Debuggee-to-adapter FIFO; the adapter reads here.
    in_path: PathBuf,
    /// Adapter-to-debuggee FIFO; the adapter writes here.
    out_path: PathBuf,
    debugger_options: String,
    read_fd: Option<i32>,
    write_fd: Option<i32>,
    write_buf: Vec<u8>,
    writer_attached: bool,
}

impl FifoTransport {
    pub(crate) fn new(debugger_options: String) -> Self {
        let token = random_token();
        let tmp = std::env::temp_dir();

        Self {
            in_path: tmp.join(format!("pbdebugger_out_{token}")),
            out_path: tmp.join(format!("pbdebugger_in_{token}")),
            debugger_options,
            read_fd: None,
            write_fd: None,
            write_buf: Vec::new(),
            writer_attached: false,
        }
    }

    pub(crate) fn listen(&mut self) -> io::Result<()> {
        mkfifo(&self.in_path)?;
        mkfifo(&self.out_path)?;

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let descriptor = format!(
            "PB_DEBUGGER_Communication\n{}\n{}\n{}\n",
            epoch,
            self.communication_string(),
            self.debugger_options,
        );
        fs::write(DESCRIPTOR_PATH, descriptor)?;

        log::debug!(
            "created FIFOs {} / {}",
            self.in_path.display(),
            self.out_path.display()
        );
        Ok(())
    }

    /// Opens the read side. Non-blocking, so this succeeds before the
    /// debuggee has opened its write end; polling starts immediately.
    pub(crate) fn connect(&mut self) -> io::Result<Drive> {
        if self.read_fd.is_none() {
            self.read_fd = Some(open_nonblocking(&self.in_path, libc::O_RDONLY)?);
        }

        Ok(Drive {
            connected: true,
            ..Default::default()
        })
    }

    pub(crate) fn communication_string(&self) -> String {
        format!(
            "FifoFiles;{};{}",
            self.in_path.display(),
            self.out_path.display()
        )
    }

    pub(crate) fn send(&mut self, frame: &Frame) -> io::Result<()> {
        frame.encode(&mut self.write_buf);
        self.flush()
    }

    pub(crate) fn tick(&mut self) -> io::Result<Drive> {
        let mut drive = Drive::default();

        self.flush()?;

        let Some(fd) = self.read_fd else {
            return Ok(drive);
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            match n {
                0 if self.writer_attached => {
                    // The debuggee closed its write end for good.
                    drive.closed = true;
                    break;
                }
                0 => break, // no writer yet; keep polling
                n if n > 0 => {
                    self.writer_attached = true;
                    drive.bytes.extend_from_slice(&chunk[..n as usize]);
                }
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        // Empty pipe with a live writer. Retry on the next
                        // tick; the descriptor stays open.
                        io::ErrorKind::WouldBlock => {
                            self.writer_attached = true;
                            break;
                        }
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(err),
                    }
                }
            }
        }

        Ok(drive)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        if self.write_fd.is_none() {
            match open_nonblocking(&self.out_path, libc::O_WRONLY) {
                Ok(fd) => self.write_fd = Some(fd),
                // ENXIO until the debuggee opens its read end.
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        if let Some(fd) = self.write_fd {
            let mut writer = FdWriter(fd);
            super::drain_write(&mut self.write_buf, &mut writer)?;
        }

        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if let Some(fd) = self.read_fd.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.write_fd.take() {
            unsafe { libc::close(fd) };
        }

        let _ = fs::remove_file(&self.in_path);
        let _ = fs::remove_file(&self.out_path);
        let _ = fs::remove_file(DESCRIPTOR_PATH);
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct FdWriter(i32);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let cpath = path_cstring(path)?;
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn open_nonblocking(path: &Path, direction: libc::c_int) -> io::Result<i32> {
    let cpath = path_cstring(path)?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            direction | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };

    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::FrameAccumulator;

    fn test_transport(dir: &Path) -> FifoTransport {
        let token = random_token();
        FifoTransport {
            in_path: dir.join(format!("in_{token}")),
            out_path: dir.join(format!("out_{token}")),
            debugger_options: "1;1;0;0".to_string(),
            read_fd: None,
            write_fd: None,
            write_buf: Vec::new(),
            writer_attached: false,
        }
    }

    #[test]
    fn empty_polls_keep_the_descriptor_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = test_transport(dir.path());

        mkfifo(&transport.in_path).unwrap();
        mkfifo(&transport.out_path).unwrap();
        let drive = transport.connect().unwrap();
        assert!(drive.connected);

        // No writer yet: reads yield nothing and must not error or close.
        for _ in 0..50 {
            let drive = transport.tick().unwrap();
            assert!(drive.bytes.is_empty());
            assert!(!drive.closed);
        }

        // A writer appears and sends two frames in one burst.
        let frames = [
            Frame::with_values(3, 1, 41),
            Frame {
                command: 5,
                data: b"dbg".to_vec(),
                ..Default::default()
            },
        ];
        let bytes: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes()).collect();
        let mut writer = OpenOptions::new()
            .write(true)
            .open(&transport.in_path)
            .unwrap();
        writer.write_all(&bytes).unwrap();
        writer.flush().unwrap();

        let mut acc = FrameAccumulator::default();
        let mut received = Vec::new();
        for _ in 0..100 {
            let drive = transport.tick().unwrap();
            acc.push(&drive.bytes);
            received.extend(acc.drain_frames());
            if received.len() == frames.len() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(received, frames);

        // Still open and pollable after the burst.
        drop(writer);
        let _ = transport.tick().unwrap();
    }

    #[test]
    fn writes_queue_until_the_debuggee_attaches() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = test_transport(dir.path());

        mkfifo(&transport.in_path).unwrap();
        mkfifo(&transport.out_path).unwrap();

        // No reader on the out FIFO yet: the frame must queue, not fail.
        transport.send(&Frame::new(2)).unwrap();
        assert!(!transport.write_buf.is_empty());

        use std::os::unix::fs::OpenOptionsExt;
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&transport.out_path)
            .unwrap();

        transport.flush().unwrap();
        assert!(transport.write_buf.is_empty());

        use std::io::Read;
        let mut received = Vec::new();
        let mut chunk = [0u8; 64];
        while received.len() < 20 {
            match reader.read(&mut chunk) {
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(Frame::parse(&received), Frame::new(2));
    }
}
