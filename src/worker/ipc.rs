//! Buffered IPC primitives for evaluator communication.
//!
//! Line- and length-framed I/O over pipes with EINTR handling and optional
//! read and write deadlines.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Instant;

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Largest write that cannot block once the pipe reports POLLOUT (PIPE_BUF).
const ATOMIC_WRITE: usize = 4096;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
    /// Bound on every write; `None` blocks until the peer reads.
    write_deadline: Option<Instant>,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            write_deadline: None,
        }
    }

    /// Block until the descriptor is readable or `deadline` passes.
    ///
    /// Hang-up counts as readable; the following read reports EOF.
    fn wait_readable(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.wait_for(PollFlags::POLLIN, deadline, "timed out waiting for evaluator output")
    }

    /// Block until the peer has room for a write or `deadline` passes.
    ///
    /// A closed peer counts as writable; the following write reports EPIPE.
    fn wait_writable(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.wait_for(PollFlags::POLLOUT, deadline, "timed out waiting for evaluator to read")
    }

    fn wait_for(&self, events: PollFlags, deadline: Option<Instant>, what: &str) -> io::Result<()> {
        let Some(deadline) = deadline else {
            return Ok(());
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, what.to_string()));
            }
            let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX).max(1);
            let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
            let mut fds = [PollFd::new(self.fd.as_fd(), events)];
            match poll(&mut fds, timeout) {
                Ok(0) => continue,
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buf = match self.write_deadline {
            Some(deadline) => {
                self.wait_writable(Some(deadline))?;
                &buf[..buf.len().min(ATOMIC_WRITE)]
            }
            None => buf,
        };
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Buffered reader for newline- and length-framed tokens.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: Vec<u8>,
}

impl LineReader {
    /// Create a new line reader from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            line_buffer: Vec::with_capacity(256),
        }
    }

    /// Fill the buffer, waiting at most until `deadline` if it is empty.
    fn fill(
        reader: &mut BufReader<PipeFd>,
        deadline: Option<Instant>,
    ) -> io::Result<&[u8]> {
        if reader.buffer().is_empty() {
            reader.get_ref().wait_readable(deadline)?;
        }
        reader.fill_buf()
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF. A trailing `\r` is stripped.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.read_line_until(None)
    }

    /// Read a line, failing with `TimedOut` if it is not complete by `deadline`.
    pub fn read_line_until(&mut self, deadline: Option<Instant>) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        loop {
            let available = Self::fill(&mut self.reader, deadline)?;
            if available.is_empty() {
                if self.line_buffer.is_empty() {
                    return Ok(None);
                }
                break;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.line_buffer.extend_from_slice(&available[..i]);
                    self.reader.consume(i + 1);
                    break;
                }
                None => {
                    let n = available.len();
                    self.line_buffer.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }
        if self.line_buffer.last() == Some(&b'\r') {
            self.line_buffer.pop();
        }
        std::str::from_utf8(&self.line_buffer)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read a line and return an owned string.
    /// Returns `None` on EOF.
    pub fn read_line_owned(&mut self) -> io::Result<Option<String>> {
        Ok(self.read_line()?.map(String::from))
    }

    /// Read exactly `len` bytes, failing on EOF or when `deadline` passes.
    pub fn read_exact_until(&mut self, len: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let available = Self::fill(&mut self.reader, deadline)?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} bytes", out.len(), len),
                ));
            }
            let take = available.len().min(len - out.len());
            out.extend_from_slice(&available[..take]);
            self.reader.consume(take);
        }
        Ok(out)
    }
}

/// Buffered writer for IPC. Output is only sent on [`LineWriter::flush`]
/// or [`LineWriter::write_line`].
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    /// Create a new line writer from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.push_line(line)?;
        self.writer.flush()
    }

    /// Buffer a line without flushing.
    pub fn push_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Write raw bytes and flush.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    /// Bound all following writes, including buffered flushes, by `deadline`.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.writer.get_mut().write_deadline = deadline;
    }

    /// Buffered stream for encoders that write directly.
    pub fn stream(&mut self) -> &mut BufWriter<PipeFd> {
        &mut self.writer
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
