use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::time::Duration;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeouts handed to a transport when it connects.
///
/// `open` bounds establishing the link (TCP connect, handshakes, descriptor reads), and
/// `command` bounds every individual native transfer afterwards. A read that spans
/// several transfers can therefore take a multiple of `command`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub open: Duration,
    pub command: Duration,
}

impl Timeouts {
    pub fn new(open: Duration, command: Duration) -> Self {
        Self { open, command }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_TIMEOUT,
            command: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

// Every link to an instrument (USBTMC, VXI-11, HiSLIP, Serial, Raw Sockets) implements
// this. Connecting is done by each implementation's constructor, so an instance is only
// ever Connected -> Disconnected.
pub trait Transport: Send {
    /// Sends a complete command, framed however the link needs it.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Blocks until `size` bytes (or the end of the current message) have arrived.
    fn read(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Blocks until the end of the current message.
    fn read_all(&mut self) -> Result<Vec<u8>>;

    /// Releases the native resources, calling this more than once is fine.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Whether the last read stopped before the instrument finished its message.
    fn pending(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        (**self).read(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        (**self).read_all()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn pending(&self) -> bool {
        (**self).pending()
    }
}

/// Newline framed messages over a byte stream, as spoken over raw sockets and serial lines.
///
/// Bytes read past the end of a message are kept for the next read.
pub struct LineStream<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S: Read + Write> LineStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Writes `data`, adding the `\n` terminator if it isn't already there.
    pub fn send_line(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        if data.last() != Some(&b'\n') {
            self.stream.write_all(b"\n")?;
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Reads up to and including the next `\n`. If the peer goes away part way through a
    /// line, whatever arrived is returned.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut searched = 0;
        loop {
            if let Some(position) = self.buffer[searched..].iter().position(|b| *b == b'\n') {
                return Ok(self.buffer.drain(..=searched + position).collect());
            }
            searched = self.buffer.len();

            if self.fill()? == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::transfer(-1, "Connection closed by the instrument"));
                }
                return Ok(std::mem::take(&mut self.buffer));
            }
        }
    }

    /// Reads exactly `size` bytes.
    pub fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < size {
            if self.fill()? == 0 {
                return Err(Error::transfer(
                    -1,
                    format!(
                        "Connection closed after {} of {} bytes",
                        self.buffer.len(),
                        size
                    ),
                ));
            }
        }
        Ok(self.buffer.drain(..size).collect())
    }

    /// Drops anything received but not yet read.
    pub fn discard(&mut self) {
        self.buffer.clear();
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0; 4096];
        let received = self.stream.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..received]);
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // Hands out its input a few bytes at a time, like a slow serial line.
    struct Trickle {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl Trickle {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.iter().copied().collect(),
                output: Vec::new(),
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let count = buf.len().min(3).min(self.input.len());
            for byte in buf.iter_mut().take(count) {
                *byte = self.input.pop_front().unwrap();
            }
            Ok(count)
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn commands_are_newline_terminated_once() {
        let mut stream = LineStream::new(Trickle::new(b""));
        stream.send_line(b"*RST").unwrap();
        stream.send_line(b"*CLS\n").unwrap();
        assert_eq!(stream.get_ref().output, b"*RST\n*CLS\n");
    }

    #[test]
    fn lines_are_split_across_reads() {
        let mut stream = LineStream::new(Trickle::new(b"+1.0E+00\nACME,X,1,2\n"));
        assert_eq!(stream.read_line().unwrap(), b"+1.0E+00\n");
        assert_eq!(stream.read_line().unwrap(), b"ACME,X,1,2\n");
        assert!(stream.read_line().is_err());
    }

    #[test]
    fn exact_reads_keep_the_rest() {
        let mut stream = LineStream::new(Trickle::new(b"#14abcdOK\n"));
        assert_eq!(stream.read_exact(2).unwrap(), b"#1");
        assert_eq!(stream.read_exact(5).unwrap(), b"4abcd");
        assert_eq!(stream.read_line().unwrap(), b"OK\n");
        assert!(stream.read_exact(1).is_err());
    }

    #[test]
    fn a_partial_line_is_returned_at_close() {
        let mut stream = LineStream::new(Trickle::new(b"partial"));
        assert_eq!(stream.read_line().unwrap(), b"partial");
    }
}
