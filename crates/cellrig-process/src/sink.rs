//! Mirror destinations for captured output

use std::io::{self, Write};

/// Receives a copy of every chunk a session captures
pub trait OutputSink: Send {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush_sink(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write + Send> OutputSink for W {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }

    fn flush_sink(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Writer that starts every line with a fixed prefix
///
/// Used to interleave the logs of several members on one terminal:
///
/// ```text
/// [o][file-server] listening on 127.0.0.1:8080
/// [e][auctioneer] lost lock, retrying
/// ```
pub struct PrefixedWriter<W> {
    prefix: Vec<u8>,
    inner: W,
    at_line_start: bool,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(prefix: impl Into<String>, inner: W) -> Self {
        Self {
            prefix: prefix.into().into_bytes(),
            inner,
            at_line_start: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in buf.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start {
                self.inner.write_all(&self.prefix)?;
            }
            self.inner.write_all(line)?;
            self.at_line_start = line.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_every_line() {
        let mut writer = PrefixedWriter::new("[o][rep] ", Vec::new());
        writer.write_all(b"one\ntw").unwrap();
        writer.write_all(b"o\nthree\n").unwrap();
        assert_eq!(
            String::from_utf8(writer.into_inner()).unwrap(),
            "[o][rep] one\n[o][rep] two\n[o][rep] three\n"
        );
    }

    #[test]
    fn test_sink_blanket_impl() {
        let mut sink: Box<dyn OutputSink> = Box::new(Vec::<u8>::new());
        sink.write_chunk(b"abc").unwrap();
        sink.flush_sink().unwrap();
    }
}
