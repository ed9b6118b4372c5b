//! Output filters applied to the message body during DATA
//!
//! The body is streamed through three stages: newline normalization to
//! CRLF, wrapping of over-long lines, and dot stuffing for transparency.

use std::io::{self, Write};

/// Maximum length of a transmitted text line, including CRLF
pub const MAX_LINE_LENGTH: usize = 1000;

/// Doubles a `.` at the beginning of a line so body lines cannot be
/// mistaken for the DATA terminator
pub struct DotStuffingWriter<W> {
    inner: W,
    state: LineState,
}

#[derive(PartialEq, Eq, Copy, Clone)]
enum LineState {
    Normal,
    Cr,
    // Start of stream counts as start of line
    CrLf,
}

impl<W: Write> DotStuffingWriter<W> {
    /// Wraps a writer
    pub fn new(inner: W) -> DotStuffingWriter<W> {
        DotStuffingWriter {
            inner,
            state: LineState::CrLf,
        }
    }
}

impl<W: Write> Write for DotStuffingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if self.state == LineState::CrLf && byte == b'.' {
                self.inner.write_all(b".")?;
            }
            self.state = match (self.state, byte) {
                (_, b'\r') => LineState::Cr,
                (LineState::Cr, b'\n') => LineState::CrLf,
                _ => LineState::Normal,
            };
            self.inner.write_all(&[byte])?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps lines longer than a limit, preferring the last space before the
/// limit as the break point
pub struct LineWrapWriter<W> {
    inner: W,
    // Payload capacity per line, excluding the CRLF
    limit: usize,
    buffer: Vec<u8>,
}

impl<W: Write> LineWrapWriter<W> {
    /// Wraps a writer, limiting lines to `max_line_length` octets
    /// including the CRLF
    pub fn new(inner: W, max_line_length: usize) -> LineWrapWriter<W> {
        LineWrapWriter {
            inner,
            limit: max_line_length.saturating_sub(2).max(1),
            buffer: Vec::new(),
        }
    }

    fn wrap_buffer(&mut self) -> io::Result<()> {
        match self.buffer.iter().rposition(|&b| b == b' ') {
            Some(space) => {
                self.inner.write_all(&self.buffer[..space])?;
                self.inner.write_all(b"\r\n")?;
                self.buffer.drain(..=space);
            }
            None => {
                self.inner.write_all(&self.buffer)?;
                self.inner.write_all(b"\r\n")?;
                self.buffer.clear();
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for LineWrapWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                if self.buffer.last() == Some(&b'\r') {
                    self.buffer.pop();
                }
                self.inner.write_all(&self.buffer)?;
                self.inner.write_all(b"\r\n")?;
                self.buffer.clear();
            } else {
                self.buffer.push(byte);
                if self.buffer.len() >= self.limit {
                    self.wrap_buffer()?;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.inner.write_all(&rest)?;
        }
        self.inner.flush()
    }
}

/// Converts bare `\r` and bare `\n` into `\r\n`
pub struct EolNormalizingWriter<W> {
    inner: W,
    last_was_cr: bool,
    ends_with_newline: bool,
    empty: bool,
}

impl<W: Write> EolNormalizingWriter<W> {
    /// Wraps a writer
    pub fn new(inner: W) -> EolNormalizingWriter<W> {
        EolNormalizingWriter {
            inner,
            last_was_cr: false,
            ends_with_newline: false,
            empty: true,
        }
    }

    /// Guarantees the output ends with CRLF, then flushes the whole chain
    pub fn end_with_crlf_and_flush(&mut self) -> io::Result<()> {
        if !self.empty && !self.ends_with_newline {
            self.write_all(b"\r\n")?;
        }
        self.flush()
    }
}

impl<W: Write> Write for EolNormalizingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            match byte {
                b'\r' => {
                    self.inner.write_all(b"\r\n")?;
                    self.last_was_cr = true;
                    self.ends_with_newline = true;
                }
                b'\n' => {
                    // A \n right after \r was already emitted with it
                    if !self.last_was_cr {
                        self.inner.write_all(b"\r\n")?;
                        self.ends_with_newline = true;
                    }
                    self.last_was_cr = false;
                }
                _ => {
                    self.inner.write_all(&[byte])?;
                    self.last_was_cr = false;
                    self.ends_with_newline = false;
                }
            }
            self.empty = false;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn normalize(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = EolNormalizingWriter::new(&mut out);
        writer.write_all(input).unwrap();
        writer.end_with_crlf_and_flush().unwrap();
        out
    }

    fn stuff(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = DotStuffingWriter::new(&mut out);
        writer.write_all(input).unwrap();
        writer.flush().unwrap();
        out
    }

    fn wrap(input: &[u8], limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = LineWrapWriter::new(&mut out, limit);
        writer.write_all(input).unwrap();
        writer.flush().unwrap();
        out
    }

    #[test]
    fn bare_newlines_become_crlf() {
        assert_eq!(normalize(b"a\nb\n"), b"a\r\nb\r\n");
        assert_eq!(normalize(b"a\rb"), b"a\r\nb\r\n");
        assert_eq!(normalize(b"a\r\nb\r\n"), b"a\r\nb\r\n");
    }

    #[test]
    fn missing_final_newline_is_added() {
        assert_eq!(normalize(b"no newline"), b"no newline\r\n");
    }

    #[test]
    fn empty_body_stays_empty() {
        assert_eq!(normalize(b""), b"");
    }

    #[test]
    fn leading_dots_are_doubled() {
        assert_eq!(stuff(b".\r\n"), b"..\r\n");
        assert_eq!(stuff(b"a\r\n.b\r\n"), b"a\r\n..b\r\n");
        assert_eq!(stuff(b"a.b\r\n"), b"a.b\r\n");
    }

    #[test]
    fn first_line_counts_as_line_start() {
        assert_eq!(stuff(b".start"), b"..start");
    }

    #[test]
    fn short_lines_pass_through_wrapping() {
        assert_eq!(wrap(b"hello world\r\n", 20), b"hello world\r\n");
    }

    #[test]
    fn long_lines_wrap_at_last_space() {
        // limit 12 leaves 10 payload octets per line
        assert_eq!(wrap(b"aaa bbb cccc\r\n", 12), b"aaa bbb\r\ncccc\r\n");
    }

    #[test]
    fn unbreakable_lines_wrap_hard() {
        assert_eq!(wrap(b"aaaaaaaaaabb\r\n", 12), b"aaaaaaaaaa\r\nbb\r\n");
    }

    #[test]
    fn full_chain_for_a_typical_body() {
        let mut out = Vec::new();
        let mut writer = EolNormalizingWriter::new(LineWrapWriter::new(
            DotStuffingWriter::new(&mut out),
            MAX_LINE_LENGTH,
        ));
        writer
            .write_all(b"Subject: test\n\n.hidden dot\nplain line")
            .unwrap();
        writer.end_with_crlf_and_flush().unwrap();
        drop(writer);

        assert_eq!(
            out,
            b"Subject: test\r\n\r\n..hidden dot\r\nplain line\r\n".to_vec()
        );
    }
}
