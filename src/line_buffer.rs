//! Accumulates client bytes until a CRLF-terminated line or a complete header
//! block can be taken off the front.
//!
//! [`LineBuffer`] never performs I/O. Callers append whatever chunk the socket
//! produced and then ask for a line; when none is available yet they simply
//! read more. Delimiters split across chunk boundaries are found because the
//! search always runs over the whole accumulated buffer.

use bytes::{Bytes, BytesMut};

use crate::error::ProxyError;

pub const CRLF: &[u8] = b"\r\n";
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max_len: usize,
}

impl LineBuffer {
    /// `max_len` caps a line or header block, delimiter included. Bytes past
    /// the delimiter do not count.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Takes the first CRLF-terminated line off the buffer.
    ///
    /// Returns the line without its delimiter together with a copy of
    /// everything that followed it. The buffer keeps only that remainder.
    /// Fails once the line, found or still open, is longer than the cap.
    pub fn try_extract_line(&mut self) -> Result<Option<(Bytes, Bytes)>, ProxyError> {
        let Some(index) = find(&self.buf, CRLF) else {
            self.check_open()?;
            return Ok(None);
        };
        self.check_len(index + CRLF.len())?;
        let line = self.buf.split_to(index).freeze();
        let _ = self.buf.split_to(CRLF.len());
        let remainder = Bytes::copy_from_slice(&self.buf);
        Ok(Some((line, remainder)))
    }

    /// Returns the length of the header block, terminator included.
    ///
    /// The buffer is assumed to start right after a request line whose CRLF
    /// has already been consumed, so an empty header block is just `\r\n`.
    pub fn header_block_len(&self) -> Result<Option<usize>, ProxyError> {
        if self.buf.starts_with(CRLF) {
            return Ok(Some(CRLF.len()));
        }
        match find(&self.buf, HEADER_TERMINATOR) {
            Some(i) => {
                let len = i + HEADER_TERMINATOR.len();
                self.check_len(len)?;
                Ok(Some(len))
            }
            None => {
                self.check_open()?;
                Ok(None)
            }
        }
    }

    fn check_len(&self, len: usize) -> Result<(), ProxyError> {
        if len > self.max_len {
            return Err(ProxyError::HeaderTooLarge(self.max_len));
        }
        Ok(())
    }

    /// With no delimiter buffered yet, the earliest the line can end is one
    /// byte past what is already held.
    fn check_open(&self) -> Result<(), ProxyError> {
        self.check_len(self.buf.len() + 1)
    }

    /// Removes and returns the first `n` bytes.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n.min(self.buf.len())).freeze()
    }

    /// Drains whatever is buffered, leaving the buffer empty.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unbounded() -> LineBuffer {
        LineBuffer::new(usize::MAX)
    }

    #[test]
    fn no_line_until_delimiter_arrives() {
        let mut buf = unbounded();
        buf.append(b"GET http://example.com/ HTTP/1.1");
        assert!(buf.try_extract_line().unwrap().is_none());
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn extracts_line_and_remainder() {
        let mut buf = unbounded();
        buf.append(b"CONNECT a:1 HTTP/1.1\r\nHost: a\r\n\r\n");
        let (line, rest) = buf.try_extract_line().unwrap().unwrap();
        assert_eq!(&line[..], b"CONNECT a:1 HTTP/1.1");
        assert_eq!(&rest[..], b"Host: a\r\n\r\n");
        assert_eq!(&buf.take_all()[..], b"Host: a\r\n\r\n");
    }

    #[test]
    fn delimiter_split_across_appends() {
        let mut buf = unbounded();
        buf.append(b"abc\r");
        assert!(buf.try_extract_line().unwrap().is_none());
        buf.append(b"\ndef");
        let (line, rest) = buf.try_extract_line().unwrap().unwrap();
        assert_eq!(&line[..], b"abc");
        assert_eq!(&rest[..], b"def");
    }

    #[test]
    fn one_byte_at_a_time() {
        let mut buf = unbounded();
        let input = b"CONNECT example.com:443 HTTP/1.1\r\n";
        for (i, byte) in input.iter().enumerate() {
            buf.append(&[*byte]);
            if i + 1 < input.len() {
                assert!(buf.try_extract_line().unwrap().is_none());
            }
        }
        let (line, rest) = buf.try_extract_line().unwrap().unwrap();
        assert_eq!(&line[..], b"CONNECT example.com:443 HTTP/1.1");
        assert!(rest.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_header_block_is_bare_crlf() {
        let mut buf = unbounded();
        buf.append(b"\r\nrest");
        assert_eq!(buf.header_block_len().unwrap(), Some(2));
    }

    #[test]
    fn header_terminator_split_across_appends() {
        let mut buf = unbounded();
        buf.append(b"Host: a\r\nUser-Agent: x\r\n\r");
        assert_eq!(buf.header_block_len().unwrap(), None);
        buf.append(b"\n\x16\x03");
        let len = buf.header_block_len().unwrap().unwrap();
        assert_eq!(&buf.take(len)[..], b"Host: a\r\nUser-Agent: x\r\n\r\n");
        assert_eq!(&buf.take_all()[..], b"\x16\x03");
    }

    #[test]
    fn open_line_beyond_cap_fails() {
        let mut buf = LineBuffer::new(8);
        buf.append(b"1234567");
        assert!(buf.try_extract_line().unwrap().is_none());
        buf.append(b"8");
        let err = buf.try_extract_line().unwrap_err();
        assert!(matches!(err, ProxyError::HeaderTooLarge(8)));
    }

    #[test]
    fn line_at_cap_is_accepted() {
        let mut buf = LineBuffer::new(8);
        buf.append(b"123456\r\n");
        let (line, _) = buf.try_extract_line().unwrap().unwrap();
        assert_eq!(&line[..], b"123456");
    }

    #[test]
    fn bytes_after_the_line_do_not_count() {
        let mut buf = LineBuffer::new(8);
        buf.append(b"GET\r\n");
        buf.append(&[b'x'; 64]);
        let (line, rest) = buf.try_extract_line().unwrap().unwrap();
        assert_eq!(&line[..], b"GET");
        assert_eq!(rest.len(), 64);
    }

    #[test]
    fn header_block_cap_ignores_trailing_data() {
        let mut buf = LineBuffer::new(16);
        buf.append(b"Host: a\r\n\r\n");
        buf.append(&[0x16; 100]);
        assert_eq!(buf.header_block_len().unwrap(), Some(11));

        let mut buf = LineBuffer::new(16);
        buf.append(b"Host: a\r\nX-Long: 1234567\r\n\r\n");
        assert!(matches!(
            buf.header_block_len(),
            Err(ProxyError::HeaderTooLarge(16))
        ));
    }
}
