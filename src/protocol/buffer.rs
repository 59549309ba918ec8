use bytes::{Buf, Bytes};
use memchr::memchr;
use std::io;

/// Consuming reader over one frozen message body.
///
/// Every accessor checks the remaining length up front and reports
/// truncation as an I/O error, so parsers can bubble malformed frames with
/// `?` instead of guarding each read.
pub(crate) struct Frame {
    body: Bytes,
}

impl Frame {
    pub(crate) fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn truncated() -> io::Error {
        io::Error::new(io::ErrorKind::UnexpectedEof, "truncated message frame")
    }

    fn ensure(&self, count: usize) -> io::Result<()> {
        if self.body.len() < count {
            return Err(Self::truncated());
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub(crate) fn take_u8(&mut self) -> io::Result<u8> {
        self.ensure(1)?;
        Ok(self.body.get_u8())
    }

    pub(crate) fn take_i16(&mut self) -> io::Result<i16> {
        self.ensure(2)?;
        Ok(self.body.get_i16())
    }

    pub(crate) fn take_i32(&mut self) -> io::Result<i32> {
        self.ensure(4)?;
        Ok(self.body.get_i32())
    }

    pub(crate) fn take_u32(&mut self) -> io::Result<u32> {
        self.ensure(4)?;
        Ok(self.body.get_u32())
    }

    /// Split off everything up to the next NUL terminator, consuming the
    /// terminator as well.
    pub(crate) fn take_cstr(&mut self) -> io::Result<Bytes> {
        let end = memchr(0, &self.body).ok_or_else(Self::truncated)?;
        let value = self.body.split_to(end);
        self.body.advance(1);

        Ok(value)
    }

    /// Read a terminated string as UTF-8, replacing invalid sequences.
    pub(crate) fn take_string(&mut self) -> io::Result<String> {
        let raw = self.take_cstr()?;

        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Split off the next `count` bytes as a shared slice.
    pub(crate) fn take_bytes(&mut self, count: usize) -> io::Result<Bytes> {
        self.ensure(count)?;

        Ok(self.body.split_to(count))
    }

    /// Consume the remainder of the frame.
    pub(crate) fn take_rest(&mut self) -> Bytes {
        self.body.split_to(self.body.len())
    }
}
