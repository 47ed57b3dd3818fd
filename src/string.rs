use core::{fmt, str};

use std::borrow::Cow;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum SizedCStringError {
    #[snafu(display("Input string too big to fit into storage"))]
    TooBig,
}

/// Fixed-size NUL-terminated string buffer, as stored in directory entries
#[derive(Clone)]
#[repr(transparent)]
pub struct SizedCString<const SIZE: usize>([u8; SIZE]);

impl<const SIZE: usize> SizedCString<SIZE> {
    /// Copies `name` into a fresh buffer, truncating as needed.
    /// The last byte always holds a terminator.
    #[must_use]
    pub fn new_truncated(name: &[u8]) -> Self {
        let mut data = [0u8; SIZE];
        let len = name.len().min(SIZE - 1);
        data[..len].copy_from_slice(&name[..len]);
        Self(data)
    }
    #[must_use]
    pub fn as_str(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(self.bytes_to_nul())
    }
    #[must_use]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.bytes_to_nul())
    }
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }
    /// Raw buffer contents, terminator and trailing padding included
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.0
    }
    /// Buffer contents up to the first terminator
    #[must_use]
    pub fn bytes_to_nul(&self) -> &[u8] {
        let nul = self.0.iter().position(|&b| b == 0).unwrap_or(SIZE);
        &self.0[..nul]
    }
}

impl<const SIZE: usize> Default for SizedCString<SIZE> {
    fn default() -> Self {
        Self([0u8; SIZE])
    }
}

impl<const SIZE: usize> From<[u8; SIZE]> for SizedCString<SIZE> {
    fn from(other: [u8; SIZE]) -> SizedCString<SIZE> {
        SizedCString(other)
    }
}

impl<const SIZE: usize> TryFrom<&str> for SizedCString<SIZE> {
    type Error = SizedCStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() >= SIZE {
            return Err(SizedCStringError::TooBig);
        }
        Ok(Self::new_truncated(value.as_bytes()))
    }
}

impl<const SIZE: usize> fmt::Debug for SizedCString<SIZE> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_fmt(format_args!("\"{}\"", self.to_string_lossy()))
    }
}
