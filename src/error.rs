
//! Error type returned by all fallible operations of this crate.

use std::borrow::Cow;
use std::io::ErrorKind;

/// A result that, if ok, contains a value, and otherwise contains an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an [`Error`].
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;

/// An error that occurred while encoding or decoding an image.
#[derive(Debug)]
pub enum Error {

    /// The input handed to the encoder cannot be compressed:
    /// zero dimensions, a mask of the wrong size, or a knob out of range.
    Invalid(Cow<'static, str>),

    /// The byte stream ended in the middle of a symbol or header field.
    Truncated,

    /// The stream contents are inconsistent: a malformed table descriptor,
    /// an index outside the active filter subset, a zero-run overrunning its
    /// plane, or an LZ copy reaching before the image origin.
    Corrupt(Cow<'static, str>),

    /// A symbol distribution requires longer Huffman codes than the table
    /// limit allows. Reported by the encoder only.
    TableBudget(Cow<'static, str>),

    /// The underlying byte stream could not be read or written.
    Io(IoError),
}

impl Error {

    /// Create an error of the variant `Invalid`.
    pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Invalid(message.into())
    }

    /// Create an error of the variant `Corrupt`.
    pub(crate) fn corrupt(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Corrupt(message.into())
    }

    /// Create an error of the variant `TableBudget`.
    pub(crate) fn budget(message: impl Into<Cow<'static, str>>) -> Self {
        Error::TableBudget(message.into())
    }
}

/// Enable using the `?` operator on `io::Result`.
/// An unexpected end of the byte stream means the bit stream was cut short.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        if error.kind() == ErrorKind::UnexpectedEof { Error::Truncated }
        else { Error::Io(error) }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Invalid(message) => write!(formatter, "invalid input: {}", message),
            Error::Truncated => write!(formatter, "the byte stream ended unexpectedly"),
            Error::Corrupt(message) => write!(formatter, "corrupt stream: {}", message),
            Error::TableBudget(message) => write!(formatter, "entropy table budget exceeded: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}
