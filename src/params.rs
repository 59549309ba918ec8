//! Parameter sets for parameterized query execution.

use bytes::Bytes;
use thiserror::Error;

/// PostgreSQL's numeric identifier for a column or parameter type.
pub type Oid = u32;

/// Wire representation of a parameter or result value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    /// Values travel as UTF-8 text.
    Text = 0,
    /// Values travel in the type's binary encoding.
    Binary = 1,
}

impl Format {
    /// The format code sent on the wire.
    #[inline]
    pub fn code(self) -> i16 {
        self as i16
    }
}

/// Errors raised while assembling a [`QueryData`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The four parameter sequences disagree in length.
    #[error(
        "parameter sequences disagree: {values} values, {lengths} lengths, \
         {formats} formats, {types} types"
    )]
    Mismatched {
        /// Number of values supplied.
        values: usize,
        /// Number of lengths supplied.
        lengths: usize,
        /// Number of formats supplied.
        formats: usize,
        /// Number of type OIDs supplied.
        types: usize,
    },
    /// A declared length does not match the value it describes.
    #[error("declared length {length} does not match the {actual}-byte value at index {index}")]
    WrongLength {
        /// Index of the offending parameter.
        index: usize,
        /// The declared byte length.
        length: i32,
        /// The actual byte length of the value.
        actual: i32,
    },
}

/// Parameter values, lengths, formats, and declared type OIDs for one
/// execution. Immutable once built; the four sequences always agree in
/// length.
///
/// A `None` value is the SQL NULL (declared length `-1`). A type OID of `0`
/// leaves the parameter type to the server.
#[derive(Debug, Clone, Default)]
pub struct QueryData {
    values: Vec<Option<Bytes>>,
    lengths: Vec<i32>,
    formats: Vec<Format>,
    types: Vec<Oid>,
}

impl QueryData {
    /// Build a parameter set from its four parallel sequences, verifying
    /// that they agree.
    pub fn new(
        values: Vec<Option<Bytes>>,
        lengths: Vec<i32>,
        formats: Vec<Format>,
        types: Vec<Oid>,
    ) -> Result<Self, Error> {
        if values.len() != lengths.len()
            || values.len() != formats.len()
            || values.len() != types.len()
        {
            return Err(Error::Mismatched {
                values: values.len(),
                lengths: lengths.len(),
                formats: formats.len(),
                types: types.len(),
            });
        }

        for (index, (value, &length)) in values.iter().zip(&lengths).enumerate() {
            let actual = match value {
                Some(value) => value.len() as i32,
                None => -1,
            };

            if length != actual {
                return Err(Error::WrongLength {
                    index,
                    length,
                    actual,
                });
            }
        }

        Ok(Self {
            values,
            lengths,
            formats,
            types,
        })
    }

    /// Start building a parameter set one parameter at a time.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Raw parameter values; `None` is NULL.
    pub fn values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Byte length of each value (`-1` for NULL).
    pub fn lengths(&self) -> &[i32] {
        &self.lengths
    }

    /// Wire format of each value.
    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Declared type OID of each value (`0` for unspecified).
    pub fn types(&self) -> &[Oid] {
        &self.types
    }

    /// Number of parameters.
    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// True when the set holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Incremental [`QueryData`] builder that keeps the four sequences in sync.
#[derive(Debug, Default)]
pub struct Builder {
    values: Vec<Option<Bytes>>,
    lengths: Vec<i32>,
    formats: Vec<Format>,
    types: Vec<Oid>,
}

impl Builder {
    /// Append one parameter; the length is derived from the value.
    #[must_use]
    pub fn parameter(mut self, value: Option<Bytes>, format: Format, type_oid: Oid) -> Self {
        let length = match &value {
            Some(value) => value.len() as i32,
            None => -1,
        };

        self.values.push(value);
        self.lengths.push(length);
        self.formats.push(format);
        self.types.push(type_oid);
        self
    }

    /// Finish the set.
    pub fn build(self) -> QueryData {
        QueryData {
            values: self.values,
            lengths: self.lengths,
            formats: self.formats,
            types: self.types,
        }
    }
}
