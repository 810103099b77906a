//! File cursor representation.

use std::{fmt, num::ParseIntError, str::FromStr};

use snafu::{OptionExt, ResultExt, Snafu};

/// Position within an identity-stable file. The `(inode, device)` pair
/// identifies the file across opens; a change of either on the followed path
/// means the file was rotated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub inode: u64,
    pub device: u64,
    pub offset: u64,
}

impl Cursor {
    /// True when `other` refers to the same underlying file.
    pub fn same_file(&self, inode: u64, device: u64) -> bool {
        self.inode == inode && self.device == device
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.inode, self.device, self.offset)
    }
}

#[derive(Debug, Snafu)]
pub enum CursorParseError {
    #[snafu(display("cursor string '{input}' must have three ';'-separated fields"))]
    FieldCount { input: String },

    #[snafu(display("cursor string '{input}' holds a non-numeric field: {source}"))]
    BadField {
        input: String,
        source: ParseIntError,
    },
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut fields = input.split(';');
        let mut next = || fields.next().context(FieldCountSnafu { input });

        let cursor = Cursor {
            inode: next()?.parse().context(BadFieldSnafu { input })?,
            device: next()?.parse().context(BadFieldSnafu { input })?,
            offset: next()?.parse().context(BadFieldSnafu { input })?,
        };

        if fields.next().is_some() {
            return FieldCountSnafu { input }.fail();
        }

        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrips_through_parse() {
        let cursor = Cursor {
            inode: 6172538,
            device: 2049,
            offset: 4096,
        };

        let serialized = cursor.to_string();
        assert_eq!(serialized, "6172538;2049;4096");
        assert_eq!(serialized.parse::<Cursor>().unwrap(), cursor);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!("".parse::<Cursor>().is_err());
        assert!("1;2".parse::<Cursor>().is_err());
        assert!("1;2;3;4".parse::<Cursor>().is_err());
        assert!("a;2;3".parse::<Cursor>().is_err());
        assert!("1;2;-3".parse::<Cursor>().is_err());
    }
}
