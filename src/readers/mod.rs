//! File and journal readers feeding the followers.

mod cursor;
mod journald;
mod line_reader;

pub use cursor::{Cursor, CursorParseError};
pub use journald::{JournaldReadError, JournaldReader, journal_directory};
pub use line_reader::{LineReader, ReadError};
