//! System journal reader.
//!
//! Instead of binding `libsystemd`, the reader drives a `journalctl` child
//! process in JSON output mode and follows its stdout. `journalctl` keeps
//! reading across journal rotations on its own, and the `__CURSOR` field of
//! every record doubles as the opaque resume token committed to the cursor
//! store.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStdout, Command},
};

use crate::entry::EntryMap;

const JOURNALCTL: &str = "journalctl";
pub const CURSOR_FIELD: &str = "__CURSOR";

/// Upper bound on waiting for the next journal record. `journalctl --follow`
/// blocks while the journal is idle; the wait is bounded so the follower's
/// cursor commits are not starved behind the reader lock.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum JournaldReadError {
    #[snafu(display("unable to spawn {JOURNALCTL} for '{}': {source}", directory.display()))]
    Spawn {
        directory: PathBuf,
        source: io::Error,
    },

    #[snafu(display("{JOURNALCTL} did not expose a stdout pipe"))]
    NoStdout,

    #[snafu(display("failure reading {JOURNALCTL} output: {source}"))]
    Read { source: io::Error },

    #[snafu(display("{JOURNALCTL} exited"))]
    Exited,

    #[snafu(display("unparseable journal record: {source}"))]
    BadRecord { source: serde_json::Error },

    #[snafu(display("unable to read machine id from '{}': {source}", path.display()))]
    MachineId { path: PathBuf, source: io::Error },
}

/// Constructs the journal directory for this machine from the machine-id
/// file and the journal base path.
pub fn journal_directory(
    machine_id_path: &Path,
    journal_path: &Path,
) -> Result<PathBuf, JournaldReadError> {
    let machine_id = std::fs::read_to_string(machine_id_path).context(MachineIdSnafu {
        path: machine_id_path,
    })?;

    Ok(journal_path.join(machine_id.trim()))
}

/// Tails the system journal, yielding one field map per record.
pub struct JournaldReader {
    directory: PathBuf,
    cursor: String,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl JournaldReader {
    pub fn new(
        directory: impl Into<PathBuf>,
        initial_cursor: String,
    ) -> Result<Self, JournaldReadError> {
        let mut reader = Self {
            directory: directory.into(),
            cursor: initial_cursor,
            child: None,
            lines: None,
        };

        reader.acquire()?;
        Ok(reader)
    }

    /// Reads the next journal record. Returns `Ok(None)` when no record
    /// arrived within the bounded wait (the "no records" sentinel).
    pub async fn entry_read(&mut self) -> Result<Option<EntryMap>, JournaldReadError> {
        if !self.acquired() {
            self.acquire()?;
        }

        let lines = self.lines.as_mut().context(NoStdoutSnafu)?;

        let line = match tokio::time::timeout(READ_TIMEOUT, lines.next_line()).await {
            Err(_elapsed) => return Ok(None),
            Ok(result) => match result.context(ReadSnafu)? {
                Some(line) => line,
                None => {
                    // Child exited; drop it so the next call respawns with
                    // the last known cursor.
                    self.close().await;
                    return ExitedSnafu.fail();
                }
            },
        };

        let record: EntryMap = serde_json::from_str(&line).context(BadRecordSnafu)?;

        if let Some(cursor) = record.get(CURSOR_FIELD).and_then(|value| value.as_str()) {
            self.cursor = cursor.to_string();
        }

        Ok(Some(record))
    }

    fn acquire(&mut self) -> Result<(), JournaldReadError> {
        let mut command = Command::new(JOURNALCTL);
        command
            .arg("--directory")
            .arg(&self.directory)
            .args(["--output", "json", "--follow", "--all"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if self.cursor.is_empty() {
            // Without a stored cursor, start from the present rather than
            // replaying the whole journal.
            command.args(["--lines", "0"]);
        } else {
            command.arg(format!("--after-cursor={}", self.cursor));
        }

        let mut child = command.spawn().context(SpawnSnafu {
            directory: self.directory.clone(),
        })?;
        let stdout = child.stdout.take().context(NoStdoutSnafu)?;

        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    /// Opaque resume token of the last record handed out.
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Whether a journal child process is currently attached.
    pub fn acquired(&self) -> bool {
        self.child.is_some()
    }

    /// Reader shell without a child process, for exercising record handling.
    #[cfg(test)]
    pub(crate) fn new_unspawned_for_tests(directory: PathBuf) -> Self {
        Self {
            directory,
            cursor: String::new(),
            child: None,
            lines: None,
        }
    }

    /// Terminates the child process, if any.
    pub async fn close(&mut self) {
        self.lines = None;

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_directory_joins_trimmed_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        let machine_id_path = dir.path().join("machine-id");
        std::fs::write(&machine_id_path, "77f4a6b2096e4a1c81f38f9d0a35b44a\n").unwrap();

        let directory =
            journal_directory(&machine_id_path, Path::new("/var/log/journal")).unwrap();

        assert_eq!(
            directory,
            Path::new("/var/log/journal/77f4a6b2096e4a1c81f38f9d0a35b44a")
        );
    }

    #[test]
    fn journal_directory_requires_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("machine-id");

        assert!(journal_directory(&missing, Path::new("/var/log/journal")).is_err());
    }
}
