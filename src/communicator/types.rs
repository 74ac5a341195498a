use std::fs::Metadata;
use std::string::FromUtf8Error;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// What the transfer backends need to know about a local upload source.
///
/// `None` in place of a `FileInfo` means the length is unknown (a pipe or an
/// in-memory stream) and the SCP backend has to buffer the data first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Permission bits only (`0o7777` mask).
    pub mode: u32,
    pub is_regular: bool,
    pub is_dir: bool,
}

impl FileInfo {
    pub fn from_metadata(name: impl Into<String>, metadata: &Metadata) -> Self {
        Self {
            name: name.into(),
            size: metadata.len(),
            mode: permission_bits(metadata),
            is_regular: metadata.is_file(),
            is_dir: metadata.is_dir(),
        }
    }

    /// A regular file with known size and mode.
    pub fn regular(name: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            name: name.into(),
            size,
            mode: mode & 0o7777,
            is_regular: true,
            is_dir: false,
        }
    }
}

#[cfg(unix)]
pub(crate) fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Errors that can occur when interpreting captured command output
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] FromUtf8Error),

    #[error("Output exceeds maximum size: {size} bytes")]
    OutputTooLarge { size: usize },
}

/// Captured stdout/stderr, exit status and timing of a command run to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
    pub timestamp: SystemTime,
    pub duration: Duration,
}

impl Default for CommandOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandOutput {
    const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024; // 10 MB

    pub fn new() -> Self {
        Self {
            stdout: vec![],
            stderr: vec![],
            exit_status: 0,
            timestamp: SystemTime::now(),
            duration: Duration::default(),
        }
    }

    pub fn stop_timing(&mut self) {
        if let Ok(elapsed) = self.timestamp.elapsed() {
            self.duration = elapsed;
        }
    }

    pub fn to_stdout_string(&self) -> Result<String, OutputError> {
        Self::bounded_string(&self.stdout)
    }

    pub fn to_stderr_string(&self) -> Result<String, OutputError> {
        Self::bounded_string(&self.stderr)
    }

    fn bounded_string(bytes: &[u8]) -> Result<String, OutputError> {
        if bytes.len() > Self::MAX_OUTPUT_SIZE {
            return Err(OutputError::OutputTooLarge { size: bytes.len() });
        }
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Non-empty, trimmed stdout lines.
    pub fn stdout_lines(&self) -> Result<Vec<String>, OutputError> {
        Ok(self
            .to_stdout_string()?
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}

/// The command that was run plus its resulting output.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub output: CommandOutput,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.output.exit_status == 0
    }

    pub fn duration(&self) -> Duration {
        self.output.duration
    }
}
