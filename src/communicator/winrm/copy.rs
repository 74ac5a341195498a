//! Chunked file upload over plain WinRM commands.
//!
//! The file is base64-encoded into a temp file on the guest with a series of
//! `echo` commands, one encoded chunk per line, then a PowerShell step
//! decodes it into place.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::client::{Shell, WinRmClient};
use super::soap::powershell;
use super::WinRmError;
use crate::communicator::cmd::SharedBuffer;
use crate::communicator::ssh::scp::Excludes;

/// cmd.exe rejects command lines longer than 8191 characters.
const MAX_COMMAND_LINE: usize = 8000;

pub struct CopyClient {
    client: WinRmClient,
    max_operations_per_shell: usize,
    shell: Option<Shell>,
    operations: usize,
}

impl CopyClient {
    pub fn new(client: WinRmClient, max_operations_per_shell: usize) -> Self {
        Self {
            client,
            max_operations_per_shell: max_operations_per_shell.max(1),
            shell: None,
            operations: 0,
        }
    }

    /// Runs `command` in the current shell, rotating shells once the
    /// per-shell operation budget is spent.
    async fn run(&mut self, command: &str) -> Result<(), WinRmError> {
        if self.operations >= self.max_operations_per_shell {
            self.close_shell().await;
        }
        let shell = match self.shell.take() {
            Some(shell) => shell,
            None => self.client.create_shell().await?,
        };
        self.operations += 1;

        let outcome = run_in(&shell, command).await;
        self.shell = Some(shell);
        outcome
    }

    async fn close_shell(&mut self) {
        self.operations = 0;
        if let Some(shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                debug!(error = %e, "failed to close copy shell");
            }
        }
    }

    /// Copies everything `input` yields to the remote file `dst`.
    pub async fn write(
        &mut self,
        dst: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), WinRmError> {
        let outcome = self.write_file(dst, input).await;
        self.close_shell().await;
        outcome
    }

    async fn write_file(
        &mut self,
        dst: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), WinRmError> {
        let temp = format!("%TEMP%\\winrmcp-{}.tmp", Uuid::new_v4());
        debug!(dst, temp = %temp, "copying file through temp file");

        let prefix = "echo ";
        let suffix = format!(" >> \"{temp}\"");
        let chunk_size = chunk_size(prefix.len() + suffix.len());

        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = read_full(input, &mut buf).await?;
            if n == 0 {
                break;
            }
            let line = format!("{prefix}{}{suffix}", STANDARD.encode(&buf[..n]));
            self.run(&line).await?;
            if n < buf.len() {
                break;
            }
        }

        self.run(&powershell(&restore_script(&temp, dst))).await
    }

    /// Copies the directory tree under `src` into `dst`.
    pub async fn copy_dir(
        &mut self,
        src: &Path,
        dst: &str,
        excludes: &Excludes,
    ) -> Result<(), WinRmError> {
        let outcome = self
            .copy_entries(src.to_path_buf(), dst.to_string(), String::new(), excludes)
            .await;
        self.close_shell().await;
        outcome
    }

    fn copy_entries<'a>(
        &'a mut self,
        dir: std::path::PathBuf,
        dst: String,
        rel: String,
        excludes: &'a Excludes,
    ) -> BoxFuture<'a, Result<(), WinRmError>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let name = entry.file_name().to_string_lossy().to_string();
                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                if excludes.matches(&child_rel) {
                    debug!(path = %child_rel, "excluded from copy");
                    continue;
                }

                let path = entry.path();
                let target = format!("{dst}\\{name}");
                let metadata = tokio::fs::metadata(&path).await?;
                if metadata.is_dir() {
                    self.copy_entries(path, target, child_rel, excludes).await?;
                } else {
                    info!(path = %target, "uploading file");
                    let mut file = tokio::fs::File::open(&path).await?;
                    self.write_file(&target, &mut file).await?;
                }
            }
            Ok(())
        })
    }
}

async fn run_in(shell: &Shell, command: &str) -> Result<(), WinRmError> {
    let remote = shell.execute(command).await?;
    let mut stdout = tokio::io::sink();
    let mut stderr = SharedBuffer::new();
    let status = remote.relay_output(&mut stdout, &mut stderr).await?;
    if status != 0 {
        return Err(WinRmError::CommandFailed {
            status,
            stderr: stderr.to_string_lossy(),
        });
    }
    Ok(())
}

/// Largest raw chunk whose base64 form fits on one command line next to
/// `overhead` characters. Always a multiple of 3 so every line decodes on
/// its own.
fn chunk_size(overhead: usize) -> usize {
    let encoded = MAX_COMMAND_LINE.saturating_sub(overhead);
    (encoded / 4 * 3).max(3)
}

async fn read_full(
    input: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn restore_script(temp: &str, dst: &str) -> String {
    let temp = temp.replace("%TEMP%", "$env:TEMP");
    let dst = dst.replace('\'', "''");
    format!(
        r#"$tmp_file_path = [System.IO.Path]::GetFullPath("{temp}")
$dest_file_path = [System.IO.Path]::GetFullPath('{dst}')
if (Test-Path $dest_file_path) {{
    if (Test-Path -Path $dest_file_path -PathType container) {{
        Exit 1
    }} else {{
        Remove-Item $dest_file_path -Force
    }}
}} else {{
    $dest_dir = [System.IO.Path]::GetDirectoryName($dest_file_path)
    New-Item -ItemType directory -Force -ErrorAction SilentlyContinue -Path $dest_dir | Out-Null
}}
if (Test-Path $tmp_file_path) {{
    $reader = [System.IO.File]::OpenText($tmp_file_path)
    $writer = [System.IO.File]::OpenWrite($dest_file_path)
    try {{
        for (;;) {{
            $base64_line = $reader.ReadLine()
            if ($base64_line -eq $null) {{ break }}
            $bytes = [System.Convert]::FromBase64String($base64_line)
            $writer.Write($bytes, 0, $bytes.Length)
        }}
    }} finally {{
        $reader.Close()
        $writer.Close()
    }}
    Remove-Item $tmp_file_path -Force -ErrorAction SilentlyContinue
}} else {{
    New-Item -ItemType File -Force -Path $dest_file_path | Out-Null
}}
"#
    )
}
