use std::path::Path;

use futures::future::BoxFuture;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use super::scp::{has_trailing_separator, join_rel, Excludes};
use super::SshCommunicator;
use crate::communicator::error::{CommunicatorError, Result};
use crate::communicator::types::{permission_bits, FileInfo};

/// Joins remote path components with forward slashes.
fn remote_join(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl SshCommunicator {
    async fn sftp_session(&self) -> Result<SftpSession> {
        let (channel, _) = self.new_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
            error!(error = %e, "failed to start sftp subsystem");
            e
        })?;
        Ok(sftp)
    }

    pub(super) async fn sftp_upload(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        info: Option<&FileInfo>,
    ) -> Result<()> {
        let sftp = self.sftp_session().await?;
        let outcome = upload_file(&sftp, path, input, info).await;
        let _ = sftp.close().await;
        outcome
    }

    pub(super) async fn sftp_upload_dir(&self, dst: &str, src: &Path, excludes: &[String]) -> Result<()> {
        let excludes = Excludes::new(excludes);
        let root = if has_trailing_separator(src) {
            dst.to_string()
        } else {
            remote_join(dst, &base_name(src))
        };
        debug!(src = %src.display(), dst = %root, "sftp uploading directory");

        let sftp = self.sftp_session().await?;
        let outcome = async {
            if root != dst {
                let metadata = fs::metadata(src).await?;
                mkdir(&sftp, &root, permission_bits(&metadata)).await?;
            }
            upload_entries(&sftp, src, &root, "", &excludes).await
        }
        .await;
        let _ = sftp.close().await;
        outcome
    }

    pub(super) async fn sftp_download(
        &self,
        path: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let sftp = self.sftp_session().await?;
        let outcome = async {
            debug!(path, "sftp downloading");
            let mut file = sftp.open(path).await?;
            tokio::io::copy(&mut file, output).await?;
            output.flush().await?;
            Ok::<(), CommunicatorError>(())
        }
        .await;
        let _ = sftp.close().await;
        outcome
    }
}

async fn upload_file(
    sftp: &SftpSession,
    path: &str,
    input: &mut (dyn AsyncRead + Send + Unpin),
    info: Option<&FileInfo>,
) -> Result<()> {
    debug!(path, "sftp uploading");
    let mut file = sftp.create(path).await?;
    tokio::io::copy(input, &mut file).await?;
    file.flush().await?;
    file.shutdown().await?;

    if let Some(info) = info.filter(|i| i.is_regular) {
        chmod(sftp, path, info.mode).await?;
    }
    Ok(())
}

async fn chmod(sftp: &SftpSession, path: &str, mode: u32) -> Result<()> {
    let mut attrs = FileAttributes::empty();
    attrs.permissions = Some(mode);
    sftp.set_metadata(path, attrs).await?;
    Ok(())
}

/// Creates `path`, tolerating an existing directory.
async fn mkdir(sftp: &SftpSession, path: &str, mode: u32) -> Result<()> {
    if let Err(e) = sftp.create_dir(path).await {
        match sftp.symlink_metadata(path).await {
            Ok(existing) if existing.is_dir() => {}
            _ => return Err(e.into()),
        }
    }
    chmod(sftp, path, mode).await
}

fn upload_entries<'a>(
    sftp: &'a SftpSession,
    dir: &'a Path,
    remote_dir: &'a str,
    rel: &'a str,
    excludes: &'a Excludes,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut names = Vec::new();
        let mut reader = fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for name in names {
            let entry_rel = join_rel(rel, &name);
            if excludes.matches(&entry_rel) {
                debug!(path = %entry_rel, "excluded from upload");
                continue;
            }
            let local = dir.join(&name);
            let remote = remote_join(remote_dir, &name);
            let metadata = fs::metadata(&local).await?;

            if metadata.is_dir() {
                mkdir(sftp, &remote, permission_bits(&metadata)).await?;
                upload_entries(sftp, &local, &remote, &entry_rel, excludes).await?;
            } else {
                let mut file = fs::File::open(&local).await?;
                let info = FileInfo::from_metadata(&name, &metadata);
                upload_file(sftp, &remote, &mut file, Some(&info)).await?;
            }
        }
        Ok(())
    })
}
