use super::common::{connect, disconnect};
use super::error::CliError;
use super::parser::Cli;
use super::ui;
use crate::communicator::{Communicator, FileInfo};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

/// Runs `op` against a connected communicator and always disconnects.
async fn with_connection<F>(cli_args: &Cli, target: &str, op: F) -> Result<(), CliError>
where
    F: for<'a> FnOnce(
        &'a dyn Communicator,
    ) -> futures::future::BoxFuture<'a, Result<(), CliError>>,
{
    let comm = connect(cli_args, target).await?;
    let outcome = op(comm.as_ref()).await;
    disconnect(comm.as_ref()).await;
    outcome
}

#[derive(Debug, Args)]
pub struct Upload {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Local file, or "-" for stdin
    src: PathBuf,

    /// Remote destination path
    dst: String,
}

impl Upload {
    #[instrument(name = "upload", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let src = self.src.clone();
        let dst = self.dst.clone();
        with_connection(cli_args, &self.target, move |comm| {
            Box::pin(async move {
                if src == Path::new("-") {
                    let mut stdin = tokio::io::stdin();
                    comm.upload(&dst, &mut stdin, None).await?;
                } else {
                    let mut file = tokio::fs::File::open(&src)
                        .await
                        .with_context(|| format!("Failed to open {}", src.display()))?;
                    let metadata = file
                        .metadata()
                        .await
                        .with_context(|| format!("Failed to stat {}", src.display()))?;
                    let name = src
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let info = FileInfo::from_metadata(name, &metadata);
                    comm.upload(&dst, &mut file, Some(&info)).await?;
                }
                info!(
                    "{}",
                    ui::format_success(&format!("Uploaded {} to {}", src.display(), dst))
                );
                Ok(())
            })
        })
        .await
    }
}

#[derive(Debug, Args)]
pub struct UploadDir {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Local directory; with a trailing slash only its contents are copied
    src: PathBuf,

    /// Remote destination directory
    dst: String,

    /// Relative path or name to skip (repeatable)
    #[arg(short = 'x', long = "exclude")]
    excludes: Vec<String>,
}

impl UploadDir {
    #[instrument(name = "upload-dir", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        if !self.src.is_dir() {
            return Err(CliError::ConfigError(format!(
                "{} is not a directory",
                self.src.display()
            )));
        }
        let (src, dst, excludes) = (self.src.clone(), self.dst.clone(), self.excludes.clone());
        with_connection(cli_args, &self.target, move |comm| {
            Box::pin(async move {
                comm.upload_dir(&dst, &src, &excludes).await?;
                info!(
                    "{}",
                    ui::format_success(&format!("Uploaded {} to {}", src.display(), dst))
                );
                Ok(())
            })
        })
        .await
    }
}

#[derive(Debug, Args)]
pub struct Download {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Remote file
    src: String,

    /// Local destination file, or "-" for stdout
    dst: PathBuf,
}

impl Download {
    #[instrument(name = "download", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let (src, dst) = (self.src.clone(), self.dst.clone());
        with_connection(cli_args, &self.target, move |comm| {
            Box::pin(async move {
                if dst == Path::new("-") {
                    let mut stdout = tokio::io::stdout();
                    comm.download(&src, &mut stdout).await?;
                    stdout.flush().await.context("Failed to flush stdout")?;
                } else {
                    let mut file = tokio::fs::File::create(&dst)
                        .await
                        .with_context(|| format!("Failed to create {}", dst.display()))?;
                    comm.download(&src, &mut file).await?;
                    file.flush()
                        .await
                        .with_context(|| format!("Failed to write {}", dst.display()))?;
                    info!(
                        "{}",
                        ui::format_success(&format!("Downloaded {} to {}", src, dst.display()))
                    );
                }
                Ok(())
            })
        })
        .await
    }
}

#[derive(Debug, Args)]
pub struct DownloadDir {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Remote directory
    src: String,

    /// Local destination directory
    dst: PathBuf,

    /// Relative path or name to skip (repeatable)
    #[arg(short = 'x', long = "exclude")]
    excludes: Vec<String>,
}

impl DownloadDir {
    #[instrument(name = "download-dir", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let (src, dst, excludes) = (self.src.clone(), self.dst.clone(), self.excludes.clone());
        with_connection(cli_args, &self.target, move |comm| {
            Box::pin(async move {
                comm.download_dir(&src, &dst, &excludes).await?;
                info!(
                    "{}",
                    ui::format_success(&format!("Downloaded {} to {}", src, dst.display()))
                );
                Ok(())
            })
        })
        .await
    }
}
