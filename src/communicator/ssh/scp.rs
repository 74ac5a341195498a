//! SCP over an exec channel running `scp -t` (sink) or `scp -f` (source).
//!
//! Every header line is answered with a single status byte: `0` for OK,
//! `1` or `2` followed by a message line for an error.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::session::{ProcessExit, RemoteProcess};
use super::SshCommunicator;
use crate::communicator::error::{CommunicatorError, Result};
use crate::communicator::types::{permission_bits, FileInfo};

#[derive(Debug, Error)]
pub enum ScpError {
    /// Error message sent by the remote scp.
    #[error("{0}")]
    Remote(String),

    #[error("empty response from server")]
    EmptyResponse,

    #[error("unexpected server response ({0:#04x})")]
    UnexpectedResponse(u8),

    #[error("can't parse server response ({0})")]
    MalformedHeader(String),

    #[error("negative file size")]
    NegativeSize,

    #[error("remote file is directory")]
    IsDirectory,

    #[error("Error reading error message: {0}")]
    ErrorMessage(io::Error),

    #[error("Error creating temporary file for upload: {0}")]
    TempFile(io::Error),

    #[error(
        "Error copying input data into local temporary file. Check that TEMPDIR has enough space: {0}"
    )]
    Buffering(io::Error),

    #[error("SCP failed to start. This usually means that SCP is not\nproperly installed on the remote system.")]
    NotInstalled,

    #[error("scp exited with status {status}: {stderr}")]
    ExitStatus { status: u32, stderr: String },

    #[error("short transfer: expected {expected} bytes, got {copied}")]
    ShortTransfer { expected: u64, copied: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ScpError {
    fn is_eof(&self) -> bool {
        matches!(self, ScpError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A `C` or `D` header line: `Cmmmm <size> <name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl EntryHeader {
    /// Parses a header line without its trailing newline. Names may contain
    /// spaces but never a path separator.
    pub fn parse(line: &str) -> std::result::Result<Self, ScpError> {
        let malformed = || ScpError::MalformedHeader(line.to_string());

        let kind = match line.as_bytes().first() {
            Some(b'C') => EntryKind::File,
            Some(b'D') => EntryKind::Directory,
            _ => return Err(malformed()),
        };
        let mut parts = line[1..].splitn(3, ' ');
        let mode = parts
            .next()
            .and_then(|m| u32::from_str_radix(m, 8).ok())
            .ok_or_else(malformed)?;
        let size: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        if size < 0 {
            return Err(ScpError::NegativeSize);
        }
        let name = parts
            .next()
            .filter(|n| !n.is_empty() && *n != "." && *n != ".." && !n.contains('/'))
            .ok_or_else(malformed)?;

        Ok(Self {
            kind,
            mode: mode & 0o7777,
            size: size as u64,
            name: name.to_string(),
        })
    }

    fn line(kind: EntryKind, mode: u32, size: u64, name: &str) -> String {
        let tag = match kind {
            EntryKind::File => 'C',
            EntryKind::Directory => 'D',
        };
        format!("{}{:04o} {} {}\n", tag, mode & 0o7777, size, name)
    }
}

/// Relative paths (or bare names) to leave out of a directory transfer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Excludes(Vec<String>);

impl Excludes {
    pub(crate) fn new(patterns: &[String]) -> Self {
        Self(
            patterns
                .iter()
                .map(|p| {
                    p.trim_start_matches("./")
                        .trim_end_matches('/')
                        .replace('\\', "/")
                })
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    /// True if `rel` (slash separated) or any of its ancestors is excluded,
    /// or its last component matches a bare-name pattern.
    pub(crate) fn matches(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.0.iter().any(|p| {
            rel == p || rel.starts_with(&format!("{}/", p)) || (!p.contains('/') && name == p)
        })
    }
}

pub(crate) fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Splits a remote path into its directory and final component.
pub(crate) fn split_remote_path(path: &str) -> (String, String) {
    let path = path.replace('\\', "/");
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (".".to_string(), path),
    }
}

fn escape_spaces(path: &str) -> String {
    path.replace(' ', "\\ ")
}

fn quote_remote(path: &str) -> String {
    if path.contains(' ') {
        format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

pub(crate) fn has_trailing_separator(path: &Path) -> bool {
    let s = path.as_os_str().to_string_lossy();
    s.ends_with('/') || (cfg!(windows) && s.ends_with('\\'))
}

/// Reads one status byte, turning an error code into its message.
pub(crate) async fn check_status<R>(r: &mut R) -> std::result::Result<(), ScpError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let code = r.read_u8().await?;
    if code != 0 {
        let mut message = Vec::new();
        r.read_until(b'\n', &mut message)
            .await
            .map_err(ScpError::ErrorMessage)?;
        let message = String::from_utf8_lossy(&message);
        return Err(ScpError::Remote(message.trim_end_matches(['\r', '\n']).to_string()));
    }
    Ok(())
}

async fn ack<W>(w: &mut W) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&[0]).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a protocol line without its newline. End of stream is reported as
/// `UnexpectedEof`.
async fn read_line<R>(r: &mut R) -> std::result::Result<String, ScpError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    if r.read_until(b'\n', &mut line).await? == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Sends one file to a sink. Without usable `info` the input is first
/// buffered to a temporary file to learn its length.
pub(crate) async fn upload_file<S, W, R>(
    name: &str,
    src: &mut S,
    w: &mut W,
    r: &mut R,
    info: Option<&FileInfo>,
) -> std::result::Result<(), ScpError>
where
    S: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
{
    if let Some(info) = info.filter(|i| i.is_regular) {
        return send_file(name, info.mode, info.size, src, w, r).await;
    }

    let tmp = tempfile::tempfile().map_err(ScpError::TempFile)?;
    let mut tmp = fs::File::from_std(tmp);
    debug!("Copying input data into temporary file so we can read the length");
    tokio::io::copy(src, &mut tmp)
        .await
        .map_err(ScpError::Buffering)?;
    tmp.flush().await.map_err(ScpError::Buffering)?;
    tmp.rewind().await.map_err(ScpError::Buffering)?;
    let size = tmp.metadata().await.map_err(ScpError::Buffering)?.len();

    send_file(name, 0o644, size, &mut tmp, w, r).await
}

async fn send_file<S, W, R>(
    name: &str,
    mode: u32,
    size: u64,
    src: &mut S,
    w: &mut W,
    r: &mut R,
) -> std::result::Result<(), ScpError>
where
    S: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
{
    debug!(name, mode = format!("{:04o}", mode), size, "scp uploading");
    w.write_all(EntryHeader::line(EntryKind::File, mode, size, name).as_bytes())
        .await?;
    w.flush().await?;
    check_status(r).await?;

    let copied = tokio::io::copy(&mut (&mut *src).take(size), w).await?;
    if copied != size {
        return Err(ScpError::ShortTransfer {
            expected: size,
            copied,
        });
    }
    w.write_all(&[0]).await?;
    w.flush().await?;
    check_status(r).await
}

async fn open_dir<W, R>(name: &str, mode: u32, w: &mut W, r: &mut R) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
{
    w.write_all(EntryHeader::line(EntryKind::Directory, mode, 0, name).as_bytes())
        .await?;
    w.flush().await?;
    check_status(r).await
}

async fn close_dir<W, R>(w: &mut W, r: &mut R) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
{
    w.write_all(b"E\n").await?;
    w.flush().await?;
    check_status(r).await
}

/// Sends `src` to a recursive sink. Without a trailing separator the
/// directory itself is sent; with one only its contents are.
pub(crate) async fn upload_tree<W, R>(
    src: &Path,
    excludes: &Excludes,
    w: &mut W,
    r: &mut R,
) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    if has_trailing_separator(src) {
        return upload_dir_entries(src, "", excludes, w, r).await;
    }

    debug!("No trailing slash, creating the source directory name");
    let metadata = fs::metadata(src).await?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ScpError::MalformedHeader(src.display().to_string()))?;
    open_dir(&name, permission_bits(&metadata), w, r).await?;
    upload_dir_entries(src, "", excludes, w, r).await?;
    close_dir(w, r).await
}

struct LocalEntry {
    name: String,
    path: PathBuf,
    metadata: std::fs::Metadata,
}

async fn read_sorted_entries(dir: &Path) -> io::Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    let mut reader = fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        entries.push(LocalEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            metadata: fs::symlink_metadata(entry.path()).await?,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn upload_dir_entries<'a, W, R>(
    root: &'a Path,
    rel: &'a str,
    excludes: &'a Excludes,
    w: &'a mut W,
    r: &'a mut R,
) -> BoxFuture<'a, std::result::Result<(), ScpError>>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    Box::pin(async move {
        for entry in read_sorted_entries(root).await? {
            let entry_rel = join_rel(rel, &entry.name);
            if excludes.matches(&entry_rel) {
                debug!(path = %entry_rel, "excluded from upload");
                continue;
            }

            // Symlinks are followed for both files and directories.
            let metadata = if entry.metadata.file_type().is_symlink() {
                fs::metadata(&entry.path).await?
            } else {
                entry.metadata
            };

            if !metadata.is_dir() {
                let mut file = fs::File::open(&entry.path).await?;
                let info = FileInfo::from_metadata(&entry.name, &metadata);
                upload_file(&entry.name, &mut file, w, r, Some(&info)).await?;
                continue;
            }

            open_dir(&entry.name, permission_bits(&metadata), w, r).await?;
            upload_dir_entries(&entry.path, &entry_rel, excludes, &mut *w, &mut *r).await?;
            close_dir(w, r).await?;
        }
        Ok(())
    })
}

/// Receives a single file from `scp -f`.
pub(crate) async fn download_file<W, R, O>(
    w: &mut W,
    r: &mut R,
    output: &mut O,
) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
{
    ack(w).await?;

    let line = read_line(r).await?;
    match line.as_bytes().first() {
        None => return Err(ScpError::EmptyResponse),
        Some(1 | 2) => return Err(ScpError::Remote(line[1..].to_string())),
        Some(b'C') => {}
        Some(b'D') => return Err(ScpError::IsDirectory),
        Some(&other) => return Err(ScpError::UnexpectedResponse(other)),
    }
    let header = EntryHeader::parse(&line)?;
    debug!(name = %header.name, size = header.size, "scp downloading");

    ack(w).await?;
    let copied = tokio::io::copy(&mut (&mut *r).take(header.size), output).await?;
    if copied != header.size {
        return Err(ScpError::ShortTransfer {
            expected: header.size,
            copied,
        });
    }
    output.flush().await?;

    ack(w).await?;
    check_status(r).await
}

struct Level {
    /// `None` while inside an excluded directory.
    local: Option<PathBuf>,
    rel: String,
}

/// Receives a tree from `scp -rf` into `dst`.
pub(crate) async fn download_tree<W, R>(
    w: &mut W,
    r: &mut R,
    dst: &Path,
    excludes: &Excludes,
) -> std::result::Result<(), ScpError>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut stack = vec![Level {
        local: Some(dst.to_path_buf()),
        rel: String::new(),
    }];

    loop {
        ack(w).await?;
        let line = match read_line(r).await {
            Ok(line) => line,
            Err(e) if e.is_eof() && stack.len() == 1 => return Ok(()),
            Err(e) => return Err(e),
        };

        let header = match line.as_bytes().first() {
            None => return Err(ScpError::EmptyResponse),
            Some(1 | 2) => return Err(ScpError::Remote(line[1..].to_string())),
            Some(b'E') => {
                stack.pop();
                if stack.is_empty() {
                    ack(w).await?;
                    return Ok(());
                }
                continue;
            }
            Some(b'C' | b'D') => EntryHeader::parse(&line)?,
            Some(&other) => return Err(ScpError::UnexpectedResponse(other)),
        };

        let Some(parent) = stack.last() else {
            return Err(ScpError::UnexpectedResponse(line.as_bytes()[0]));
        };
        let rel = join_rel(&parent.rel, &header.name);
        let local = match &parent.local {
            Some(dir) if !excludes.matches(&rel) => Some(dir.join(&header.name)),
            _ => None,
        };

        match header.kind {
            EntryKind::Directory => {
                match &local {
                    Some(path) => {
                        fs::create_dir_all(path).await?;
                        set_mode(path, header.mode).await?;
                    }
                    None => debug!(path = %rel, "skipping excluded directory"),
                }
                stack.push(Level { local, rel });
            }
            EntryKind::File => {
                ack(w).await?;
                match &local {
                    Some(path) => receive_file(r, path, header.size, header.mode).await?,
                    None => {
                        debug!(path = %rel, "skipping excluded file");
                        tokio::io::copy(&mut (&mut *r).take(header.size), &mut tokio::io::sink()).await?;
                    }
                }
                check_status(r).await?;
            }
        }
    }
}

async fn receive_file<R>(
    r: &mut R,
    path: &Path,
    size: u64,
    mode: u32,
) -> std::result::Result<(), ScpError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    let mut file = options.open(path).await?;

    let copied = tokio::io::copy(&mut (&mut *r).take(size), &mut file).await?;
    if copied != size {
        return Err(ScpError::ShortTransfer {
            expected: size,
            copied,
        });
    }
    file.flush().await?;
    set_mode(path, mode).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl SshCommunicator {
    async fn scp_process(&self, command: &str) -> Result<RemoteProcess> {
        let (channel, _) = self.new_session().await?;
        debug!(command, "starting remote scp process");
        RemoteProcess::spawn(channel, command).await
    }

    pub(super) async fn scp_upload(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        info: Option<&FileInfo>,
    ) -> Result<()> {
        let (target_dir, target_file) = split_remote_path(path);
        let mut process = self
            .scp_process(&format!("scp -vt {}", escape_spaces(&target_dir)))
            .await?;
        let outcome = async {
            check_status(&mut process.stdout).await?;
            upload_file(&target_file, input, &mut process.stdin, &mut process.stdout, info).await
        }
        .await;
        complete(process, outcome).await
    }

    pub(super) async fn scp_upload_dir(&self, dst: &str, src: &Path, excludes: &[String]) -> Result<()> {
        let excludes = Excludes::new(excludes);
        let mut process = self
            .scp_process(&format!("scp -rvt {}", escape_spaces(dst)))
            .await?;
        let outcome = async {
            check_status(&mut process.stdout).await?;
            upload_tree(src, &excludes, &mut process.stdin, &mut process.stdout).await
        }
        .await;
        complete(process, outcome).await
    }

    pub(super) async fn scp_download(
        &self,
        path: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let mut process = self
            .scp_process(&format!("scp -vf {}", quote_remote(path)))
            .await?;
        let outcome = download_file(&mut process.stdin, &mut process.stdout, output).await;
        complete(process, outcome).await
    }

    pub(super) async fn scp_download_dir(&self, src: &str, dst: &Path, excludes: &[String]) -> Result<()> {
        let excludes = Excludes::new(excludes);
        fs::create_dir_all(dst).await?;
        let mut process = self
            .scp_process(&format!("scp -vrf {}", quote_remote(src)))
            .await?;
        let outcome = download_tree(&mut process.stdin, &mut process.stdout, dst, &excludes).await;
        complete(process, outcome).await
    }
}

/// Finishes an scp exchange: a protocol error wins, otherwise the remote
/// exit status decides.
async fn complete(process: RemoteProcess, outcome: std::result::Result<(), ScpError>) -> Result<()> {
    if let Err(e) = outcome {
        if !e.is_eof() {
            process.abort();
            return Err(e.into());
        }
        debug!("scp stream ended early, checking exit status");
    }

    let ProcessExit { exit, stderr } = process.finish().await?;
    let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
    if !stderr.is_empty() {
        debug!(%stderr, "scp stderr");
    }

    match (exit.status, exit.signal) {
        (_, Some((signal, message))) => Err(CommunicatorError::ExitSignal { signal, message }),
        (Some(0), None) => Ok(()),
        (Some(127), None) => Err(ScpError::NotInstalled.into()),
        (Some(status), None) => Err(ScpError::ExitStatus { status, stderr }.into()),
        (None, None) => Err(CommunicatorError::ExitMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

    #[derive(Debug, Clone, PartialEq)]
    enum Node {
        File { mode: u32, data: Vec<u8> },
        Dir { mode: u32 },
    }

    type Tree = BTreeMap<String, Node>;

    type ClientEnd = (WriteHalf<DuplexStream>, BufReader<ReadHalf<DuplexStream>>);

    fn wire() -> (ClientEnd, DuplexStream) {
        let (client, peer) = tokio::io::duplex(1 << 16);
        let (r, w) = tokio::io::split(client);
        ((w, BufReader::new(r)), peer)
    }

    /// Behaves like `scp -t`: acknowledges everything and records it.
    async fn run_sink(peer: DuplexStream, reject: Option<&'static str>) -> io::Result<Tree> {
        let (r, mut w) = tokio::io::split(peer);
        let mut r = BufReader::new(r);
        let mut tree = Tree::new();
        let mut dirs: Vec<String> = Vec::new();

        w.write_all(&[0]).await?;
        loop {
            let mut line = String::new();
            if r.read_line(&mut line).await? == 0 {
                return Ok(tree);
            }
            let line = line.trim_end_matches('\n');
            if line == "E" {
                dirs.pop();
                w.write_all(&[0]).await?;
                continue;
            }
            if let Some(message) = reject {
                w.write_all(format!("\x01{message}\n").as_bytes()).await?;
                return Ok(tree);
            }

            let header = EntryHeader::parse(line).expect("valid header");
            let path = dirs
                .iter()
                .cloned()
                .chain(std::iter::once(header.name.clone()))
                .collect::<Vec<_>>()
                .join("/");
            match header.kind {
                EntryKind::Directory => {
                    tree.insert(path, Node::Dir { mode: header.mode });
                    dirs.push(header.name);
                    w.write_all(&[0]).await?;
                }
                EntryKind::File => {
                    w.write_all(&[0]).await?;
                    let mut data = vec![0u8; header.size as usize];
                    r.read_exact(&mut data).await?;
                    assert_eq!(r.read_u8().await?, 0, "file data ends with NUL");
                    tree.insert(path, Node::File { mode: header.mode, data });
                    w.write_all(&[0]).await?;
                }
            }
        }
    }

    /// Behaves like `scp -f <root>` serving `tree`.
    async fn run_source(peer: DuplexStream, tree: Tree, root: &'static str) -> io::Result<()> {
        let (r, mut w) = tokio::io::split(peer);
        let mut r = BufReader::new(r);
        assert_eq!(r.read_u8().await?, 0);
        if !tree.contains_key(root) {
            w.write_all(format!("\x01scp: {root}: No such file or directory\n").as_bytes())
                .await?;
            return Ok(());
        }
        send_node(&mut w, &mut r, &tree, root).await
    }

    fn send_node<'a>(
        w: &'a mut WriteHalf<DuplexStream>,
        r: &'a mut BufReader<ReadHalf<DuplexStream>>,
        tree: &'a Tree,
        path: &'a str,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let name = path.rsplit('/').next().unwrap();
            match &tree[path] {
                Node::File { mode, data } => {
                    w.write_all(EntryHeader::line(EntryKind::File, *mode, data.len() as u64, name).as_bytes())
                        .await?;
                    assert_eq!(r.read_u8().await?, 0);
                    w.write_all(data).await?;
                    w.write_all(&[0]).await?;
                    assert_eq!(r.read_u8().await?, 0);
                }
                Node::Dir { mode } => {
                    w.write_all(EntryHeader::line(EntryKind::Directory, *mode, 0, name).as_bytes())
                        .await?;
                    assert_eq!(r.read_u8().await?, 0);
                    let prefix = format!("{path}/");
                    let children: Vec<&String> = tree
                        .keys()
                        .filter(|k| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
                        .collect();
                    for child in children {
                        send_node(&mut *w, &mut *r, tree, child).await?;
                    }
                    w.write_all(b"E\n").await?;
                    assert_eq!(r.read_u8().await?, 0);
                }
            }
            Ok(())
        })
    }

    fn file(mode: u32, data: &[u8]) -> Node {
        Node::File {
            mode,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_parse_header() {
        let header = EntryHeader::parse("C0644 12 file name.txt").unwrap();
        assert_eq!(
            header,
            EntryHeader {
                kind: EntryKind::File,
                mode: 0o644,
                size: 12,
                name: "file name.txt".to_string(),
            }
        );
        assert_eq!(
            EntryHeader::parse("D0755 0 logs").unwrap().kind,
            EntryKind::Directory
        );
        assert!(matches!(
            EntryHeader::parse("C0644 -1 x"),
            Err(ScpError::NegativeSize)
        ));
        assert!(matches!(
            EntryHeader::parse("C0644 abc x"),
            Err(ScpError::MalformedHeader(_))
        ));
        assert!(matches!(
            EntryHeader::parse("D0755 0 ../escape"),
            Err(ScpError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_split_remote_path() {
        assert_eq!(
            split_remote_path("/tmp/dir with space/f.txt"),
            ("/tmp/dir with space".to_string(), "f.txt".to_string())
        );
        assert_eq!(split_remote_path("/f"), ("/".to_string(), "f".to_string()));
        assert_eq!(split_remote_path("f"), (".".to_string(), "f".to_string()));
        assert_eq!(escape_spaces("/tmp/a b"), "/tmp/a\\ b");
        assert_eq!(quote_remote("/tmp/a b"), "\"/tmp/a b\"");
        assert_eq!(quote_remote("/tmp/ab"), "/tmp/ab");
    }

    #[test]
    fn test_excludes() {
        let excludes = Excludes::new(&["./build/".to_string(), "*.tmp".to_string(), ".git".to_string()]);
        assert!(excludes.matches("build"));
        assert!(excludes.matches("build/out.o"));
        assert!(excludes.matches("src/.git"));
        assert!(!excludes.matches("builder"));
        assert!(!excludes.matches("src/main.rs"));
    }

    #[tokio::test]
    async fn test_upload_file_with_known_size() {
        let ((mut w, mut r), peer) = wire();
        let sink = tokio::spawn(run_sink(peer, None));

        check_status(&mut r).await.unwrap();
        let info = FileInfo::regular("hello.txt", 5, 0o600);
        upload_file("hello.txt", &mut &b"hello"[..], &mut w, &mut r, Some(&info))
            .await
            .unwrap();
        drop((w, r));

        let tree = sink.await.unwrap().unwrap();
        assert_eq!(tree["hello.txt"], file(0o600, b"hello"));
    }

    #[tokio::test]
    async fn test_upload_streamed_input_is_buffered() {
        let ((mut w, mut r), peer) = wire();
        let sink = tokio::spawn(run_sink(peer, None));

        check_status(&mut r).await.unwrap();
        upload_file("notes", &mut &b"some streamed bytes"[..], &mut w, &mut r, None)
            .await
            .unwrap();
        drop((w, r));

        let tree = sink.await.unwrap().unwrap();
        assert_eq!(tree["notes"], file(0o644, b"some streamed bytes"));
    }

    #[tokio::test]
    async fn test_upload_rejected_by_remote() {
        let ((mut w, mut r), peer) = wire();
        let sink = tokio::spawn(run_sink(peer, Some("scp: /root/x: Permission denied")));

        check_status(&mut r).await.unwrap();
        let err = upload_file("x", &mut &b"data"[..], &mut w, &mut r, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "scp: /root/x: Permission denied");
        drop((w, r));
        sink.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_file() {
        let tree = Tree::from([("hello.txt".to_string(), file(0o644, b"hello"))]);
        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree, "hello.txt"));

        let mut output = Vec::new();
        download_file(&mut w, &mut r, &mut output).await.unwrap();
        assert_eq!(output, b"hello");
        drop((w, r));
        source.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_empty_file() {
        let tree = Tree::from([("empty".to_string(), file(0o600, b""))]);
        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree, "empty"));

        let mut output = Vec::new();
        download_file(&mut w, &mut r, &mut output).await.unwrap();
        assert!(output.is_empty());
        drop((w, r));
        source.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_file_errors() {
        let tree = Tree::from([("dir".to_string(), Node::Dir { mode: 0o755 })]);

        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree.clone(), "dir"));
        let err = download_file(&mut w, &mut r, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "remote file is directory");
        drop((w, r));
        let _ = source.await.unwrap();

        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree, "missing"));
        let err = download_file(&mut w, &mut r, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "scp: missing: No such file or directory");
        drop((w, r));
        source.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        let local = TempDir::new().unwrap();
        let src = local.path().join("site");
        std::fs::create_dir_all(src.join("assets/img")).unwrap();
        std::fs::write(src.join("index.html"), b"<h1>hi</h1>").unwrap();
        std::fs::write(src.join("assets/app.js"), b"run()").unwrap();
        std::fs::write(src.join("assets/img/logo.svg"), b"<svg/>").unwrap();
        std::fs::write(src.join("debug.log"), b"noise").unwrap();
        let excludes = Excludes::new(&["debug.log".to_string()]);

        // Upload without a trailing slash creates "site" remotely.
        let ((mut w, mut r), peer) = wire();
        let sink = tokio::spawn(run_sink(peer, None));
        check_status(&mut r).await.unwrap();
        upload_tree(&src, &excludes, &mut w, &mut r).await.unwrap();
        drop((w, r));
        let tree = sink.await.unwrap().unwrap();

        let mut paths: Vec<&str> = tree.keys().map(String::as_str).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "site",
                "site/assets",
                "site/assets/app.js",
                "site/assets/img",
                "site/assets/img/logo.svg",
                "site/index.html",
            ]
        );

        // And back again into a fresh directory.
        let dst = TempDir::new().unwrap();
        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree, "site"));
        download_tree(&mut w, &mut r, dst.path(), &Excludes::default())
            .await
            .unwrap();
        drop((w, r));
        source.await.unwrap().unwrap();

        let root = dst.path().join("site");
        assert_eq!(std::fs::read(root.join("index.html")).unwrap(), b"<h1>hi</h1>");
        assert_eq!(std::fs::read(root.join("assets/app.js")).unwrap(), b"run()");
        assert_eq!(std::fs::read(root.join("assets/img/logo.svg")).unwrap(), b"<svg/>");
        assert!(!root.join("debug.log").exists());
    }

    #[tokio::test]
    async fn test_upload_contents_only_with_trailing_slash() {
        let local = TempDir::new().unwrap();
        std::fs::write(local.path().join("a.txt"), b"a").unwrap();
        let src = PathBuf::from(format!("{}/", local.path().display()));

        let ((mut w, mut r), peer) = wire();
        let sink = tokio::spawn(run_sink(peer, None));
        check_status(&mut r).await.unwrap();
        upload_tree(&src, &Excludes::default(), &mut w, &mut r)
            .await
            .unwrap();
        drop((w, r));

        let tree = sink.await.unwrap().unwrap();
        assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_download_tree_skips_excluded_entries() {
        let tree = Tree::from([
            ("proj".to_string(), Node::Dir { mode: 0o755 }),
            ("proj/keep.txt".to_string(), file(0o644, b"keep")),
            ("proj/target".to_string(), Node::Dir { mode: 0o755 }),
            ("proj/target/big.bin".to_string(), file(0o644, &[7u8; 4096])),
        ]);
        let dst = TempDir::new().unwrap();
        let ((mut w, mut r), peer) = wire();
        let source = tokio::spawn(run_source(peer, tree, "proj"));
        download_tree(
            &mut w,
            &mut r,
            dst.path(),
            &Excludes::new(&["proj/target".to_string()]),
        )
        .await
        .unwrap();
        drop((w, r));
        source.await.unwrap().unwrap();

        assert_eq!(std::fs::read(dst.path().join("proj/keep.txt")).unwrap(), b"keep");
        assert!(!dst.path().join("proj/target").exists());
    }
}
