use super::{exec, profiles, ready, transfer};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

const VERSION_INFO: &str = env!("GUESTCOMM_BUILD_VERSION");

#[derive(Parser, Debug)]
#[command(name = "guestcomm")]
#[command(about = "Run commands on and copy files to guest machines over SSH or WinRM", long_about = None, version = VERSION_INFO)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Profiles file (defaults to <config dir>/guestcomm/profiles.yaml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// SSH private key path (auto-detects ~/.ssh/id_ed25519 or ~/.ssh/id_rsa if not specified)
    #[arg(short = 'i', long = "identity", global = true)]
    pub identity_file: Option<PathBuf>,

    /// Password for SSH or WinRM authentication
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Transfer files over SFTP instead of SCP
    #[arg(long, global = true)]
    pub sftp: bool,

    /// Request a pseudo-terminal for remote commands
    #[arg(long, global = true)]
    pub pty: bool,

    /// Seconds to keep retrying the initial connection
    #[arg(long, default_value_t = 60, global = true)]
    pub connect_timeout: u64,

    /// Increase message verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable interactive progress spinners
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command remotely and stream its output
    Exec(exec::Exec),

    /// Upload a file ("-" reads stdin)
    Upload(transfer::Upload),

    /// Upload a directory tree
    UploadDir(transfer::UploadDir),

    /// Download a file ("-" writes to stdout)
    Download(transfer::Download),

    /// Download a directory tree
    DownloadDir(transfer::DownloadDir),

    /// Wait until a target accepts connections
    Ready(ready::Ready),

    /// List configured profiles
    Profiles(profiles::ListProfiles),
}
