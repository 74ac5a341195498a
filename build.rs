use std::env;
use std::process::Command;

/// Short git hash of HEAD, if git is available and this is a checkout.
fn git_short_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        println!(
            "cargo:warning=Failed to get git hash: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }
    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

fn main() {
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let release = env::var("PROFILE").map(|p| p == "release").unwrap_or(false);
    let with_hash = release || env::var("BUILD_VERSION_WITH_HASH").is_ok();

    let version_string = if with_hash {
        match git_short_hash() {
            Some(hash) => format!("{} ({})", version, hash),
            None => version,
        }
    } else {
        format!("{} (dev)", version)
    };

    println!("cargo:rustc-env=GUESTCOMM_BUILD_VERSION={}", version_string);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/packed-refs");
    println!("cargo:rerun-if-changed=Cargo.toml");
}
