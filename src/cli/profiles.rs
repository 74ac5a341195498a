use super::error::CliError;
use super::parser::Cli;
use super::ui;
use crate::config::{Profile, Profiles};
use clap::Args;
use colored::Colorize;
use tabled::{
    settings::{object::Rows, Color, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Args)]
pub struct ListProfiles {}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Via")]
    via: String,
}

fn via(profile: &Profile) -> String {
    if let Some(bastion) = &profile.bastion {
        format!("bastion {}", bastion.host)
    } else if let Some(proxy) = &profile.proxy {
        format!("socks5 {}", proxy.address)
    } else {
        "direct".to_string()
    }
}

impl ListProfiles {
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let (path, profiles) = match &cli_args.config {
            Some(path) => (Some(path.clone()), Profiles::load(path).await?),
            None => (Profiles::default_path(), Profiles::load_default().await?),
        };
        let source = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no config directory)".to_string());

        println!(
            "\n{}: {}",
            ui::format_header("Profiles file"),
            ui::format_highlight(&source)
        );
        if profiles.is_empty() {
            println!("  {}", ui::format_warning("(No profiles defined)"));
            return Ok(());
        }

        let rows: Vec<_> = profiles
            .iter()
            .map(|(name, profile)| ProfileRow {
                name: ui::format_highlight(name),
                kind: profile.kind.to_string(),
                address: format!("{}:{}", profile.host, profile.port()),
                user: profile.user().to_string(),
                via: via(profile),
            })
            .collect();

        let mut table = Table::new(rows);
        table
            .with(Style::blank())
            .with(Modify::new(Rows::first()).with(Color::FG_GREEN))
            .with(
                Modify::new(Rows::first())
                    .with(tabled::settings::Format::content(|s| s.bold().to_string())),
            );
        println!("{}", table);
        Ok(())
    }
}
