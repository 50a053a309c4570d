use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use futures_lite::FutureExt;
use gh::{Channel, Channels};
use installer::{Installer, State, Status, Unwritable};
use owo_colors::OwoColorize;
use platform::Platform;
use std::path::PathBuf;
use std::{io::Write, time::Duration};

mod auth;
mod config;
mod extract;
mod gh;
mod installer;
mod platform;
mod socket;
mod tarball;
mod transfer;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Passphrase matching the one in preinstall.toml.
    #[arg(long, env = "PREINSTALL_PASSPHRASE", global = true, hide_env_values = true)]
    passphrase: Option<String>,
    /// Directory to download and extract into, defaults to the configured one.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completion.
    Completion { shell: Shell },
    /// Show server capabilities and installation progress.
    Status,
    /// Download the application archive.
    Download {
        /// Transfer method id, see `status`.
        #[arg(long)]
        method: String,
        /// Release channel: official, stable, tag, master or dev.
        #[arg(long, default_value = "stable")]
        channel: String,
        /// Archive format: zip or tar.gz.
        #[arg(long, default_value = "zip")]
        extension: String,
    },
    /// Extract the downloaded archive.
    Extract {
        /// Extraction method id, see `status`.
        #[arg(long)]
        method: String,
    },
    /// Change permissions of a folder in the working directory.
    Chmod { folder: String, mode: String },
    /// Rename the extracted application folder.
    Rename { folder: String },
}

/// Print `message` and a spinner on the same line forever.
async fn progress<T>(message: &str) -> T {
    let spinners = ["⠖", "⠲", "⠴", "⠦"];
    let wait_duration = Duration::from_millis(100);

    for spinner in spinners.iter().cycle() {
        print!("\x1B[2K\r{message} {}", spinner.bright_black());
        let _ = std::io::stdout().flush();
        tokio::time::sleep(wait_duration).await;
    }

    std::future::pending().await
}

/// Channel table from the published releases, or the fallbacks if they cannot be fetched.
async fn load_channels(config: &config::Config, platform: &Platform) -> Channels {
    let repo = &config.toml.repo;
    let official_tag = &config.toml.official_release_tag;

    if !platform.allows_url_stream() {
        log::info!("url streams disabled, not checking for new releases");
        return Channels::new(repo, official_tag, Vec::new());
    }

    let token = std::env::var("GITHUB_TOKEN").ok();

    let releases = match gh::make_client(token) {
        Ok(client) => gh::releases(&client, repo).await,
        Err(err) => Err(err),
    };

    match releases {
        Ok(releases) => Channels::new(repo, official_tag, releases),
        Err(err) => {
            log::warn!("could not fetch releases of {repo}: {err:#}");
            Channels::new(repo, official_tag, Vec::new())
        }
    }
}

fn mark(supported: bool) -> String {
    if supported {
        "✔".bright_green().to_string()
    } else {
        "✘".bright_red().to_string()
    }
}

fn print_status(status: &Status) {
    let state = match &status.state {
        State::Extracted(_) => status.state.bright_green().bold().to_string(),
        _ => status.state.bold().to_string(),
    };

    println!("{state}");
    println!("\n{}", "Download methods".bright_blue().bold());

    for method in &status.transfer_methods {
        println!("  {} {:<10} {}", mark(method.supported), method.id, method.name);
    }

    println!("\n{}", "Extraction methods".bright_blue().bold());

    for method in &status.extraction_methods {
        let archive = if method.archive_exists {
            format!("({} present)", method.archive_name)
        } else {
            format!("(no {})", method.archive_name)
        };

        println!(
            "  {} {:<10} {} {}",
            mark(method.supported),
            method.id,
            method.name,
            archive.bright_black()
        );
    }

    let mut channels = vec![Channel::Official, Channel::Master, Channel::Dev];

    if status.show_stable_release {
        channels.insert(1, Channel::Stable);
    }

    if status.show_tag_release {
        channels.insert(1, Channel::Tag);
    }

    let channels = channels
        .iter()
        .map(Channel::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    println!("\n{}", "Releases".bright_blue().bold());
    println!("  stable {}", status.stable_tag);
    println!("  latest {}", status.release_candidate_tag);
    println!("  channels: {channels}");
}

fn print_success(message: &str) {
    let mut lines = message.lines();

    if let Some(first) = lines.next() {
        println!("{} {first}", "Done".bright_green().bold());
    }

    for line in lines {
        println!("{} {line}", "Warning".bright_yellow().bold());
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Status);

    if let Commands::Completion { shell } = command {
        let mut cmd = Cli::command();
        let cmd = &mut cmd;

        generate(
            shell,
            cmd,
            cmd.get_name().to_string(),
            &mut std::io::stdout(),
        );

        return Ok(());
    }

    let config = config::Config::new(cli.dir)?;
    auth::authenticate(config.toml.passphrase.as_deref(), cli.passphrase.as_deref())?;

    let platform = Platform::new(&config);

    let channels = match command {
        Commands::Status | Commands::Download { .. } => load_channels(&config, &platform).await,
        _ => Channels::new(&config.toml.repo, &config.toml.official_release_tag, Vec::new()),
    };

    let installer = Installer::new(config, platform, channels);
    installer.ensure_writable()?;

    match command {
        Commands::Completion { .. } => {}
        Commands::Status => print_status(&installer.status()),
        Commands::Download {
            method,
            channel,
            extension,
        } => {
            let start = std::time::Instant::now();
            let message = format!("{} ...", "Downloading".bright_green().bold());
            let result = installer
                .perform_transfer(&method, &channel, &extension)
                .or(progress(&message))
                .await;
            println!("\x1B[2K\r{message} took {:?}", start.elapsed());
            print_success(&result?);
        }
        Commands::Extract { method } => print_success(&installer.perform_extraction(&method)?),
        Commands::Chmod { folder, mode } => print_success(&installer.chmod(&folder, &mode)?),
        Commands::Rename { folder } => print_success(&installer.rename(&folder)?),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(err) = try_main().await {
        eprintln!("{}: {err:#}", "Error".bright_red().bold());

        if let Some(unwritable) = err.downcast_ref::<Unwritable>() {
            eprintln!("{}: {}", "Fix".bright_yellow().bold(), unwritable.fix());
        }

        std::process::exit(1);
    }
}
