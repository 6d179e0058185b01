//! CLI tool for editing the relay settings file
//!
//! Every change goes through `Settings::save`, so an invalid allow-list entry
//! leaves the file untouched. The service picks up changes on restart.
//!
//! # Usage
//!
//! ```bash
//! # Show the current settings
//! relay-config show
//!
//! # Point the relay at a smart host using STARTTLS
//! relay-config smart-host smtp.example.com --port 587 --starttls
//!
//! # Set (or clear, with an empty user) the smart host credentials
//! relay-config credentials relay@example.com 's3cret'
//!
//! # Allow a subnet and a single host
//! relay-config allow 10.0.0.0/8 192.168.1.20
//!
//! # Keep trace files for 30 days
//! relay-config logging --enable --retention-days 30
//! ```

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use relay_rs::Settings;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "relay-config")]
#[command(about = "Manage smtp-relay settings", long_about = None)]
struct Cli {
    /// Settings file shared with smtp-relay
    #[arg(short, long, env = "SMTP_RELAY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current settings (password masked)
    Show,
    /// Set the smart host
    SmartHost {
        /// Host name or address of the upstream SMTP server
        host: String,
        /// Upstream port
        #[arg(short, long)]
        port: Option<u16>,
        /// Upgrade with STARTTLS when offered
        #[arg(long, conflicts_with = "no_starttls")]
        starttls: bool,
        /// Never use STARTTLS
        #[arg(long)]
        no_starttls: bool,
    },
    /// Set the smart host credentials (an empty user disables AUTH)
    Credentials {
        /// User name
        username: String,
        /// Password, kept unchanged when omitted
        password: Option<String>,
    },
    /// Add IP addresses or CIDR ranges to the allow-list
    Allow {
        /// Entries, separated by spaces, commas or semicolons
        #[arg(required_unless_present = "replace")]
        entries: Vec<String>,
        /// Replace the allow-list instead of extending it
        #[arg(long)]
        replace: bool,
    },
    /// Let any client relay, ignoring the allow-list
    AllowAll {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Configure the protocol trace
    Logging {
        /// Enable trace files
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Disable trace files
        #[arg(long)]
        disable: bool,
        /// Delete trace files older than this many days (0 keeps them forever)
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// Check the settings file without changing it
    Validate,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config.as_path();

    let mut settings = Settings::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    match cli.command {
        Commands::Show => {
            print_settings(path, &settings);
            return Ok(());
        }
        Commands::Validate => {
            match settings.validate() {
                Ok(()) => println!("✓ {} is valid", path.display()),
                Err(e) => {
                    eprintln!("✗ {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            }
            return Ok(());
        }
        Commands::SmartHost {
            host,
            port,
            starttls,
            no_starttls,
        } => {
            settings.smart_host = host.trim().to_string();
            if let Some(port) = port {
                settings.smart_host_port = port;
            }
            if starttls {
                settings.use_start_tls = true;
            } else if no_starttls {
                settings.use_start_tls = false;
            }
        }
        Commands::Credentials { username, password } => {
            settings.username = username.trim().to_string();
            if settings.username.is_empty() {
                settings.password.clear();
            } else if let Some(password) = password {
                settings.password = password;
            }
        }
        Commands::Allow { entries, replace } => {
            if replace {
                settings.allowed_ips = entries;
            } else {
                settings.allowed_ips.extend(entries);
            }
        }
        Commands::AllowAll { enabled } => {
            settings.allow_all_ips = enabled;
        }
        Commands::Logging {
            enable,
            disable,
            retention_days,
        } => {
            if enable {
                settings.enable_logging = true;
            } else if disable {
                settings.enable_logging = false;
            }
            if let Some(days) = retention_days {
                settings.retention_days = days;
            }
        }
    }

    if let Err(e) = settings.save(path) {
        eprintln!("Error: {}", e);
        eprintln!("{} was not modified", path.display());
        std::process::exit(1);
    }

    println!("✓ Saved {}", path.display());
    print_settings(path, &settings);
    println!("\nRestart smtp-relay to apply the changes.");
    Ok(())
}

fn print_settings(path: &Path, settings: &Settings) {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let or_unset = |value: &str| {
        if value.trim().is_empty() {
            "(not set)".to_string()
        } else {
            value.to_string()
        }
    };

    println!("Settings from {}\n", path.display());
    println!("{:<20} {}", "Smart host", or_unset(&settings.smart_host));
    println!("{:<20} {}", "Port", settings.smart_host_port);
    println!("{:<20} {}", "STARTTLS", yes_no(settings.use_start_tls));
    println!("{:<20} {}", "Username", or_unset(&settings.username));
    println!(
        "{:<20} {}",
        "Password",
        if settings.password.is_empty() { "(not set)" } else { "********" }
    );
    println!("{:<20} {}", "Allow all IPs", yes_no(settings.allow_all_ips));
    if settings.allowed_ips.is_empty() {
        println!("{:<20} (none)", "Allowed IPs");
    } else {
        println!("{:<20} {}", "Allowed IPs", settings.allowed_ips.join(", "));
    }
    println!("{:<20} {}", "Trace logging", yes_no(settings.enable_logging));
    println!("{:<20} {} day(s)", "Retention", settings.retention_days);
    println!("{:<20} {}", "Listen port", settings.listen_port);
}
