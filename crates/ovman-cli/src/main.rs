//! ovman - interactive OpenVPN connection menu
//!
//! Peripheral glue around [`ovman_session::SessionManager`]: renders the
//! profile menu, prompts for credentials, and relays detach/terminate
//! choices. All session semantics live in the library.

use anyhow::{Result, bail};
use clap::Parser;
use colored::Colorize;
use ovman_session::{
    CredentialInput, Profile, Secret, SessionManager, SessionMode, Settings, running_as_root,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "ovman", about = "Manage OpenVPN connections from a menu")]
struct Args {
    /// Settings file (default: $OVMAN_CONFIG or ~/.config/ovman/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run sessions in debug mode (streamed output, higher verbosity)
    #[arg(long)]
    debug: bool,

    /// Start this profile directly instead of showing the menu
    #[arg(long)]
    profile: Option<String>,
}

/// What the menu loop should do after a connection attempt.
enum MenuAction {
    Stay,
    Exit,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=ovman::openvpn=debug surfaces the daemon-mode client output
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if running_as_root() {
        bail!("Don't run ovman as root. Run as a normal user with sudo privileges.");
    }

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_create(&settings_path)?;
    let manager = SessionManager::new(settings)?;

    audit_permissions(&manager).await;

    let mode = if args.debug {
        SessionMode::Debug
    } else {
        SessionMode::Daemon
    };

    if let Some(profile_id) = &args.profile {
        let profiles = manager.profiles().await;
        let Some(profile) = profiles.iter().find(|p| p.id.as_str() == profile_id) else {
            bail!("Unknown profile: {}", profile_id);
        };
        connect(&manager, profile, mode).await?;
        return Ok(());
    }

    menu_loop(&manager, mode).await
}

async fn menu_loop(manager: &SessionManager, mode: SessionMode) -> Result<()> {
    loop {
        let profiles = manager.profiles().await;
        if profiles.is_empty() {
            bail!(
                "No OpenVPN configurations found under {}",
                manager.settings().profile_dir.display()
            );
        }

        show_menu(manager, &profiles);

        let choice = prompt("\nSelect configuration (0 to exit): ")?;
        if choice == "0" {
            return Ok(());
        }

        let selected = choice
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=profiles.len()).contains(n))
            .map(|n| profiles[n - 1].clone());
        let Some(profile) = selected else {
            print_error("Invalid selection");
            continue;
        };

        match connect(manager, &profile, mode).await {
            Ok(MenuAction::Exit) => return Ok(()),
            Ok(MenuAction::Stay) => {}
            Err(e) => print_error(&format!("Error: {e}")),
        }
    }
}

fn show_menu(manager: &SessionManager, profiles: &[Profile]) {
    println!("\nAvailable OpenVPN configurations:");
    for (i, profile) in profiles.iter().enumerate() {
        println!("  {}) {}", i + 1, profile.display_name);
        if profile.requires_credentials() {
            if manager.has_credentials(&profile.id) {
                println!("     (credentials saved)");
            } else {
                println!("     (credentials required)");
            }
        }
    }
    println!("  0) Exit");
}

/// Start a session for `profile`, prompting for credentials as needed.
async fn connect(
    manager: &SessionManager,
    profile: &Profile,
    mode: SessionMode,
) -> Result<MenuAction> {
    let fresh = if profile.requires_credentials() {
        let reuse = manager.has_credentials(&profile.id)
            && prompt_yes("Use existing credentials? (y/n): ")?;
        if reuse {
            print_success("Using existing credentials.");
            None
        } else {
            let username = prompt("Username: ")?;
            let password = rpassword::prompt_password("Password: ")?;
            Some(CredentialInput {
                username,
                secret: Secret::from(password.as_str()),
            })
        }
    } else {
        None
    };

    println!("Connecting to {}...", profile.display_name);
    let mut handle = match manager.start(&profile.id, mode, fresh).await {
        Ok(handle) => handle,
        Err(e) => {
            print_error(&format!("Failed to start OpenVPN: {e}"));
            return Ok(MenuAction::Stay);
        }
    };

    match mode {
        SessionMode::Daemon => {
            print_success("OpenVPN started successfully");
            Ok(MenuAction::Exit)
        }
        SessionMode::Debug => {
            // Replay the startup output that accumulated before Running
            if let Some(mut rx) = handle.take_output() {
                while let Some(line) = rx.recv().await {
                    println!("{line}");
                    if line.contains("Initialization Sequence Completed") {
                        break;
                    }
                }
            }

            print_success("\nOpenVPN connection established.");
            println!("\nOptions:");
            println!("  1) Return to menu");
            println!("  2) Exit to shell");

            loop {
                let choice = prompt("\nSelect option (1-2): ")?;
                match choice.as_str() {
                    // Detach: drop the output stream, leave the session up
                    "1" => return Ok(MenuAction::Stay),
                    // Exit: tear the session down before leaving
                    "2" => {
                        println!("Stopping VPN connection...");
                        manager.stop(handle.id()).await?;
                        print_success("VPN connection stopped.");
                        return Ok(MenuAction::Exit);
                    }
                    _ => print_error("Invalid choice. Please enter 1 or 2."),
                }
            }
        }
    }
}

/// Report profile and credential files with overly permissive modes.
///
/// Report-only; the operator decides whether to apply the chmod hints. The
/// credential store already enforces its own modes, so findings there point
/// at files touched outside the manager.
#[cfg(unix)]
async fn audit_permissions(manager: &SessionManager) {
    use std::os::unix::fs::PermissionsExt;

    fn group_other_bits(path: &std::path::Path) -> Option<u32> {
        let mode = std::fs::metadata(path).ok()?.permissions().mode() & 0o777;
        (mode & 0o077 != 0).then_some(mode)
    }

    let mut hints = Vec::new();
    for profile in manager.profiles().await {
        if let Some(mode) = group_other_bits(&profile.config_path) {
            print_error(&format!(
                "Permissive mode {:o} on {}",
                mode,
                profile.config_path.display()
            ));
            hints.push(format!("chmod 600 '{}'", profile.config_path.display()));
        }
    }

    let cred_dir = &manager.settings().credential_dir;
    if let Some(mode) = group_other_bits(cred_dir) {
        print_error(&format!(
            "Permissive mode {:o} on {}",
            mode,
            cred_dir.display()
        ));
        hints.push(format!("chmod 700 '{}'", cred_dir.display()));
    }
    if let Ok(entries) = std::fs::read_dir(cred_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cred") {
                continue;
            }
            if let Some(mode) = group_other_bits(&path) {
                print_error(&format!("Permissive mode {:o} on {}", mode, path.display()));
                hints.push(format!("chmod 600 '{}'", path.display()));
            }
        }
    }

    if !hints.is_empty() {
        println!("Suggested fixes:");
        for hint in &hints {
            println!("  {hint}");
        }
    }
}

#[cfg(not(unix))]
async fn audit_permissions(_manager: &SessionManager) {}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_yes(message: &str) -> Result<bool> {
    Ok(prompt(message)?.to_lowercase().starts_with('y'))
}

fn print_success(message: &str) {
    println!("{}", message.green());
}

fn print_error(message: &str) {
    eprintln!("{}", message.red());
}
