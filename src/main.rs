//! drive_facade CLI - Sign in to Google and work with Drive files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use drive_facade::config::DEFAULT_CLIENT_ID;
use drive_facade::facade::dicom_query;
use drive_facade::{AuthorizationResponse, DriveConfig, DriveFacade};

/// CLI tool for Google sign-in and Drive file operations.
#[derive(Parser)]
#[command(name = "drive_facade")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// OAuth client ID registered for this application.
    #[arg(long, env = "DRIVE_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// OAuth client secret, for client types that have one.
    #[arg(long, env = "DRIVE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Redirect URI registered for the client.
    #[arg(long, env = "DRIVE_REDIRECT_URI")]
    redirect_uri: Option<String>,

    /// Refresh token printed by `sign-in`, used by every other command.
    #[arg(long, env = "DRIVE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// Deadline for each Drive operation, in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in interactively and print a refresh token.
    SignIn,

    /// Revoke the refresh token.
    SignOut,

    /// Upload a file into the Drive root.
    CreateFile {
        /// Local directory containing the file.
        directory: PathBuf,
        /// File name inside the directory.
        file_name: String,
    },

    /// Create a folder in the Drive root.
    CreateFolder {
        /// Folder name.
        name: String,
    },

    /// Upload a file into a folder.
    UploadToFolder {
        /// Destination folder ID.
        folder: String,
        /// Local directory containing the file.
        directory: PathBuf,
        /// File name inside the directory.
        file_name: String,
    },

    /// Move a file so the given folder is its only parent.
    Move {
        /// File ID.
        file: String,
        /// Destination folder ID.
        #[arg(long, short = 't')]
        to: String,
    },

    /// List files matching a Drive search query (DICOM files by default).
    List {
        /// Drive search query.
        #[arg(long, short = 'q')]
        query: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = DriveConfig::default()
        .with_client_id(cli.client_id)
        .with_client_secret(cli.client_secret)
        .with_operation_timeout(Duration::from_secs(cli.timeout));
    if let Some(redirect_uri) = cli.redirect_uri {
        config = config.with_redirect_uri(redirect_uri);
    }

    let facade = DriveFacade::google(config).context("Failed to set up Drive client")?;

    let needs_session = !matches!(cli.command, Commands::SignIn);
    if needs_session {
        let refresh_token = cli
            .refresh_token
            .as_deref()
            .context("No refresh token; run `sign-in` first and set DRIVE_REFRESH_TOKEN")?;
        facade
            .restore_session(refresh_token)
            .await
            .context("Failed to restore Drive session")?;
    }

    match cli.command {
        Commands::SignIn => sign_in(&facade).await?,

        Commands::SignOut => {
            let account = facade.account();
            facade.sign_out().await.context("Failed to sign out")?;
            if let Some(account) = account {
                println!("Signed out {}", account.email);
            }
        }

        Commands::CreateFile {
            directory,
            file_name,
        } => {
            let id = facade
                .create_file(&directory, &file_name)
                .wait()
                .await
                .with_context(|| format!("Failed to upload {}", directory.join(&file_name).display()))?;
            println!("{}", id);
        }

        Commands::CreateFolder { name } => {
            let id = facade
                .create_folder(&name)
                .wait()
                .await
                .with_context(|| format!("Failed to create folder: {}", name))?;
            println!("{}", id);
        }

        Commands::UploadToFolder {
            folder,
            directory,
            file_name,
        } => {
            let id = facade
                .create_file_in_folder(&folder, &directory, &file_name)
                .wait()
                .await
                .with_context(|| format!("Failed to upload {} into {}", file_name, folder))?;
            println!("{}", id);
        }

        Commands::Move { file, to } => {
            let id = facade
                .move_file(&to, &file)
                .wait()
                .await
                .with_context(|| format!("Failed to move {} to {}", file, to))?;
            println!("Moved {} to {}", id, to);
        }

        Commands::List { query } => {
            let query = query.unwrap_or_else(dicom_query);
            let files = facade
                .list_files(&query)
                .wait()
                .await
                .with_context(|| format!("Failed to list files for query: {}", query))?;

            if files.is_empty() {
                println!("No files found.");
            } else {
                println!("{:<44} {:>10} {:<30} {}", "ID", "SIZE", "TYPE", "NAME");
                println!("{}", "-".repeat(100));
                for file in files {
                    println!("{}", file);
                }
            }
        }
    }

    facade.shutdown().await;
    Ok(())
}

async fn sign_in(facade: &DriveFacade) -> Result<()> {
    let request = facade.request_sign_in()?;
    println!("Open this URL in a browser and approve access:\n");
    println!("  {}\n", request.authorization_url);
    println!("Then paste the full URL you were redirected to:");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read redirect URL")?;

    let response = AuthorizationResponse::from_redirect_url(&line)?;
    let email = facade
        .complete_sign_in(&request, &response)
        .await
        .context("Sign-in failed")?;

    println!("Signed in as {}", email);
    match facade.credential().and_then(|c| c.refresh_token().map(str::to_string)) {
        Some(token) => println!("DRIVE_REFRESH_TOKEN={}", token),
        None => println!("The provider issued no refresh token; sign in again with consent."),
    }
    Ok(())
}
