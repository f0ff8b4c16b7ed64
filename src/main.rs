use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

mod api;
mod app;
mod config;
mod controller;
mod error;
mod logger;
mod markdown;
mod model;
mod paywall;
mod repository;
mod reveal;
mod session;
#[cfg(test)]
mod test_support;

use crate::api::{ApiClient, JournalApi};
use crate::controller::{ControllerSettings, JournalController};
use crate::paywall::PaywallGate;
use crate::repository::EntryRepository;
use crate::session::SessionStore;

const SESSION_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the TUI application (default)
    Tui,
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and log in
    Register {
        #[arg(long)]
        email: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Ask for a password reset email
    ForgotPassword {
        #[arg(long)]
        email: Option<String>,
    },
    /// Set a new password with the token from the reset email
    ResetPassword {
        #[arg(long)]
        token: String,
    },
    /// Print one page of entries
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Show the account and session state
    Status,
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, DisableBracketedPaste)?;
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn prompt_secret(label: &str) -> Result<Zeroizing<String>> {
    Ok(Zeroizing::new(prompt(label)?))
}

fn email_or_prompt(email: Option<String>) -> Result<String> {
    let email = match email {
        Some(e) => e,
        None => prompt("Email")?,
    };
    let email = email.trim().to_string();
    if email.is_empty() {
        bail!("An email address is required.");
    }
    Ok(email)
}

async fn handle_cli_login(
    client: &ApiClient,
    store: &SessionStore,
    email: Option<String>,
) -> Result<()> {
    if store.is_logged_in() {
        if let Ok(bearer) = store.context().bearer() {
            if let Ok(me) = client.account(bearer).await {
                println!("Already logged in as: {}", me.email);
                return Ok(());
            }
        }
    }

    let email = email_or_prompt(email)?;
    let password = prompt_secret("Password")?;
    let token = client
        .login(&email, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.message()))?;
    store.set(&token)?;
    println!("Login successful! Logged in as: {}", email);
    Ok(())
}

async fn handle_cli_register(
    client: &ApiClient,
    store: &SessionStore,
    email: Option<String>,
) -> Result<()> {
    let email = email_or_prompt(email)?;
    let password = prompt_secret("Password")?;
    let confirm = prompt_secret("Confirm Password")?;
    if *password != *confirm {
        bail!("Passwords do not match");
    }
    client
        .register(&email, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.message()))?;
    let token = client
        .login(&email, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.message()))?;
    store.set(&token)?;
    println!("Account created. Logged in as: {}", email);
    Ok(())
}

fn logout(store: &SessionStore) -> Result<()> {
    if !store.is_logged_in() {
        println!("Already logged out.");
        return Ok(());
    }
    store.clear()?;
    println!("Logged out successfully.");
    Ok(())
}

async fn handle_cli_list(
    client: ApiClient,
    store: &SessionStore,
    page: u32,
    limit: u32,
) -> Result<()> {
    let repo = EntryRepository::new(Arc::new(client));
    let page = repo
        .list(&store.context(), page, limit)
        .await
        .map_err(|e| anyhow::anyhow!(e.message()))?;

    if page.entries.is_empty() {
        println!("No entries on page {}.", page.number);
        return Ok(());
    }
    println!("Page {}", page.number);
    for entry in &page.entries {
        let marker = if entry.has_feedback() { "✦" } else { " " };
        println!(
            "{} [{}] {}  ({})",
            marker,
            entry.id,
            markdown::preview(&entry.title, 50),
            entry
                .created_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
        );
    }
    if page.has_more {
        println!("More entries: --page {}", page.number + 1);
    }
    Ok(())
}

async fn handle_cli_status(client: &ApiClient, store: &SessionStore) -> Result<()> {
    println!("Nightingale {}", config::APP_VERSION);
    println!("Backend: {}", client.base_url());
    println!("Session file: {}", store.path().display());

    let ctx = store.context();
    let bearer = match ctx.bearer() {
        Ok(bearer) => bearer,
        Err(e) => {
            println!("Session: {}", e);
            return Ok(());
        }
    };
    match client.account(bearer).await {
        Ok(me) => {
            println!("Account: {}", me.email);
            let plan = if me.is_premium { "Premium" } else { "Free" };
            println!("Plan: {} ({} feedback used)", plan, me.feedback_count);
        }
        Err(e) => println!("Session: {}", e.message()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = restore_terminal();
        default_hook(info);
    }));

    logger::init();
    let args = Args::parse();
    let app_config = config::load_config();
    let client = ApiClient::from_config(&app_config)?;
    let store = SessionStore::open_default();
    tracing::info!(
        "nightingale {} starting against {}",
        config::APP_VERSION,
        client.base_url()
    );

    match args.command {
        Some(Commands::Login { email }) => return handle_cli_login(&client, &store, email).await,
        Some(Commands::Register { email }) => {
            return handle_cli_register(&client, &store, email).await
        }
        Some(Commands::Logout) => return logout(&store),
        Some(Commands::ForgotPassword { email }) => {
            let email = email_or_prompt(email)?;
            let notice = client
                .forgot_password(&email)
                .await
                .map_err(|e| anyhow::anyhow!(e.message()))?;
            println!("{}", notice);
            return Ok(());
        }
        Some(Commands::ResetPassword { token }) => {
            let password = prompt_secret("New Password")?;
            let confirm = prompt_secret("Confirm Password")?;
            if *password != *confirm {
                bail!("Passwords do not match");
            }
            client
                .reset_password(&token, &password)
                .await
                .map_err(|e| anyhow::anyhow!(e.message()))?;
            println!("{}", controller::PASSWORD_RESET_NOTICE);
            return Ok(());
        }
        Some(Commands::List { page }) => {
            let limit = app_config.general.page_size();
            return handle_cli_list(client, &store, page, limit).await;
        }
        Some(Commands::Status) => return handle_cli_status(&client, &store).await,
        None | Some(Commands::Tui) => {
            // Proceed to TUI
        }
    }

    let controller = JournalController::new(
        Arc::new(client),
        store.clone(),
        ControllerSettings::from_config(&app_config),
        PaywallGate::new(&app_config.paywall),
    );
    let watcher = store.spawn_watcher(SESSION_POLL);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let mut terminal =
        Terminal::new(CrosstermBackend::new(stdout)).context("Failed to start terminal")?;

    let mut app = app::App::new(controller, app_config);
    let app_result = app.run(&mut terminal).await;

    drop(app);
    watcher.abort();
    let _ = restore_terminal();
    if let Err(err) = app_result {
        tracing::error!("app exited with error: {:?}", err);
        eprintln!("Error: {:?}", err);
    }
    Ok(())
}
