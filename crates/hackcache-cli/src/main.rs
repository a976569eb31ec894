//! hackcache - command-line front end for the hackathon data cache.
//!
//! Restores the on-disk snapshot, runs one command against the server and
//! saves the snapshot again, so every command works offline from the last
//! successful refresh.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, Utc};
use hackcache_core::{CacheEvent, Config, ResourceKind, SyncService};
use tokio::sync::broadcast;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file written next to the snapshot
const LOG_FILE: &str = "hackcache.log";

const USAGE: &str = "\
Usage: hackcache <command>

Commands:
  status                      Session and cache summary
  login [username]            Log in and remember the username
  logout                      Log out and forget the stored token
  refresh [resource|all]      Fetch fresh data (default: all)
  list <resource> [--json]    Print cached data

Resources: announcements, countdown, events, locations, map, scan_events, profile";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). Output goes to stderr and,
/// when the cache directory is usable, to a log file there. The returned guard
/// flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(base_url) = std::env::var("HACKCACHE_BASE_URL") {
        config.base_url = base_url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = load_config()?;
    let _log_guard = init_tracing(config.cache_dir().ok().as_deref());
    info!(command, base_url = %config.base_url, "hackcache starting");

    let service = SyncService::from_config(config)?;
    service.start().await.context("Restore task failed")?;

    let result = match command {
        "status" => status(&service),
        "login" => login(&service, args.get(1).map(String::as_str)).await,
        "logout" => logout(&service).await,
        "refresh" => refresh(&service, args.get(1).map(String::as_str)).await,
        "list" => list(&service, &args[1..]),
        other => Err(anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    info!("hackcache shutting down");
    result
}

fn parse_resource(name: &str) -> Result<ResourceKind> {
    ResourceKind::parse(name).ok_or_else(|| anyhow!("Unknown resource: {}", name))
}

fn status(service: &SyncService) -> Result<()> {
    match service.identity() {
        Some(identity) => {
            println!("Logged in as {} <{}>", identity.name, identity.username);
            if let Some(school) = identity.school {
                println!("  School: {}", school);
            }
            println!(
                "  Can post announcements: {}, edit announcements: {}, scan: {}",
                identity.can_post_announcements, identity.can_edit_announcements, identity.can_perform_scan
            );
        }
        None => println!("Not logged in"),
    }

    println!("Server: {}", service.config().base_url);
    println!("Snapshot: {}", service.snapshot_path().display());
    match service.load_snapshot() {
        Some(snapshot) => println!("  Saved {}", snapshot.age_display()),
        None => println!("  No cached data"),
    }

    println!(
        "  {} announcements, {} events, {} locations, {} floors, {} scan events",
        service.announcements().len(),
        service.events().len(),
        service.locations().len(),
        service.map().len(),
        service.scan_events().len(),
    );
    let countdown = service.countdown();
    if countdown.is_configured() {
        println!(
            "  Hacking time remaining: {} ({:.0}% elapsed)",
            countdown.remaining_display(Utc::now()),
            countdown.progress(Utc::now()) * 100.0
        );
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(service: &Arc<SyncService>, username: Option<&str>) -> Result<()> {
    if let Some(identity) = service.identity() {
        println!("Already logged in as {}", identity.username);
        return Ok(());
    }

    let username = match username {
        Some(name) => name.to_string(),
        None => match std::env::var("HACKCACHE_USERNAME").ok().or(service.config().last_username) {
            Some(name) => name,
            None => prompt("Email: ")?,
        },
    };
    if username.is_empty() {
        bail!("A username is required");
    }
    let password = match std::env::var("HACKCACHE_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    let identity = service.login(&username, &password).await?;
    println!("Logged in as {} <{}>", identity.name, identity.username);
    Ok(())
}

async fn logout(service: &Arc<SyncService>) -> Result<()> {
    if !service.credentials().is_logged_in() {
        println!("Not logged in");
        return Ok(());
    }
    service.logout().await;
    println!("Logged out");
    Ok(())
}

async fn refresh(service: &Arc<SyncService>, target: Option<&str>) -> Result<()> {
    let mut events = service.subscribe();

    let outcomes = match target {
        None | Some("all") => service.refresh_all().await,
        Some(name) => {
            let kind = parse_resource(name)?;
            vec![(kind, service.refresh(kind).await)]
        }
    };

    service
        .save_snapshot_in_background()
        .await
        .context("Snapshot task failed")?;

    report_events(&mut events);
    for (kind, ok) in &outcomes {
        println!("{:<14} {}", kind.to_string(), if *ok { "ok" } else { "failed" });
    }

    if outcomes.iter().all(|(_, ok)| !ok) {
        bail!("Nothing could be refreshed");
    }
    Ok(())
}

fn report_events(events: &mut broadcast::Receiver<CacheEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            CacheEvent::ResourceUpdated { resource, summary } => eprintln!(
                "{}: {} new, {} updated, {} removed",
                resource, summary.inserted, summary.updated, summary.removed
            ),
            CacheEvent::SessionChanged { logged_in: false } => eprintln!("Session ended by the server"),
            CacheEvent::Failure { resource: Some(resource), message } => eprintln!("{}: {}", resource, message),
            CacheEvent::Failure { resource: None, message } => eprintln!("{}", message),
            _ => {}
        }
    }
}

fn list(service: &SyncService, args: &[String]) -> Result<()> {
    let name = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or_else(|| anyhow!("list needs a resource\n\n{}", USAGE))?;
    let kind = parse_resource(name)?;
    let json = args.iter().any(|a| a == "--json");

    if kind == ResourceKind::Profile {
        let identity = service.identity().ok_or_else(|| anyhow!("Not logged in"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&identity)?);
        } else {
            println!("{} <{}>", identity.name, identity.username);
        }
        return Ok(());
    }

    if json {
        let value = service.serialized(kind).unwrap_or_default();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match kind {
        ResourceKind::Announcements => {
            for a in service.announcements().iter() {
                println!(
                    "{}  [{}]  {}: {}",
                    a.broadcast_at.with_timezone(&Local).format("%a %H:%M"),
                    a.category,
                    a.title,
                    a.message
                );
            }
        }
        ResourceKind::Countdown => {
            let countdown = service.countdown();
            if countdown.is_configured() {
                println!(
                    "{} - {}  remaining {}",
                    countdown.start.with_timezone(&Local).format("%a %H:%M"),
                    countdown.end.with_timezone(&Local).format("%a %H:%M"),
                    countdown.remaining_display(Utc::now())
                );
            } else {
                println!("Countdown not configured");
            }
        }
        ResourceKind::Events => {
            let locations = service.locations();
            for e in service.events().iter() {
                let place = e.location(&locations).map(|l| l.name.as_str()).unwrap_or("?");
                println!("{}  {:<10} {} @ {}", e.formatted_time(), e.category.to_string(), e.name, place);
            }
        }
        ResourceKind::Locations => {
            for l in service.locations().iter() {
                println!("{}  ({:.5}, {:.5})", l.name, l.latitude, l.longitude);
            }
        }
        ResourceKind::Map => {
            for f in service.map().iter() {
                println!("{:>3}  {}  {}", f.index, f.name, f.image_url);
            }
        }
        ResourceKind::ScanEvents => {
            let now = Utc::now();
            for s in service.scan_events().iter() {
                let state = if s.is_expired(now) { " (expired)" } else { "" };
                println!("{}  {}{}", s.id, s.name, state);
            }
        }
        ResourceKind::Profile => {}
    }
    Ok(())
}
