use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cli::output::{OutputFormat, OutputOptions};
use crate::cli::renderer;
use crate::core::client::{ManagementApi, ManagementClient};
use crate::core::config::AppConfig;
use crate::core::coordinator::{Coordinator, CoordinatorEvent, UpdateFailure};
use crate::core::formatter::format_value;
use crate::core::models::snapshot::Snapshot;
use crate::core::points::{self, Button, Control};

/// A coordinator wired to the configured server.
struct Session {
    coordinator: Arc<Coordinator>,
    base_url: String,
}

fn connect(config: &AppConfig) -> Result<Session> {
    let base_url = config.base_url()?;
    if config.server.management_key.trim().is_empty() {
        bail!(
            "No management key configured. Set server.management_key in {} or export {}.",
            AppConfig::config_path().display(),
            crate::core::config::MANAGEMENT_KEY_ENV
        );
    }
    let client = ManagementClient::new(&base_url, config.server.management_key.clone())
        .context("Failed to build HTTP client")?;
    debug!(?client, "connecting");
    let api: Arc<dyn ManagementApi> = Arc::new(client);
    Ok(Session {
        coordinator: Coordinator::new(api, config.coordinator_options()),
        base_url,
    })
}

fn load_session() -> Result<Session> {
    let config = AppConfig::load().context("Failed to load config")?;
    connect(&config)
}

/// Show a spinner on stderr while `fut` runs (text mode only).
async fn with_spinner<F: Future>(opts: &OutputOptions, msg: &'static str, fut: F) -> F::Output {
    if !matches!(opts.format, OutputFormat::Text) {
        return fut.await;
    }
    let spinner = tokio::spawn(async move {
        let frames = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
        let mut i = 0usize;
        loop {
            eprint!("\r {} {}", frames[i % frames.len()], msg);
            i = i.wrapping_add(1);
            tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        }
    });
    let output = fut.await;
    spinner.abort();
    eprint!("\r\x1b[2K");
    output
}

fn print_outcome(
    session: &Session,
    outcome: &Result<Arc<Snapshot>, UpdateFailure>,
    opts: &OutputOptions,
) -> Result<()> {
    match (opts.format, outcome) {
        (OutputFormat::Text, Ok(snapshot)) => {
            println!(
                "{}",
                renderer::render_snapshot(snapshot, &session.base_url, true, opts.use_color)
            );
        }
        (OutputFormat::Text, Err(failure)) => {
            println!(
                "{}",
                renderer::render_failure(&session.base_url, failure, opts.use_color)
            );
        }
        (OutputFormat::Json, Ok(snapshot)) => {
            let mut payload = serde_json::json!({
                "base_url": session.base_url,
                "reachable": true,
                "snapshot": snapshot.as_ref(),
                "points": points::readings(snapshot, true),
            });
            if opts.verbose {
                payload["coordinator_status"] =
                    serde_json::to_value(session.coordinator.status())?;
            }
            println!("{}", opts.to_json(&payload)?);
        }
        (OutputFormat::Json, Err(failure)) => {
            let payload = serde_json::json!({
                "base_url": session.base_url,
                "reachable": false,
                "error": failure,
            });
            println!("{}", opts.to_json(&payload)?);
        }
    }
    Ok(())
}

pub async fn status(opts: &OutputOptions) -> Result<()> {
    let session = load_session()?;
    let outcome = with_spinner(opts, "Polling CLIProxyAPI...", session.coordinator.first_refresh()).await;
    print_outcome(&session, &outcome, opts)?;
    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

pub async fn watch(opts: &OutputOptions) -> Result<()> {
    let session = load_session()?;
    let coordinator = Arc::clone(&session.coordinator);
    let mut events = coordinator.subscribe();

    let outcome = coordinator.first_refresh().await;
    // The first cycle's own event is already in the channel; skip it.
    let _ = events.try_recv();
    print_outcome(&session, &outcome, opts)?;

    let poller = coordinator.spawn();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoordinatorEvent::Updated(snapshot)) => {
                    if matches!(opts.format, OutputFormat::Text) {
                        println!();
                    }
                    print_outcome(&session, &Ok(snapshot), opts)?;
                }
                Ok(CoordinatorEvent::UpdateFailed(failure)) => {
                    if matches!(opts.format, OutputFormat::Text) {
                        println!();
                    }
                    print_outcome(&session, &Err(failure), opts)?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.stop().await;
    Ok(())
}

pub async fn get(path: &str, opts: &OutputOptions) -> Result<()> {
    let session = load_session()?;
    let snapshot = match session.coordinator.first_refresh().await {
        Ok(snapshot) => snapshot,
        Err(failure) => bail!("Update failed: {}", failure),
    };
    let Some(value) = snapshot.lookup(path) else {
        bail!("No value at '{}'", path);
    };
    match opts.format {
        OutputFormat::Json => println!("{}", opts.to_json(&value)?),
        OutputFormat::Text => match &value {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                println!("{}", serde_json::to_string_pretty(&value)?)
            }
            scalar => println!("{}", format_value(scalar)),
        },
    }
    Ok(())
}

pub async fn set(key: &str, raw: &str, opts: &OutputOptions) -> Result<()> {
    let Some(control) = Control::from_key(key) else {
        let known: Vec<&str> = crate::core::models::settings::SettingKey::all()
            .iter()
            .map(|k| k.id())
            .collect();
        bail!("Unknown setting '{}' (expected one of: {})", key, known.join(", "));
    };
    let session = load_session()?;
    control
        .write(&session.coordinator, raw)
        .await
        .with_context(|| format!("Failed to set {}", control.key()))?;

    let snapshot = session
        .coordinator
        .refresh()
        .await
        .map_err(|failure| anyhow::anyhow!("Setting written but refresh failed: {}", failure))?;
    let value = snapshot.settings.get(control.0);
    match opts.format {
        OutputFormat::Json => {
            let payload = serde_json::json!({ "key": control.key(), "value": value });
            println!("{}", opts.to_json(&payload)?);
        }
        OutputFormat::Text => println!("{} = {}", control.key(), value),
    }
    Ok(())
}

pub async fn press(key: &str, opts: &OutputOptions) -> Result<()> {
    let Some(button) = Button::from_key(key) else {
        let known: Vec<&str> = Button::all().iter().map(Button::key).collect();
        bail!("Unknown button '{}' (expected one of: {})", key, known.join(", "));
    };
    let session = load_session()?;
    button
        .press(&session.coordinator)
        .await
        .with_context(|| format!("Failed to press {}", button.key()))?;

    if button == Button::ClearLogs {
        let outcome = session.coordinator.refresh().await;
        if let Err(failure) = &outcome {
            warn!(%failure, "refresh after clearing logs failed");
        }
    }
    match opts.format {
        OutputFormat::Json => {
            let payload = serde_json::json!({ "pressed": button.key() });
            println!("{}", opts.to_json(&payload)?);
        }
        OutputFormat::Text => println!("Pressed {}", button.key()),
    }
    Ok(())
}

pub async fn diagnostics(opts: &OutputOptions) -> Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let session = connect(&config)?;
    if let Err(failure) = session.coordinator.first_refresh().await {
        warn!(%failure, "diagnostics collected without a fresh snapshot");
    }
    let snapshot = session.coordinator.snapshot();
    let dump = points::diagnostics(
        config.to_entry(),
        snapshot.as_deref(),
        &session.coordinator.status(),
    );
    let pretty = OutputOptions {
        pretty: true,
        ..opts.clone()
    };
    println!("{}", pretty.to_json(&dump)?);
    Ok(())
}
