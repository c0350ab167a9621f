//! Ordervoice - voice ordering client
//!
//! Terminal front end: press Enter to start or stop the conversation, `q` to
//! quit. Status changes are logged as they are published.

use anyhow::{Context, Result};
use ordervoice::{ClientConfig, ConversationController, ConversationSnapshot};
use std::io::BufRead;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming a TOML config file
const CONFIG_ENV: &str = "ORDERVOICE_CONFIG";

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ordervoice=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--list-devices") {
        list_devices();
        return Ok(());
    }

    let config = load_config(arg)?;
    info!("Starting Ordervoice (agent at {})", config.transport.url);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let parts = client_parts(&config, runtime.handle().clone())?;

    let (controller, handle) = ConversationController::new(config, parts)?;
    let control = controller.spawn()?;

    let observer = handle.clone();
    thread::Builder::new()
        .name("status".into())
        .spawn(move || {
            while let Ok(snapshot) = observer.snapshots().recv() {
                log_snapshot(&snapshot);
            }
        })
        .context("Failed to spawn status thread")?;

    println!("Press Enter to start/stop the conversation, q to quit.");
    for line in std::io::stdin().lock().lines() {
        match line?.trim() {
            "" | "t" => handle.toggle_conversation()?,
            "q" => break,
            other => warn!("Unknown command: {}", other),
        }
    }

    handle.shutdown()?;
    if control.join().is_err() {
        warn!("Control loop panicked");
    }
    info!("Goodbye");
    Ok(())
}

fn load_config(arg: Option<String>) -> Result<ClientConfig> {
    let path = arg.or_else(|| std::env::var(CONFIG_ENV).ok());
    let config = match path {
        Some(path) => ClientConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ClientConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn log_snapshot(snapshot: &ConversationSnapshot) {
    info!(
        "[{}] {} | cart: {} items, total {:.2}",
        snapshot.state,
        snapshot.status_text,
        snapshot.cart.item_count(),
        snapshot.cart.total
    );
    for item in &snapshot.display_items {
        info!("  showing {} ({:.2})", item.name, item.price);
    }
    if let Some(order) = &snapshot.order {
        info!("Order {} placed, total {:.2}", order.id, order.total);
    }
}

#[cfg(feature = "audio-io")]
fn list_devices() {
    for device in ordervoice::audio::list_input_devices() {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}{}", device.name, marker);
    }
}

#[cfg(not(feature = "audio-io"))]
fn list_devices() {
    println!("Built without audio-io; no devices available");
}

#[cfg(feature = "audio-io")]
fn client_parts(
    config: &ClientConfig,
    runtime: tokio::runtime::Handle,
) -> Result<ordervoice::ClientParts> {
    use ordervoice::audio::{MicrophoneDevice, PlaybackBackend, SpeakerBackend};
    use ordervoice::{ClientParts, SystemClock, TransportSession};
    use std::sync::Arc;

    Ok(ClientParts {
        transport: Box::new(TransportSession::new(config.transport.clone(), runtime)),
        capture_device: Arc::new(MicrophoneDevice::new()),
        playback_backend: Box::new(|| -> ordervoice::Result<Box<dyn PlaybackBackend>> {
            Ok(Box::new(SpeakerBackend::new()?))
        }),
        clock: Arc::new(SystemClock::new()),
    })
}

#[cfg(not(feature = "audio-io"))]
fn client_parts(
    _config: &ClientConfig,
    _runtime: tokio::runtime::Handle,
) -> Result<ordervoice::ClientParts> {
    anyhow::bail!("Built without audio-io; rebuild with the default features")
}
