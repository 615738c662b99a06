//! Run command - joins the chat and reads messages from stdin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatsnap_core::chat::{
    AttachmentProvider, Capture, Composer, ComposerAction, ConnectivityMonitor,
    ConversationSnapshot, DispatchOutcome, GeoPoint, ImageSource, InMemoryCollection,
    ManualSignal, Message, MessageId, NetworkSignal, ProbeSignal, SledCache, SyncEngine,
    SyncEvent,
};
use chatsnap_core::{Config, Error};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A line of user input.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    Text(String),
    Attach(ComposerAction, Attachment),
    Actions,
    Offline,
    Online,
    List,
    Quit,
    Unknown(String),
    Empty,
}

/// Attachment payload given on the command line.
#[derive(Debug, Clone, PartialEq)]
enum Attachment {
    None,
    Image(String),
    Location(f64, f64),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Text(line.to_string());
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match (command, args.as_slice()) {
        ("/quit", []) | ("/exit", []) => Input::Quit,
        ("/list", []) => Input::List,
        ("/offline", []) => Input::Offline,
        ("/online", []) => Input::Online,
        ("/actions", []) => Input::Actions,
        ("/image", [url]) => Input::Attach(
            ComposerAction::PickImage,
            Attachment::Image(url.to_string()),
        ),
        ("/photo", [url]) => Input::Attach(
            ComposerAction::TakePhoto,
            Attachment::Image(url.to_string()),
        ),
        ("/location", [lat, lon]) => match (lat.parse::<f64>(), lon.parse::<f64>()) {
            (Ok(lat), Ok(lon)) => Input::Attach(
                ComposerAction::ShareLocation,
                Attachment::Location(lat, lon),
            ),
            _ => Input::Unknown(line.to_string()),
        },
        ("/cancel", []) => Input::Attach(ComposerAction::Cancel, Attachment::None),
        _ => Input::Unknown(line.to_string()),
    }
}

/// Serves a single attachment typed on the command line.
struct TypedAttachment(Attachment);

#[async_trait]
impl AttachmentProvider for TypedAttachment {
    async fn capture_image(&self, _source: ImageSource) -> Capture<String> {
        match &self.0 {
            Attachment::Image(url) => Capture::Captured(url.clone()),
            _ => Capture::Cancelled,
        }
    }

    async fn capture_location(&self) -> Capture<GeoPoint> {
        match self.0 {
            Attachment::Location(lat, lon) => match GeoPoint::new(lat, lon) {
                Ok(point) => Capture::Captured(point),
                Err(e) => {
                    warn!("Ignoring location: {}", e);
                    Capture::Cancelled
                }
            },
            _ => Capture::Cancelled,
        }
    }
}

pub async fn execute(config_path: Option<String>, name: Option<String>) -> Result<()> {
    // Load configuration
    let config_path = config_path.map(std::path::PathBuf::from);
    let mut config = if let Some(path) = &config_path {
        info!("Loading config from: {}", path.display());
        Config::load_from(path)?
    } else {
        Config::load_with_env()?
    };
    if let Some(name) = name {
        config.display_name = name;
    }
    config.validate()?;

    let (author, generated) = config.identity();
    if generated {
        if let Err(e) = save_config(&mut config, config_path.as_deref()) {
            warn!("Failed to persist user id: {}", e);
        }
    }

    info!("Chatsnap v{}", env!("CARGO_PKG_VERSION"));
    info!("Joining as {} ({})", author.display_name, author.id);

    let cache_path = config.cache_dir();
    let cache = SledCache::open(&cache_path)
        .with_context(|| format!("failed to open cache at {:?}", cache_path))?;

    // Without a probe, connectivity is toggled with /offline and /online.
    let manual = Arc::new(ManualSignal::new(true));
    let signal: Arc<dyn NetworkSignal> = match &config.probe {
        Some(probe) => {
            info!("Probing {} for connectivity", probe.address);
            Arc::new(ProbeSignal::spawn(probe.clone()))
        }
        None => manual.clone(),
    };
    let monitor = ConnectivityMonitor::new(signal).with_debounce(config.debounce());

    let remote = Arc::new(InMemoryCollection::new());
    let handle = SyncEngine::new(monitor, remote, Arc::new(cache), config.assistant()).start();

    let printer = tokio::spawn(print_events(handle.subscribe()));
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                None
            }
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::List => print_list(&handle.current_messages()),
            Input::Actions => {
                for (index, action) in ComposerAction::ALL.iter().enumerate() {
                    println!("  {}. {}", index + 1, action.label());
                }
            }
            Input::Offline | Input::Online if config.probe.is_some() => {
                println!("Connectivity is driven by the probe");
            }
            Input::Offline => manual.set_connected(false),
            Input::Online => manual.set_connected(true),
            Input::Text(text) => {
                let provider = Arc::new(TypedAttachment(Attachment::None));
                let composer = Composer::new(author.clone(), provider);
                match composer.text(&text) {
                    Ok(message) => report(handle.send(message).await),
                    Err(e) => println!("! {}", e),
                }
            }
            Input::Attach(action, attachment) => {
                let provider = Arc::new(TypedAttachment(attachment));
                let composer = Composer::new(author.clone(), provider);
                match composer.attach(action).await {
                    Some(message) => report(handle.send(message).await),
                    None => debug!("Nothing to send"),
                }
            }
            Input::Unknown(line) => println!("Unknown command: {}", line),
        }
    }

    info!("Leaving chat");
    printer.abort();
    handle.stop().await?;
    Ok(())
}

/// Save back to the file the config was loaded from.
fn save_config(config: &mut Config, path: Option<&Path>) -> Result<(), Error> {
    match path {
        Some(path) => config.save_to(path),
        None => config.save(),
    }
}

fn report(result: Result<DispatchOutcome, Error>) {
    match result {
        Ok(DispatchOutcome::Delivered { reply: None, .. }) => {
            println!("! sent, but the automated reply could not be written");
        }
        Ok(DispatchOutcome::Delivered { .. }) => {}
        Ok(DispatchOutcome::Queued { .. }) => println!("(offline: message queued)"),
        Err(e) if e.is_transient() => println!("! {} (queued for retry)", e),
        Err(e) => println!("! {}", e),
    }
}

async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    let mut shown: HashSet<MessageId> = HashSet::new();
    loop {
        match events.recv().await {
            Ok(SyncEvent::MessagesChanged(snapshot)) => {
                for message in snapshot.iter().rev() {
                    if shown.insert(message.id.clone()) {
                        println!("{}", format_message(message));
                    }
                }
            }
            Ok(SyncEvent::ConnectivityChanged { connected }) => {
                println!("-- {} --", if connected { "online" } else { "offline" });
            }
            Ok(SyncEvent::DispatchFailed { message_id, reason }) => {
                debug!("Dispatch of {} failed: {}", message_id, reason);
            }
            Ok(SyncEvent::OutboxFlushed { sent, requeued }) => {
                if sent > 0 {
                    println!("-- sent {} queued message(s) --", sent);
                }
                if requeued > 0 {
                    println!("-- {} message(s) still queued --", requeued);
                }
            }
            Ok(SyncEvent::StateChanged(state)) => debug!("Engine state: {:?}", state),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display fell behind by {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_list(snapshot: &ConversationSnapshot) {
    if snapshot.is_empty() {
        println!("(no messages)");
    }
    for message in snapshot.iter().rev() {
        println!("{}", format_message(message));
    }
}

fn format_message(message: &Message) -> String {
    let time = message.created_at.format("%H:%M");
    if message.system {
        return format!("[{}] * {}", time, message.text.as_deref().unwrap_or_default());
    }

    let mut body = message.body().unwrap_or_default().to_string();
    if let Some(url) = message.attachment.image_url() {
        body = format!("{}[image] {}", prefix(&body), url);
    }
    if let Some(point) = message.attachment.location() {
        body = format!(
            "{}[location] {:.5}, {:.5}",
            prefix(&body),
            point.latitude,
            point.longitude
        );
    }
    format!("[{}] {}: {}", time, message.sender.display_name, body)
}

fn prefix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!("{} ", body)
    }
}

fn print_help() {
    println!("Type a message and press enter. Commands:");
    println!("  /image <url>            send an image from the library");
    println!("  /photo <url>            send a photo from the camera");
    println!("  /location <lat> <lon>   share a location");
    println!("  /actions                show the attachment actions");
    println!("  /offline, /online       toggle connectivity (no probe configured)");
    println!("  /list                   show the conversation");
    println!("  /quit                   leave");
}
