// examples/simulated_session.rs
//
// Drives a full cast session against the in-memory receiver:
//   - a link is shared into the host and picked up as the initial link
//   - connect, load, play, a network blip with suspend/resume, a seek
//   - lifecycle events printed as they arrive, then a clean disconnect
//
// Run from the workspace root:
//   cargo run -p fluxocast --example simulated_session
//   cargo run -p fluxocast --example simulated_session -- "check this https://cdn.example.com/a.mp4"
//
// The log level comes from `host.logger.min_level` unless RUST_LOG is set.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use fluxocast::{
    CastController, ControllerConfig, MediaItem, MemoryTransport, PlayerState, ReceiverEvent,
    ReceiverStatus, SessionEvent, ShareInbox,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_SHARE: &str = "Watch this: https://cdn.example.com/movies/big-buck-bunny.mp4";

fn main() -> Result<()> {
    let config = fluxoconfig::get_config();

    if config.get_log_enable_console()? {
        let level = config.get_log_min_level()?.to_ascii_lowercase();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    println!("Controller {}", config.get_controller_id()?);

    let settings = config.cast_settings()?;
    let inbox = ShareInbox::from_settings(&settings.share);
    let shared = env::args().nth(1).unwrap_or_else(|| DEFAULT_SHARE.to_string());
    inbox.receive(&settings.share.accepted_mime, &shared);
    let link = inbox
        .take_initial_link()
        .ok_or_else(|| anyhow!("no http(s) link in {shared:?}"))?;
    println!("Initial link: {link}");

    let (transport, receiver) = MemoryTransport::with_receiver("demo-tv", "Demo living room TV");
    let controller = CastController::spawn(
        Arc::new(transport.clone()),
        ControllerConfig::from_config(&config)?,
    )?;

    let events = controller.subscribe_events();
    let printer = thread::spawn(move || {
        for event in events.iter() {
            match &event {
                SessionEvent::Started { session, receiver } => {
                    println!("[event] started {session} on {receiver}")
                }
                SessionEvent::Suspended { session, reason } => {
                    println!("[event] suspended {session}: {reason}")
                }
                SessionEvent::Resumed { session } => println!("[event] resumed {session}"),
                SessionEvent::Ended { session, reason } => {
                    println!("[event] ended {session}: {reason}")
                }
                SessionEvent::StartFailed { receiver, error } => {
                    println!("[event] could not start on {receiver}: {error}")
                }
            }
        }
    });

    println!("Receivers:");
    for found in controller.discover() {
        println!("  {} ({})", found.friendly_name, found.location);
    }

    let session = controller
        .connect(&receiver)
        .context("connecting to the demo receiver")?;
    println!("Session {session} connected");

    let item = MediaItem::new(&link)?.with_title("Shared video");
    let wait = Duration::from_secs(2);
    controller.load(item)?.wait_timeout(wait);
    controller.play()?.wait_timeout(wait);
    println!("After play: {:?}", controller.current_playback_state().player_state);

    transport.push(ReceiverEvent::Status(ReceiverStatus {
        timestamp_ms: 1_000,
        player_state: Some(PlayerState::Playing),
        position_ms: Some(12_000),
        duration_ms: Some(596_000),
        is_live: Some(false),
    }));

    transport.push(ReceiverEvent::Suspended {
        reason: "simulated network blip".to_string(),
    });
    thread::sleep(Duration::from_millis(100));
    let seek = controller.seek(60_000)?;
    println!(
        "Seek queued while {}: {:?}",
        controller.current_session_state(),
        seek.try_outcome().map(|c| c.status)
    );

    transport.push(ReceiverEvent::Resumed);
    if let Some(command) = seek.wait_timeout(wait) {
        println!("Seek {}: {:?}", command.id, command.status);
    }

    let state = controller.current_playback_state();
    println!(
        "Playback: {:?} at {} ms of {:?} ms",
        state.player_state, state.position_ms, state.duration_ms
    );

    controller.disconnect();
    controller.shutdown();
    drop(controller);
    let _ = printer.join();

    println!("Commands sent: {:?}", transport.sent_names());
    Ok(())
}
