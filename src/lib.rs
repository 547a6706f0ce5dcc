pub mod audio;
pub mod config;
pub mod error;
pub mod live;

pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use live::{ConnectionState, LiveSession, SessionEvent, Turn, WebSocketTransport};

#[cfg(feature = "device")]
pub fn run() {
    tracing_subscriber::fmt::init();

    // wss:// needs a process-wide TLS provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Runtime::new().expect("error while starting the async runtime");
    if let Err(e) = runtime.block_on(converse()) {
        tracing::error!("Live conversation ended with an error: {}", e);
        std::process::exit(1);
    }
}

/// Terminal front end: one conversation from launch until Ctrl-C
#[cfg(feature = "device")]
async fn converse() -> Result<()> {
    use std::sync::Arc;

    let config = LiveConfig::load();
    if config.api_key.is_empty() {
        tracing::warn!("No API key found in GEMINI_API_KEY or API_KEY");
    }

    match audio::list_input_devices() {
        Ok(devices) => tracing::debug!("Input devices: {:?}", devices),
        Err(e) => tracing::warn!("{}", e),
    }
    match audio::list_output_devices() {
        Ok(devices) => tracing::debug!("Output devices: {:?}", devices),
        Err(e) => tracing::warn!("{}", e),
    }

    let backend = audio::CpalBackend::new(config.input_device.clone(), config.output_device.clone());
    let session = LiveSession::new(config, Arc::new(WebSocketTransport::new()), Arc::new(backend));
    let mut events = session.subscribe();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    session.start();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                session.stop();
                return Ok(());
            }
            event = events.recv() => match event {
                Some(SessionEvent::StateChanged(state)) => {
                    println!("[{:?}] {}", state, state.action_label());
                    match state {
                        ConnectionState::Disconnected => return Ok(()),
                        ConnectionState::Error => {
                            return Err(LiveError::Transport("session failed".to_string()));
                        }
                        _ => {}
                    }
                }
                Some(SessionEvent::TurnRecorded(turn)) => {
                    println!("> USER: {}", turn.user_text);
                    println!("> AI: {}", turn.model_text);
                }
                Some(SessionEvent::Pending(_)) => {}
                None => return Ok(()),
            },
        }
    }
}
