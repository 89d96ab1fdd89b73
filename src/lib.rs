pub mod audio;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod live;
pub mod persona;
pub mod settings;
pub mod state_machine;
pub mod transcript;

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;

pub use controller::{Command, SessionController, SessionHandle, SessionSnapshot};
pub use error::SessionError;
pub use state_machine::ConnectionStatus;

use audio::CpalBackend;
use live::LiveConnector;
use settings::AppSettings;

/// Run one practice conversation on the default microphone and speakers
///
/// Committed transcript messages are printed as they arrive. Ctrl-C ends
/// the conversation.
pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Both ring and aws-lc may be linked; pick one explicitly
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(code) = run_key_command(&args) {
        return code;
    }

    let settings = settings::load_settings();
    log::info!(
        "Practicing {} ({}), voice {}",
        settings.language,
        settings.level.label(),
        settings.voice
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run_conversation(settings))
}

/// `--store-key <KEY>` / `--forget-key` manage the keyring entry and exit
fn run_key_command(args: &[String]) -> Option<ExitCode> {
    let result = match args.first().map(String::as_str) {
        None => return None,
        Some("--store-key") => match args.get(1) {
            Some(key) => credentials::set_api_key(Some(key)),
            None => Err("--store-key needs a key".to_string()),
        },
        Some("--forget-key") => credentials::set_api_key(None),
        Some(other) => Err(format!(
            "Unknown argument {:?}. Usage: lingua-live [--store-key <KEY> | --forget-key]",
            other
        )),
    };

    Some(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    })
}

async fn run_conversation(settings: AppSettings) -> ExitCode {
    let api_key = credentials::get_api_key();
    match &api_key {
        Some(key) => log::info!("Using API key {}", credentials::mask_key(key)),
        None => log::warn!("No API key configured"),
    }

    let controller = SessionController::new(
        settings,
        api_key,
        Box::new(CpalBackend),
        Box::new(LiveConnector),
    );
    let cancel = CancellationToken::new();
    let (handle, task) = controller.spawn(cancel.clone());
    let mut snapshots = handle.subscribe();

    if handle.connect().await.is_err() {
        log::error!("Session loop exited before connecting");
        return ExitCode::FAILURE;
    }

    let mut printed = 0;
    let mut last_status = ConnectionStatus::Idle;
    let mut last_error: Option<String> = None;
    let mut exit = ExitCode::SUCCESS;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, ending conversation");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();

                for message in snapshot.transcript.iter().skip(printed) {
                    println!("[{}] {}", message.role.as_str(), message.text);
                }
                // Disconnect clears the log
                printed = snapshot.transcript.len();

                if snapshot.last_error != last_error {
                    if let Some(err) = &snapshot.last_error {
                        eprintln!("error: {}", err);
                    }
                    last_error = snapshot.last_error.clone();
                }

                if snapshot.status != last_status {
                    log::info!("Status: {:?}", snapshot.status);
                    last_status = snapshot.status;
                    match snapshot.status {
                        ConnectionStatus::Active => {
                            println!("Connected. Start speaking; press Ctrl-C to stop.");
                        }
                        ConnectionStatus::Closed => break,
                        ConnectionStatus::Errored => {
                            exit = ExitCode::FAILURE;
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let _ = handle.disconnect().await;
    cancel.cancel();
    if let Err(e) = task.await {
        log::error!("Session loop task failed: {}", e);
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_runs_conversation() {
        assert!(run_key_command(&[]).is_none());
    }

    #[test]
    fn test_unknown_argument_fails() {
        let args = vec!["--bogus".to_string()];
        assert_eq!(run_key_command(&args), Some(ExitCode::FAILURE));
    }

    #[test]
    fn test_store_key_without_value_fails() {
        let args = vec!["--store-key".to_string()];
        assert_eq!(run_key_command(&args), Some(ExitCode::FAILURE));
    }
}
