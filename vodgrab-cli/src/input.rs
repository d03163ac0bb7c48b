use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vodgrab_engine::DownloaderCommand;

/// What a key press asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Command(DownloaderCommand),
    Interrupt,
}

pub fn action_for_key(key: &KeyEvent) -> Option<KeyAction> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return matches!(key.code, KeyCode::Char('c')).then_some(KeyAction::Interrupt);
    }
    let command = match key.code {
        KeyCode::Char('q' | 'Q') => return Some(KeyAction::Interrupt),
        KeyCode::Char('p' | 'P') => DownloaderCommand::TogglePause,
        KeyCode::Char('f' | 'F') => DownloaderCommand::ToggleFixedSpeedLimit,
        KeyCode::Char('v' | 'V') => DownloaderCommand::ToggleVariableSpeedLimit,
        KeyCode::Char('+' | '=') => DownloaderCommand::IncreaseSpeedLimit,
        KeyCode::Char('-' | '_') => DownloaderCommand::DecreaseSpeedLimit,
        _ => return None,
    };
    Some(KeyAction::Command(command))
}

/// Reads key presses in raw mode and forwards them as download commands
/// until `token` is cancelled. Ctrl+C or `q` cancels `interrupt`.
pub async fn input_handler(
    commands: mpsc::Sender<DownloaderCommand>,
    interrupt: CancellationToken,
    token: CancellationToken,
) {
    let reader = tokio::task::spawn_blocking(move || {
        if terminal::enable_raw_mode().is_err() {
            info!("Failed to enable raw mode. Keyboard controls are disabled.");
            return;
        }

        while !token.is_cancelled() {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break,
            }
            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };
            match action_for_key(&key) {
                Some(KeyAction::Command(command)) => {
                    debug!(?command, "Key command");
                    if commands.blocking_send(command).is_err() {
                        break;
                    }
                }
                Some(KeyAction::Interrupt) => {
                    info!("Interrupt requested, stopping download");
                    interrupt.cancel();
                    break;
                }
                None => {}
            }
        }

        if terminal::disable_raw_mode().is_err() {
            info!("Failed to disable raw mode.");
        }
    });
    let _ = reader.await;
}
