// Command Channel: runtime control surface over the pause gate and the
// allowance distributor. Never touches the backlog or the reassembly buffer.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SpeedLimitConfig;
use crate::error::DownloadError;
use crate::fetcher::PauseGate;
use crate::throttle::{SpeedLimit, Throttle};

/// Discrete operator commands, e.g. mapped from key presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderCommand {
    TogglePause,
    /// Enables the fixed limit at its default rate, or disables it if active
    ToggleFixedSpeedLimit,
    /// Enables the variable limit at its default share, or disables it if active
    ToggleVariableSpeedLimit,
    IncreaseSpeedLimit,
    DecreaseSpeedLimit,
}

/// Cloneable handle for pausing and throttling a running download.
#[derive(Clone)]
pub struct DownloadController {
    pause: Arc<PauseGate>,
    throttle: Arc<Throttle>,
    default_kbps: u32,
    default_percent: u8,
}

impl DownloadController {
    pub(crate) fn new(
        pause: Arc<PauseGate>,
        throttle: Arc<Throttle>,
        config: &SpeedLimitConfig,
    ) -> Self {
        Self {
            pause,
            throttle,
            default_kbps: config.default_kbps,
            default_percent: config.default_percent,
        }
    }

    pub fn pause(&self) -> Result<(), DownloadError> {
        self.pause.pause()?;
        debug!("Download paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DownloadError> {
        self.pause.resume()?;
        debug!("Download resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn enable_fixed_limit(&self, kbps: u32) {
        self.throttle.enable_fixed(kbps);
    }

    pub fn enable_variable_limit(&self, percent: u8) {
        self.throttle.enable_variable(percent);
    }

    pub fn disable_limit(&self) {
        self.throttle.disable();
    }

    pub fn increase_limit(&self) -> SpeedLimit {
        self.throttle.increase()
    }

    pub fn decrease_limit(&self) -> SpeedLimit {
        self.throttle.decrease()
    }

    pub fn speed_limit(&self) -> SpeedLimit {
        self.throttle.speed_limit()
    }

    pub fn apply(&self, command: DownloaderCommand) -> Result<(), DownloadError> {
        match command {
            DownloaderCommand::TogglePause => {
                if self.is_paused() {
                    self.resume()
                } else {
                    self.pause()
                }
            }
            DownloaderCommand::ToggleFixedSpeedLimit => {
                match self.speed_limit() {
                    SpeedLimit::Fixed { .. } => self.disable_limit(),
                    _ => self.enable_fixed_limit(self.default_kbps),
                }
                Ok(())
            }
            DownloaderCommand::ToggleVariableSpeedLimit => {
                match self.speed_limit() {
                    SpeedLimit::Variable { .. } => self.disable_limit(),
                    _ => self.enable_variable_limit(self.default_percent),
                }
                Ok(())
            }
            DownloaderCommand::IncreaseSpeedLimit => {
                let limit = self.increase_limit();
                debug!(?limit, "Speed limit increased");
                Ok(())
            }
            DownloaderCommand::DecreaseSpeedLimit => {
                let limit = self.decrease_limit();
                debug!(?limit, "Speed limit decreased");
                Ok(())
            }
        }
    }
}

/// Applies commands from `commands` until shutdown or the sender is dropped.
pub(crate) async fn run_commands(
    controller: DownloadController,
    mut commands: mpsc::Receiver<DownloaderCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        if let Err(e) = controller.apply(command) {
            warn!(?command, error = %e, "Command rejected");
        }
    }
}
