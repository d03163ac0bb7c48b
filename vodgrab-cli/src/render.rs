use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::warn;
use vodgrab_engine::ProgressSnapshot;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}";

/// One-line status next to the bar.
pub fn status_line(snapshot: &ProgressSnapshot) -> String {
    let mut line = format!(
        "dl {:.0} KB/s, wr {:.0} KB/s, buffered {}",
        snapshot.download_speed_kbps,
        snapshot.write_speed_kbps,
        snapshot
            .chunks_downloaded
            .saturating_sub(snapshot.chunks_written)
    );
    match (snapshot.active_speed_limit, snapshot.target_percent) {
        (Some(kbps), Some(percent)) => line.push_str(&format!(", limit {kbps} KB/s ({percent}%)")),
        (Some(kbps), None) => line.push_str(&format!(", limit {kbps} KB/s")),
        _ => {}
    }
    if snapshot.measuring {
        line.push_str(", measuring");
    }
    if snapshot.paused {
        line.push_str(", PAUSED");
    }
    line
}

/// Consumes snapshots until the engine drops its sender.
pub async fn render_progress(mut snapshots: mpsc::Receiver<ProgressSnapshot>, json: bool) {
    if json {
        while let Some(snapshot) = snapshots.recv().await {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize progress"),
            }
        }
        return;
    }

    let bar = ProgressBar::new(0);
    match ProgressStyle::with_template(BAR_TEMPLATE) {
        Ok(style) => bar.set_style(style.progress_chars("=> ")),
        Err(e) => warn!(error = %e, "Invalid progress template"),
    }
    while let Some(snapshot) = snapshots.recv().await {
        bar.set_length(snapshot.chunks_total);
        bar.set_position(snapshot.chunks_written);
        bar.set_message(status_line(&snapshot));
    }
    bar.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn snapshot() -> ProgressSnapshot {
        ProgressSnapshot {
            target_file: PathBuf::from("vod.mp4"),
            seconds_elapsed: 3.0,
            chunks_total: 100,
            chunks_downloaded: 14,
            chunks_written: 10,
            download_speed_kbps: 2048.4,
            write_speed_kbps: 1900.0,
            paused: false,
            active_speed_limit: None,
            target_percent: None,
            measuring: false,
        }
    }

    #[test]
    fn status_without_limit() {
        assert_eq!(
            status_line(&snapshot()),
            "dl 2048 KB/s, wr 1900 KB/s, buffered 4"
        );
    }

    #[test]
    fn status_shows_variable_limit_and_flags() {
        let mut s = snapshot();
        s.active_speed_limit = Some(4096);
        s.target_percent = Some(50);
        s.measuring = true;
        s.paused = true;
        assert_eq!(
            status_line(&s),
            "dl 2048 KB/s, wr 1900 KB/s, buffered 4, limit 4096 KB/s (50%), measuring, PAUSED"
        );
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let value = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(value["chunks_total"], 100);
        assert_eq!(value["target_file"], "vod.mp4");
        assert!(value["active_speed_limit"].is_null());
    }
}
