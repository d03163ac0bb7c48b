use clap::Parser;
use std::path::PathBuf;
use url::Url;
use vodgrab_engine::config::DEFAULT_THREAD_COUNT;

use crate::error::AppError;

/// Download a segmented VOD playlist into one file per discontinuity group.
///
/// While running: `p` pause/resume, `f` fixed speed limit, `v` variable
/// speed limit, `+`/`-` adjust the active limit.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Media playlist URL or path to a local .m3u8 file
    pub playlist: String,

    /// Output file; several groups produce name.1.ext, name.2.ext, ...
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of parallel chunk downloads
    #[arg(short, long, default_value_t = DEFAULT_THREAD_COUNT)]
    pub threads: usize,

    /// Start with a fixed speed limit in KB/s
    #[arg(short, long, value_name = "KBPS", conflicts_with = "variable")]
    pub limit: Option<u32>,

    /// Start with the variable speed limit (share of probed bandwidth)
    #[arg(long)]
    pub variable: bool,

    /// Groups with fewer segments are skipped
    #[arg(long, default_value_t = 2)]
    pub min_group_len: usize,

    /// Keep `-unmuted.ts` segment names as listed
    #[arg(long)]
    pub no_muted_rewrite: bool,

    /// Base URL for segments of a local playlist file
    #[arg(long)]
    pub base_url: Option<Url>,

    /// Print progress as JSON lines instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

/// Where the playlist comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistInput {
    Remote(Url),
    Local { path: PathBuf, base_url: Url },
}

impl Args {
    pub fn playlist_input(&self) -> Result<PlaylistInput, AppError> {
        if let Ok(url) = Url::parse(&self.playlist)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(PlaylistInput::Remote(url));
        }

        let base_url = self.base_url.clone().ok_or_else(|| {
            AppError::InvalidInput("a local playlist needs --base-url".to_string())
        })?;
        Ok(PlaylistInput::Local {
            path: PathBuf::from(&self.playlist),
            base_url: directory_url(base_url),
        })
    }
}

/// Segment names are relative to the base, so it must end in a slash.
fn directory_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
