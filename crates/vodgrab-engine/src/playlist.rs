// Playlist extraction: turns a media playlist into ordered chunk URL groups,
// one group per discontinuity-delimited run of segments.

use m3u8_rs::{Playlist, parse_playlist_res};
use reqwest::Client;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::DownloadError;

const UNMUTED_SUFFIX: &str = "unmuted.ts";
const MUTED_SUFFIX: &str = "muted.ts";

#[derive(Debug, Clone)]
pub struct PlaylistOptions {
    /// Point `*-unmuted.ts` segments at their `*-muted.ts` variant, which is
    /// the one still served for VODs with muted audio.
    pub rewrite_muted: bool,
}

impl Default for PlaylistOptions {
    fn default() -> Self {
        Self {
            rewrite_muted: true,
        }
    }
}

/// Parses a media playlist into groups of absolute segment URLs. A new group
/// starts at every `#EXT-X-DISCONTINUITY`.
pub fn parse_segment_groups(
    content: &[u8],
    base_url: &Url,
    options: &PlaylistOptions,
) -> Result<Vec<Vec<String>>, DownloadError> {
    let playlist = match parse_playlist_res(content) {
        Ok(Playlist::MediaPlaylist(playlist)) => playlist,
        Ok(Playlist::MasterPlaylist(_)) => {
            return Err(DownloadError::playlist(
                "expected a media playlist, got a master playlist",
            ));
        }
        Err(e) => {
            return Err(DownloadError::playlist(format!(
                "failed to parse playlist: {e}"
            )));
        }
    };

    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    for segment in &playlist.segments {
        if segment.discontinuity && groups.last().is_some_and(|g| !g.is_empty()) {
            groups.push(Vec::new());
        }

        let uri = segment.uri.trim();
        let uri = if options.rewrite_muted && uri.ends_with(UNMUTED_SUFFIX) {
            let stem = &uri[..uri.len() - UNMUTED_SUFFIX.len()];
            format!("{stem}{MUTED_SUFFIX}")
        } else {
            uri.to_string()
        };
        let resolved = base_url.join(&uri).map_err(|e| {
            DownloadError::playlist(format!("invalid segment URI {uri}: {e}"))
        })?;
        trace!(%resolved, "Resolved segment URI");
        if let Some(group) = groups.last_mut() {
            group.push(resolved.to_string());
        }
    }
    groups.retain(|g| !g.is_empty());

    debug!(
        groups = groups.len(),
        segments = groups.iter().map(Vec::len).sum::<usize>(),
        "Parsed media playlist"
    );
    Ok(groups)
}

/// Drops groups with fewer than `min_len` segments. Single-segment groups
/// are usually inserted artifacts rather than content.
pub fn retain_content_groups(groups: Vec<Vec<String>>, min_len: usize) -> Vec<Vec<String>> {
    groups
        .into_iter()
        .enumerate()
        .filter_map(|(index, group)| {
            if group.len() < min_len {
                warn!(
                    group = index,
                    segments = group.len(),
                    min_len,
                    "Dropping short segment group"
                );
                None
            } else {
                Some(group)
            }
        })
        .collect()
}

/// Downloads the playlist document.
pub async fn fetch_playlist(client: &Client, url: &Url) -> Result<Vec<u8>, DownloadError> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::from_status(status, url.as_str()));
    }
    let body = response.bytes().await?;
    debug!(%url, bytes = body.len(), "Fetched playlist");
    Ok(body.to_vec())
}

/// Fetches and parses a remote playlist, resolving segments against its URL.
pub async fn load_segment_groups(
    client: &Client,
    url: &Url,
    options: &PlaylistOptions,
) -> Result<Vec<Vec<String>>, DownloadError> {
    let content = fetch_playlist(client, url).await?;
    parse_segment_groups(&content, url, options)
}
