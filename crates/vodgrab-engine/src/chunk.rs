use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// One independently downloadable segment and its place in the output.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Output file this chunk belongs to
    pub file_index: usize,
    /// Global write position, unique across all groups
    pub sequence_index: u64,
    pub url: String,
    /// Downloaded body; released right after it reaches disk
    pub content: Option<Bytes>,
}

impl Chunk {
    pub fn new(file_index: usize, sequence_index: u64, url: impl Into<String>) -> Self {
        Self {
            file_index,
            sequence_index,
            url: url.into(),
            content: None,
        }
    }
}

/// Flattens ordered URL groups into a globally indexed backlog.
pub fn seed_backlog(groups: &[Vec<String>]) -> VecDeque<Chunk> {
    let mut sequence_index = 0u64;
    let mut backlog = VecDeque::with_capacity(groups.iter().map(Vec::len).sum());
    for (file_index, urls) in groups.iter().enumerate() {
        for url in urls {
            backlog.push_back(Chunk::new(file_index, sequence_index, url.clone()));
            sequence_index += 1;
        }
    }
    backlog
}

/// Output path for a group. A single group keeps `target` untouched, several
/// groups get a 1-based index before the extension (`name.2.mp4`).
pub fn parted_path(target: &Path, file_index: usize, file_count: usize) -> PathBuf {
    if file_count <= 1 {
        return target.to_path_buf();
    }

    let number = file_index + 1;
    let file_name = match (target.file_stem(), target.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            number,
            ext.to_string_lossy()
        ),
        (Some(stem), None) => format!("{}.{}", stem.to_string_lossy(), number),
        _ => format!("{number}"),
    };
    target.with_file_name(file_name)
}
