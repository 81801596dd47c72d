//! Locate call recordings on disk.
//!
//! Recorders name files after the call's unique id
//! (`1700000000.42.wav`, `out-1001-1700000000.42.gsm`). The first matching
//! file above the size floor wins; smaller files are header-only stubs.

use std::path::PathBuf;
use tracing::{debug, info};

use crate::records::RecordingRef;

#[derive(Debug, Clone)]
pub struct RecordingLocator {
    dirs: Vec<PathBuf>,
    min_size: u64,
}

impl RecordingLocator {
    pub fn new(dirs: Vec<PathBuf>, min_size: u64) -> Self {
        Self { dirs, min_size }
    }

    /// Search the directories in order. Unreadable directories are skipped.
    pub async fn find(&self, unique_id: &str) -> Option<RecordingRef> {
        if unique_id.is_empty() {
            return None;
        }
        for dir in &self.dirs {
            let mut names = match list_files(dir).await {
                Ok(names) => names,
                Err(e) => {
                    debug!("[RECORDING] Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            names.sort();

            for name in names.into_iter().filter(|n| names_call(n, unique_id)) {
                let path = dir.join(&name);
                let size = match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => meta.len(),
                    _ => continue,
                };
                if size <= self.min_size {
                    debug!("[RECORDING] Ignoring stub {} ({} bytes)", name, size);
                    continue;
                }
                let format = name
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .unwrap_or_else(|| "wav".to_string());
                info!("[RECORDING] Linked {} ({} bytes)", name, size);
                return Some(RecordingRef {
                    path,
                    filename: name,
                    size,
                    format,
                });
            }
        }
        None
    }
}

/// `unique_id` appears in `name` as a whole token: at the start or after a
/// `-`/`_`, and followed by `.`, `-`, `_` or the end. `1700000000.4` must not
/// claim `1700000000.42.wav`.
fn names_call(name: &str, unique_id: &str) -> bool {
    name.match_indices(unique_id).any(|(at, _)| {
        let before = name[..at].chars().next_back();
        let after = name[at + unique_id.len()..].chars().next();
        matches!(before, None | Some('-') | Some('_'))
            && matches!(after, None | Some('.') | Some('-') | Some('_'))
    })
}

async fn list_files(dir: &PathBuf) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
