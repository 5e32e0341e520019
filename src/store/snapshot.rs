use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::leaderboard::BoardState;

/// JSON file holding the persisted leaderboard.
///
/// Writes go to a uniquely named sibling temp file which is then renamed
/// over the target, so readers never see a torn file.
pub struct SnapshotFile {
    path: PathBuf,
    seq: AtomicU64,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is not an error.
    pub fn load(&self) -> io::Result<Option<BoardState>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let state = serde_json::from_slice(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(state))
    }

    pub fn write(&self, state: &BoardState) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
        let tmp = self.temp_path();

        let result = write_synced(&tmp, &data).and_then(|()| fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }

        result
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "leaderboard".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
    }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}
