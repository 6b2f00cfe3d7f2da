//! Restart verification using marker files

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Shell snippets that leave a trace on disk, and checks for that trace.
#[derive(Clone)]
pub struct MarkerFileHelper {
    base_dir: PathBuf,
}

impl MarkerFileHelper {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.marker", name))
    }

    /// A script that appends one line to the marker each time it runs
    pub fn append_script(&self, name: &str) -> String {
        format!("echo ran >> {}", self.marker_path(name).display())
    }

    pub fn marker_exists(&self, name: &str) -> bool {
        self.marker_path(name).exists()
    }

    /// How many times an `append_script` ran
    pub fn count_marker_lines(&self, name: &str) -> usize {
        std::fs::read_to_string(self.marker_path(name))
            .map(|content| content.lines().count())
            .unwrap_or(0)
    }

    /// Wait for a marker file to appear
    pub async fn wait_for_marker(&self, name: &str, timeout: Duration) -> bool {
        let marker_path = self.marker_path(name);
        let start = Instant::now();

        while start.elapsed() < timeout {
            if marker_path.exists() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }
}
