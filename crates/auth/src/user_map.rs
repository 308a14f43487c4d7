use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;

use crate::AuthError;

const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Parses `<provider user> <local user>` lines. `#` starts a comment line and
/// malformed lines are skipped.
pub fn parse_user_table(contents: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut entries = line.split_whitespace();
        match (entries.next(), entries.next(), entries.next()) {
            (Some(remote), Some(local), None) => {
                table.insert(remote.to_string(), local.to_string());
            }
            _ => tracing::warn!("Ignoring malformed usermap line: {line}"),
        }
    }
    table
}

/// Maps an identity provider's username onto a local OS username. Shared
/// between clones; `watch` swaps the table wholesale when the file changes.
#[derive(Clone, Debug)]
pub struct UserMap {
    path: Option<PathBuf>,
    table: Arc<RwLock<HashMap<String, String>>>,
}

impl UserMap {
    pub fn from_table(table: HashMap<String, String>) -> Self {
        Self {
            path: None,
            table: Arc::new(RwLock::new(table)),
        }
    }

    #[tracing::instrument(err)]
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            AuthError::Config(format!("unable to read user table {}: {err}", path.display()))
        })?;
        let table = parse_user_table(&contents);
        tracing::info!("Loaded {} entries from user table {}", table.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            table: Arc::new(RwLock::new(table)),
        })
    }

    pub fn lookup(&self, username: &str) -> Option<String> {
        self.table
            .read()
            .ok()
            .and_then(|table| table.get(username).cloned())
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|table| table.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modified(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// Re-reads the file from disk and replaces the table.
    pub fn reload(&self) -> Result<(), AuthError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = std::fs::read_to_string(path).map_err(|err| {
            AuthError::Config(format!("unable to read user table {}: {err}", path.display()))
        })?;
        let table = parse_user_table(&contents);
        if let Ok(mut current) = self.table.write() {
            *current = table;
        }
        Ok(())
    }

    /// Polls the file's modification time and reloads on change.
    pub fn watch(&self) -> Option<JoinHandle<()>> {
        self.watch_every(RELOAD_POLL_INTERVAL)
    }

    pub fn watch_every(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let path = self.path.clone()?;
        let map = self.clone();
        Some(tokio::spawn(async move {
            let mut last_modified = Self::modified(&path);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let modified = Self::modified(&path);
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                match map.reload() {
                    Ok(()) => tracing::info!(
                        "Reloaded user table {} ({} entries)",
                        path.display(),
                        map.len()
                    ),
                    Err(err) => tracing::error!("{err:?}"),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_table() {
        let table = parse_user_table(
            "# upstream local\nalice@example.org alice\n\nbroken-line\nbob  bobby\nthree fields here\n",
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table["alice@example.org"], "alice");
        assert_eq!(table["bob"], "bobby");
    }

    #[tokio::test]
    async fn reloads_on_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice a1").unwrap();
        let map = UserMap::load(file.path()).unwrap();
        assert_eq!(map.lookup("alice").as_deref(), Some("a1"));
        let handle = map.watch_every(Duration::from_millis(20)).unwrap();

        // Filesystems with coarse mtimes need the write to land in a new tick.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(file.path(), "alice a2\ncarol c\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(map.lookup("alice").as_deref(), Some("a2"));
        assert_eq!(map.lookup("carol").as_deref(), Some("c"));
        handle.abort();
    }
}
