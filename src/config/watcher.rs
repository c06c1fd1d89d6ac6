//! Configuration and certificate watcher for hot reload.
//!
//! Watches the directories holding the config file and every PEM file it
//! references, so editors that replace files by rename are still seen. Each
//! relevant change reloads and re-validates the config; only valid configs
//! are pushed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::PortshareConfig;

/// A watcher that monitors the configuration file and its PEM files.
pub struct ConfigWatcher {
    path: PathBuf,
    files: BTreeSet<PathBuf>,
    update_tx: mpsc::UnboundedSender<PortshareConfig>,
}

impl ConfigWatcher {
    /// Create a watcher for `path` and the PEM files `config` references.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, config: &PortshareConfig) -> (Self, mpsc::UnboundedReceiver<PortshareConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let files = std::iter::once(path.to_path_buf())
            .chain(config.pem_paths())
            .map(|p| absolute(&p))
            .collect();

        (
            Self {
                path: path.to_path_buf(),
                files,
                update_tx,
            },
            update_rx,
        )
    }

    /// Files whose changes trigger a reload.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    fn is_relevant(&self, event: &Event) -> bool {
        (event.kind.is_modify() || event.kind.is_create())
            && event.paths.iter().any(|p| self.files.contains(&absolute(p)))
    }

    /// Start watching in notify's background thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let directories: BTreeSet<PathBuf> = self
            .files
            .iter()
            .filter_map(|f| f.parent().map(Path::to_path_buf))
            .collect();

        let path = self.path.clone();
        let watched = self;
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if watched.is_relevant(&event) => {
                    tracing::info!(paths = ?event.paths, "Config change detected, reloading...");
                    match load_config(&watched.path) {
                        Ok(new_config) => {
                            let _ = watched.update_tx.send(new_config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config. Keeping current configuration.");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for directory in &directories {
            watcher.watch(directory, RecursiveMode::NonRecursive)?;
        }

        tracing::info!(path = ?path, directories = directories.len(), "Config watcher started");
        Ok(watcher)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{KeyCertOptions, ListenerConfig, PemSource};
    use notify::event::{CreateKind, EventKind, ModifyKind};

    fn config_with_cert(cert: &Path) -> PortshareConfig {
        let mut listener = ListenerConfig::default();
        listener.options.ssl = true;
        listener.options.tls.key_certs.push(KeyCertOptions {
            cert: PemSource::Path(cert.to_path_buf()),
            key: PemSource::Inline("inline".into()),
            server_name: None,
        });
        PortshareConfig {
            listeners: vec![listener],
            ..Default::default()
        }
    }

    #[test]
    fn watches_config_and_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("portshare.toml");
        let cert = dir.path().join("server.crt");
        std::fs::write(&config_path, "").unwrap();
        std::fs::write(&cert, "").unwrap();

        let (watcher, _rx) = ConfigWatcher::new(&config_path, &config_with_cert(&cert));
        assert_eq!(watcher.files().count(), 2);

        let touched = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(cert.clone());
        assert!(watcher.is_relevant(&touched));

        let other = Event::new(EventKind::Create(CreateKind::File)).add_path(dir.path().join("notes.txt"));
        assert!(!watcher.is_relevant(&other));

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(cert);
        assert!(!watcher.is_relevant(&access));
    }

    #[tokio::test]
    async fn pushes_valid_config_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("portshare.toml");
        std::fs::write(&config_path, "[client]\nmax_pool_size = 2\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&config_path, &PortshareConfig::default());
        let _guard = watcher.run().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&config_path, "[client]\nmax_pool_size = 7\n").unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(config) if config.client.max_pool_size == 7 => return config,
                    Some(_) => continue,
                    None => panic!("watcher stopped"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated.client.max_pool_size, 7);
    }
}
