pub mod condition;
pub mod history;
pub mod init;
pub mod outdated;
pub mod show;
pub mod sync;
pub mod trigger;
pub mod watch;

use anyhow::{Context as _, Result, bail};
use buildmirror_core::config::{self, MirrorConfig, ServerConfig};
use buildmirror_core::db::MirrorDb;
use buildmirror_core::remote::replay::DirRemote;
use buildmirror_core::scheduler::{ManualScheduler, Scheduler};
use buildmirror_core::store::Stores;
use buildmirror_core::sync::SyncOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub server: Option<String>,
    pub replay: Option<PathBuf>,
}

impl GlobalOpts {
    /// Load the config file and apply flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is unreadable or invalid.
    pub fn load_config(&self) -> Result<MirrorConfig> {
        let mut config = config::resolve_config(self.config.as_deref())?;
        if let Some(db) = &self.db {
            config.storage.path.clone_from(db);
        }
        Ok(config)
    }
}

/// An opened mirror for one server.
///
/// One-shot commands use a [`ManualScheduler`]: background work is queued
/// and only runs when the command asks for it.
pub struct Mirror<S: Scheduler + 'static = ManualScheduler> {
    pub sync: Arc<SyncOrchestrator>,
    pub scheduler: Arc<S>,
    pub db_path: PathBuf,
}

impl Mirror {
    /// Open an initialized mirror database and the selected server.
    ///
    /// # Errors
    ///
    /// Returns an error if the database was never initialized, cannot be
    /// opened, or no server can be selected.
    pub fn open(opts: &GlobalOpts) -> Result<Self> {
        Self::open_with(opts, Arc::new(ManualScheduler::new()))
    }
}

impl<S: Scheduler + 'static> Mirror<S> {
    /// Open the mirror with background work running on `scheduler`.
    ///
    /// # Errors
    ///
    /// Same as [`Mirror::open`].
    pub fn open_with(opts: &GlobalOpts, scheduler: Arc<S>) -> Result<Self> {
        let config = opts.load_config()?;
        let db_path = config.storage.path.clone();
        if !db_path.exists() {
            bail!(
                "mirror database {} does not exist; run `bmirror init` first",
                db_path.display()
            );
        }
        let server = select_server(&config, opts)?;

        let db = MirrorDb::open(&db_path)?;
        let stores = Stores::open_sqlite(&db).context("open mirror stores")?;
        let remote = Arc::new(DirRemote::new(server.id.clone(), server.replay_dir));
        let sync = SyncOrchestrator::new(
            remote,
            Arc::new(stores),
            scheduler.clone(),
            config.sync,
        );
        Ok(Self {
            sync,
            scheduler,
            db_path,
        })
    }
}

/// Pick the server to mirror.
///
/// `--replay` defines an ad-hoc server (named by `--server`, or `default`).
/// Otherwise `--server` selects a configured one; with no flag the single
/// configured server is used.
fn select_server(config: &MirrorConfig, opts: &GlobalOpts) -> Result<ServerConfig> {
    if let Some(dir) = &opts.replay {
        return Ok(ServerConfig {
            id: opts.server.clone().unwrap_or_else(|| "default".to_string()),
            replay_dir: dir.clone(),
        });
    }
    match (&opts.server, config.servers.as_slice()) {
        (Some(id), _) => config
            .server(id)
            .cloned()
            .with_context(|| format!("server '{id}' is not configured")),
        (None, [only]) => Ok(only.clone()),
        (None, []) => bail!("no server configured; add [[servers]] or pass --replay <DIR>"),
        (None, _) => bail!("several servers configured; choose one with --server <ID>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            replay_dir: PathBuf::from(format!("/captures/{id}")),
        }
    }

    #[test]
    fn single_configured_server_is_default() {
        let config = MirrorConfig {
            servers: vec![server("apache")],
            ..MirrorConfig::default()
        };
        let picked = select_server(&config, &GlobalOpts::default()).expect("server");
        assert_eq!(picked.id, "apache");
    }

    #[test]
    fn several_servers_need_a_choice() {
        let config = MirrorConfig {
            servers: vec![server("apache"), server("private")],
            ..MirrorConfig::default()
        };
        let err = select_server(&config, &GlobalOpts::default()).expect_err("ambiguous");
        assert!(err.to_string().contains("--server"));

        let opts = GlobalOpts {
            server: Some("private".into()),
            ..GlobalOpts::default()
        };
        assert_eq!(select_server(&config, &opts).expect("server").id, "private");

        let opts = GlobalOpts {
            server: Some("missing".into()),
            ..GlobalOpts::default()
        };
        assert!(select_server(&config, &opts).is_err());
    }

    #[test]
    fn replay_flag_defines_ad_hoc_server() {
        let opts = GlobalOpts {
            replay: Some(PathBuf::from("/tmp/capture")),
            ..GlobalOpts::default()
        };
        let picked = select_server(&MirrorConfig::default(), &opts).expect("server");
        assert_eq!(picked.id, "default");
        assert_eq!(picked.replay_dir, PathBuf::from("/tmp/capture"));
    }

    #[test]
    fn db_flag_overrides_storage_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = GlobalOpts {
            config: Some(dir.path().join("absent.toml")),
            db: Some(dir.path().join("m.sqlite3")),
            ..GlobalOpts::default()
        };
        let config = opts.load_config().expect("config");
        assert_eq!(config.storage.path, dir.path().join("m.sqlite3"));
    }
}
