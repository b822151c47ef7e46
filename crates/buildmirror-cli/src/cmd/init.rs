use super::GlobalOpts;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use buildmirror_core::config::{MirrorConfig, default_config_path};
use buildmirror_core::db::MirrorDb;
use clap::Args;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Also write a config file with every default spelled out, unless one exists.
    #[arg(long)]
    pub write_config: bool,
}

#[derive(Debug, Serialize)]
struct InitReport {
    path: String,
    created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_written: Option<String>,
}

/// Execute `bmirror init`: create the mirror database and migrate it to the
/// latest schema. Running it against an existing database only migrates.
///
/// # Errors
///
/// Returns an error if the config is invalid or the database cannot be
/// created or migrated.
pub fn run_init(args: &InitArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let config = opts.load_config()?;
    let path = config.storage.path;
    let created = !path.exists();
    MirrorDb::open(&path)?;
    tracing::info!(path = %path.display(), created, "mirror database ready");

    let config_written = if args.write_config {
        write_default_config(opts.config.clone().or_else(default_config_path))?
    } else {
        None
    };

    let report = InitReport {
        path: path.display().to_string(),
        created,
        config_written,
    };
    render_mode(
        output,
        &report,
        |r, w| writeln!(w, "{}\t{}", r.path, if r.created { "created" } else { "existing" }),
        |r, w| {
            pretty_section(w, "Mirror database")?;
            pretty_kv(w, "Path", &r.path)?;
            pretty_kv(w, "Status", if r.created { "created" } else { "already initialized" })?;
            if let Some(config) = &r.config_written {
                pretty_kv(w, "Config", config)?;
            }
            writeln!(w)?;
            writeln!(w, "Next: bmirror sync --full")
        },
    )
}

/// Returns the written path; an existing file is left untouched.
fn write_default_config(path: Option<PathBuf>) -> Result<Option<String>> {
    let Some(path) = path else {
        anyhow::bail!("no config location; pass --config <PATH>");
    };
    if path.exists() {
        return Ok(None);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config directory {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(&MirrorConfig::default()).context("render default config")?;
    std::fs::write(&path, text).with_context(|| format!("write config {}", path.display()))?;
    Ok(Some(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::write_default_config;
    use buildmirror_core::config::{MirrorConfig, load_config};

    #[test]
    fn default_config_round_trips_and_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/config.toml");
        let written = write_default_config(Some(path.clone())).expect("write");
        assert!(written.is_some());
        assert_eq!(load_config(&path).expect("load"), MirrorConfig::default());

        std::fs::write(&path, "[sync]\nproactive_lanes = 2\n").expect("edit");
        assert!(write_default_config(Some(path.clone())).expect("write").is_none());
        assert_eq!(load_config(&path).expect("load").sync.proactive_lanes, 2);
    }
}
