use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use buildmirror_core::sync::{ActualizeReport, LoadReport};
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Walk the whole history instead of stopping at the first unchanged page.
    #[arg(long)]
    pub full: bool,

    /// Only index references; leave full builds for a later run.
    #[arg(long)]
    pub no_load: bool,
}

#[derive(Debug, Serialize)]
struct SyncSummary {
    server: String,
    database: String,
    mode: &'static str,
    walk: ActualizeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    load: Option<LoadReport>,
    pending_loads: usize,
    /// Follow-up tasks queued by the walk that this run does not execute.
    deferred: Vec<String>,
}

/// Execute `bmirror sync`.
///
/// The incremental walk also reloads queued and running builds; the walk's
/// follow-up schedules are dropped when the command exits.
///
/// # Errors
///
/// Returns an error if the mirror cannot be opened or the walk fails.
pub fn run_sync(args: &SyncArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let sync = &mirror.sync;

    let walk = if args.full {
        sync.full_reindex()
    } else {
        sync.actualize_recent_builds()
    }
    .with_context(|| format!("sync server '{}'", sync.server_id()))?;

    let load = (!args.no_load).then(|| sync.load_all_pending());

    let summary = SyncSummary {
        server: sync.server_id().to_string(),
        database: mirror.db_path.display().to_string(),
        mode: if args.full { "full" } else { "incremental" },
        walk,
        load,
        pending_loads: sync.pending_loads(),
        deferred: mirror.scheduler.pending_names(),
    };
    render_mode(
        output,
        &summary,
        |s, w| {
            writeln!(w, "walk\t{}", s.walk)?;
            if let Some(load) = &s.load {
                writeln!(w, "load\t{load}")?;
            }
            Ok(())
        },
        |s, w| {
            pretty_section(w, &format!("Sync {} ({})", s.server, s.mode))?;
            pretty_kv(w, "Database", &s.database)?;
            pretty_kv(w, "Pages", s.walk.pages.to_string())?;
            pretty_kv(w, "Checked", s.walk.checked.to_string())?;
            pretty_kv(w, "Saved", s.walk.saved.to_string())?;
            if s.walk.interrupted {
                pretty_kv(w, "Interrupted", "yes")?;
            }
            match &s.load {
                Some(load) => {
                    pretty_kv(w, "Loaded", format!("{} of {}", load.updated, load.requested))?;
                    pretty_kv(w, "Load errors", load.errors.to_string())?;
                }
                None => pretty_kv(w, "Pending", s.pending_loads.to_string())?,
            }
            if !s.deferred.is_empty() {
                pretty_kv(w, "Deferred", s.deferred.join(", "))?;
            }
            Ok(())
        },
    )
}
