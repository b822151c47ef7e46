use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::Result;
use buildmirror_core::sync::LoadReport;
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct OutdatedArgs {
    /// Only count outdated records; do not reload them.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
struct OutdatedReport {
    outdated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    load: Option<LoadReport>,
}

/// Execute `bmirror outdated`: reload every stored build written by an older
/// entity version.
///
/// # Errors
///
/// Returns an error if the mirror cannot be opened or the store scan fails.
pub fn run_outdated(args: &OutdatedArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let sync = &mirror.sync;

    let report = if args.dry_run {
        let server = sync.server();
        OutdatedReport {
            outdated: sync.stores().fat.outdated_version_entries(server)?.len(),
            load: None,
        }
    } else {
        let outdated = sync.schedule_outdated_reload()?;
        OutdatedReport {
            outdated,
            load: Some(sync.load_all_pending()),
        }
    };

    render_mode(
        output,
        &report,
        |r, w| {
            write!(w, "outdated\t{}", r.outdated)?;
            if let Some(load) = &r.load {
                write!(w, "\tupdated\t{}\terrors\t{}", load.updated, load.errors)?;
            }
            writeln!(w)
        },
        |r, w| {
            pretty_section(w, "Outdated builds")?;
            pretty_kv(w, "Outdated", r.outdated.to_string())?;
            if let Some(load) = &r.load {
                pretty_kv(w, "Reloaded", load.updated.to_string())?;
                pretty_kv(w, "Errors", load.errors.to_string())?;
            }
            Ok(())
        },
    )
}
