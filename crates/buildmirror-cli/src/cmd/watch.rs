use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use buildmirror_core::scheduler::ThreadScheduler;
use buildmirror_core::sync::{ActualizeReport, LoadReport};
use clap::Args;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between incremental walks.
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    pub interval: u64,

    /// Stop after this many walks; run until killed when unset.
    #[arg(long, value_name = "N")]
    pub cycles: Option<u32>,

    /// Worker threads running proactive loads and reindexes.
    #[arg(long, default_value_t = 2)]
    pub workers: usize,
}

#[derive(Debug, Default, Serialize)]
struct WatchSummary {
    server: String,
    cycles: u32,
    failed_cycles: u32,
    /// Walk totals over every successful cycle.
    saved: usize,
    pages: usize,
    /// Background tasks still waiting at exit; they were dropped.
    dropped_tasks: usize,
    /// Loads left in the lanes at exit, run before returning.
    final_load: LoadReport,
}

impl WatchSummary {
    fn add_walk(&mut self, walk: &ActualizeReport) {
        self.saved += walk.saved;
        self.pages += walk.pages;
    }
}

/// Execute `bmirror watch`: keep the mirror current with periodic walks.
///
/// Proactive loads and full reindexes run on a thread pool between walks.
/// On exit the pool is stopped and whatever is left in the load lanes is
/// loaded inline, so no changed build stays unloaded.
///
/// # Errors
///
/// Returns an error if the mirror cannot be opened or the worker threads
/// cannot be started. Failed walks are logged and retried next cycle.
pub fn run_watch(args: &WatchArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let scheduler =
        Arc::new(ThreadScheduler::start(args.workers).context("start background workers")?);
    let mirror = Mirror::open_with(opts, scheduler)?;
    let sync = &mirror.sync;

    let mut summary = WatchSummary {
        server: sync.server_id().to_string(),
        ..WatchSummary::default()
    };
    loop {
        summary.cycles += 1;
        match sync.actualize_recent_builds() {
            Ok(walk) => {
                info!(server = %summary.server, cycle = summary.cycles, %walk, "walk finished");
                summary.add_walk(&walk);
            }
            Err(err) => {
                summary.failed_cycles += 1;
                warn!(server = %summary.server, cycle = summary.cycles, error = %err, "walk failed");
            }
        }
        if args.cycles.is_some_and(|limit| summary.cycles >= limit) {
            break;
        }
        thread::sleep(Duration::from_secs(args.interval));
    }

    summary.dropped_tasks = mirror.scheduler.pending();
    mirror.scheduler.shutdown();
    summary.final_load = sync.load_all_pending();

    render_mode(
        output,
        &summary,
        |s, w| {
            writeln!(
                w,
                "cycles\t{}\tfailed\t{}\tsaved\t{}\tpages\t{}",
                s.cycles, s.failed_cycles, s.saved, s.pages
            )?;
            writeln!(w, "load\t{}", s.final_load)
        },
        |s, w| {
            pretty_section(w, &format!("Watch {}", s.server))?;
            pretty_kv(w, "Cycles", format!("{} ({} failed)", s.cycles, s.failed_cycles))?;
            pretty_kv(w, "Pages", s.pages.to_string())?;
            pretty_kv(w, "Saved", s.saved.to_string())?;
            pretty_kv(w, "Final load", s.final_load.to_string())?;
            if s.dropped_tasks > 0 {
                pretty_kv(w, "Dropped", s.dropped_tasks.to_string())?;
            }
            Ok(())
        },
    )
}
