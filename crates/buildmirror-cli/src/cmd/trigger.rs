use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use buildmirror_core::model::BuildRef;
use clap::Args;
use std::io::Write;

#[derive(Args, Debug)]
pub struct TriggerArgs {
    pub build_type: String,

    #[arg(long, default_value = "refs/heads/master")]
    pub branch: String,

    /// Ask for a clean checkout.
    #[arg(long)]
    pub clean: bool,

    /// Put the build at the top of the queue.
    #[arg(long)]
    pub top: bool,
}

/// Execute `bmirror trigger`: queue a build and index it right away.
///
/// # Errors
///
/// Returns an error if the server refuses the build or indexing fails.
pub fn run_trigger(args: &TriggerArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let sync = &mirror.sync;
    let build = sync
        .trigger_build(&args.build_type, &args.branch, args.clean, args.top)
        .with_context(|| format!("trigger {} on {}", args.build_type, args.branch))?;
    let stored = sync.get_build_history(Some(&args.build_type), Some(&args.branch))?;
    let indexed: Option<BuildRef> = stored.into_iter().find(|r| r.id == build.id);
    let result = indexed.unwrap_or_else(|| build.to_ref());

    render_mode(
        output,
        &result,
        |r, w| writeln!(w, "{}\t{}", r.id, r.state.as_str()),
        |r, w| {
            pretty_section(w, &format!("Triggered build {}", r.id))?;
            pretty_kv(w, "Build type", &r.build_type_id)?;
            pretty_kv(w, "Branch", r.branch_name.as_deref().unwrap_or("-"))?;
            pretty_kv(w, "State", r.state.as_str())
        },
    )
}
