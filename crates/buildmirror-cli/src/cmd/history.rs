use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_rule, render_mode};
use anyhow::Result;
use buildmirror_core::model::BuildRef;
use clap::Args;
use std::io::Write;

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Only builds of this build type.
    #[arg(long)]
    pub build_type: Option<String>,

    /// Only builds of this branch; `<default>` means `refs/heads/master`.
    #[arg(long)]
    pub branch: Option<String>,

    /// Show the newest N builds.
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,
}

/// Execute `bmirror history`: list stored build references, newest first.
///
/// # Errors
///
/// Returns an error if the mirror cannot be opened or read.
pub fn run_history(args: &HistoryArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let mut refs = mirror
        .sync
        .get_build_history(args.build_type.as_deref(), args.branch.as_deref())?;
    refs.reverse();
    if let Some(limit) = args.limit {
        refs.truncate(limit);
    }

    render_mode(
        output,
        &refs,
        |refs, w| {
            for r in refs {
                writeln!(
                    w,
                    "{}\t{}\t{}\t{}\t{}",
                    r.id,
                    r.state.as_str(),
                    r.status.as_deref().unwrap_or("-"),
                    r.build_type_id,
                    r.branch_name.as_deref().unwrap_or("-")
                )?;
            }
            Ok(())
        },
        |refs, w| render_pretty(refs, w),
    )
}

fn render_pretty(refs: &[BuildRef], w: &mut dyn Write) -> std::io::Result<()> {
    if refs.is_empty() {
        return writeln!(w, "No builds stored. Run `bmirror sync` first.");
    }
    writeln!(w, "{:>10}  {:<9} {:<9} {:<28} BRANCH", "ID", "STATE", "STATUS", "BUILD TYPE")?;
    pretty_rule(w)?;
    for r in refs {
        writeln!(
            w,
            "{:>10}  {:<9} {:<9} {:<28} {}",
            r.id,
            r.state.as_str(),
            r.status.as_deref().unwrap_or("-"),
            r.build_type_id,
            r.branch_name.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}
