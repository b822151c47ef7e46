use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::Result;
use buildmirror_core::model::BuildCondition;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct ConditionArgs {
    #[command(subcommand)]
    pub command: ConditionCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConditionCommand {
    /// Show the recorded judgment of a build.
    Get {
        id: u32,
    },
    /// Record whether a build should be used in reports.
    Set {
        id: u32,
        /// Mark the build invalid (default marks it valid).
        #[arg(long)]
        invalid: bool,
        /// Who made the judgment.
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct ConditionReport {
    build_id: u32,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<BuildCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed: Option<bool>,
}

/// Execute `bmirror condition get|set`.
///
/// # Errors
///
/// Returns an error if the mirror cannot be opened or the store fails.
pub fn run_condition(args: &ConditionArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let sync = &mirror.sync;

    let report = match &args.command {
        ConditionCommand::Get { id } => ConditionReport {
            build_id: *id,
            valid: sync.build_is_valid(*id)?,
            condition: sync.get_build_condition(*id)?,
            changed: None,
        },
        ConditionCommand::Set {
            id,
            invalid,
            by,
            reason,
        } => {
            let changed = sync.set_build_condition(BuildCondition {
                build_id: *id,
                principal: by.clone(),
                is_valid: !invalid,
                reason: reason.clone(),
                recorded_at: None,
            })?;
            ConditionReport {
                build_id: *id,
                valid: !invalid,
                condition: sync.get_build_condition(*id)?,
                changed: Some(changed),
            }
        }
    };

    render_mode(
        output,
        &report,
        |r, w| {
            let by = r.condition.as_ref().map_or("-", |c| c.principal.as_str());
            writeln!(w, "{}\t{}\t{by}", r.build_id, if r.valid { "valid" } else { "invalid" })
        },
        |r, w| {
            pretty_section(w, &format!("Build {} condition", r.build_id))?;
            pretty_kv(w, "Valid", if r.valid { "yes" } else { "no" })?;
            match &r.condition {
                Some(c) => {
                    pretty_kv(w, "By", &c.principal)?;
                    pretty_kv(w, "Reason", c.reason.as_deref().unwrap_or("-"))?;
                    if let Some(at) = c.recorded_at {
                        pretty_kv(w, "Recorded", at.to_rfc3339())?;
                    }
                }
                None => pretty_kv(w, "Recorded", "never judged; valid by default")?,
            }
            if r.changed == Some(false) {
                writeln!(w, "(unchanged)")?;
            }
            Ok(())
        },
    )
}
