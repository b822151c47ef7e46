use super::{GlobalOpts, Mirror};
use crate::output::{OutputMode, format_millis, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use buildmirror_core::model::remote::TEST_SUCCESS;
use buildmirror_core::model::{BuildSnapshot, TestOccurrence};
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Build id on the server.
    pub id: u32,

    /// Include every test occurrence, not only failures.
    #[arg(long)]
    pub all_tests: bool,
}

#[derive(Debug, Serialize)]
struct ShowReport {
    revision: u64,
    entity_version: u16,
    build: BuildSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_time_ms: Option<i64>,
    problems: ProblemFlags,
    test_count: usize,
    tests: Vec<TestOccurrence>,
    valid: bool,
}

#[derive(Debug, Serialize)]
#[allow(clippy::struct_excessive_bools)]
struct ProblemFlags {
    timeout: bool,
    jvm_crash: bool,
    oome: bool,
    exit_code: bool,
    critical: bool,
    suite_incomplete: bool,
}

/// Execute `bmirror show <id>`: the stored full build, fetched first when
/// missing or written by an older entity version.
///
/// # Errors
///
/// Returns an error if the build is neither stored nor loadable.
pub fn run_show(args: &ShowArgs, opts: &GlobalOpts, output: OutputMode) -> Result<()> {
    let mirror = Mirror::open(opts)?;
    let sync = &mirror.sync;
    let build = sync
        .get_fat_build(args.id)
        .with_context(|| format!("show build {}", args.id))?;
    let compactor = sync.stores().compactor.as_ref();

    let tests = build.test_page(compactor).tests;
    let test_count = tests.len();
    let tests = tests
        .into_iter()
        .filter(|t| args.all_tests || t.status != TEST_SUCCESS)
        .collect();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let report = ShowReport {
        revision: build.revision,
        entity_version: build.entity_version,
        running_time_ms: build.running_time(now_ms),
        problems: ProblemFlags {
            timeout: build.has_timeout_problem(compactor),
            jvm_crash: build.has_jvm_crash_problem(compactor),
            oome: build.has_oome_problem(compactor),
            exit_code: build.has_exit_code_problem(compactor),
            critical: build.has_critical_problem(compactor),
            suite_incomplete: build.has_suite_incomplete_failure(compactor),
        },
        build: build.to_snapshot(compactor),
        test_count,
        tests,
        valid: sync.build_is_valid(args.id)?,
    };

    render_mode(
        output,
        &report,
        |r, w| {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\trev {}\ttests {}",
                r.build.id,
                r.build.state.as_str(),
                r.build.status.as_deref().unwrap_or("-"),
                r.build.build_type_id,
                r.revision,
                r.test_count
            )?;
            for t in &r.tests {
                writeln!(w, "{}\t{}", t.status, t.name)?;
            }
            Ok(())
        },
        render_pretty,
    )
}

fn render_pretty(r: &ShowReport, w: &mut dyn Write) -> std::io::Result<()> {
    let b = &r.build;
    pretty_section(w, &format!("Build {}", b.id))?;
    pretty_kv(w, "Build type", &b.build_type_id)?;
    pretty_kv(w, "Branch", b.branch_name.as_deref().unwrap_or("-"))?;
    pretty_kv(w, "State", b.state.as_str())?;
    pretty_kv(w, "Status", b.status.as_deref().unwrap_or("-"))?;
    pretty_kv(w, "Started", format_millis(b.start_date))?;
    pretty_kv(w, "Finished", format_millis(b.finish_date))?;
    if let Some(ms) = r.running_time_ms {
        pretty_kv(w, "Duration", format!("{}s", ms / 1000))?;
    }
    pretty_kv(w, "Revision", r.revision.to_string())?;
    if b.fake_stub {
        pretty_kv(w, "Note", "unknown to the server; stored as a stub")?;
    } else if b.cancelled {
        pretty_kv(w, "Note", "vanished from the server while active")?;
    }
    if !r.valid {
        pretty_kv(w, "Validity", "marked invalid")?;
    }
    if r.problems.suite_incomplete {
        let kind = if r.problems.timeout {
            "execution timeout"
        } else if r.problems.jvm_crash {
            "JVM crash"
        } else if r.problems.oome {
            "out of memory"
        } else {
            "non-zero exit code"
        };
        pretty_kv(w, "Problem", kind)?;
    }
    writeln!(w)?;
    pretty_section(w, &format!("Tests ({} stored)", r.test_count))?;
    if r.tests.is_empty() {
        writeln!(w, "  no failed tests")?;
    }
    for t in &r.tests {
        let marker = if t.muted { " (muted)" } else { "" };
        writeln!(w, "  {:<8} {}{marker}", t.status, t.name)?;
    }
    Ok(())
}
