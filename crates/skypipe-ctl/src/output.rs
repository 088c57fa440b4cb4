//! Terminal rendering for the ctl surface.
//!
//! Queue and task states get one consistent color wherever they appear:
//! succeeded and active are green, failed and killed red, running cyan,
//! paused and unknown yellow, still-queued states dim. Everything is
//! written through `anstream`, so piped output degrades to plain text and
//! stays script-friendly.

use std::io::Write;

use anstyle::{AnsiColor, Effects, Style};
use skypipe_core::{QueueState, TaskState};

const GOOD: Style = AnsiColor::Green.on_default();
const BAD: Style = AnsiColor::Red.on_default();
const BUSY: Style = AnsiColor::Cyan.on_default();
const STALE: Style = AnsiColor::Yellow.on_default();
const EMPH: Style = Style::new().effects(Effects::BOLD);
const MUTED: Style = Style::new().effects(Effects::DIMMED);

/// Confirmation that a management operation landed.
pub(crate) fn ok(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{GOOD}{msg}{GOOD:#}").ok();
}

/// Operational failure, to stderr with an `error:` prefix (exit code
/// handling lives in `main`).
pub(crate) fn fail(msg: impl std::fmt::Display) {
    let mut err = anstream::stderr().lock();
    writeln!(err, "{BAD}error:{BAD:#} {msg}").ok();
}

/// Non-fatal condition the operator should see.
pub(crate) fn warn(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{STALE}warning:{STALE:#} {msg}").ok();
}

/// One-line heading above a queue or task listing.
pub(crate) fn section(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{EMPH}{msg}{EMPH:#}").ok();
}

/// One row of a listing.
pub(crate) fn row(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "  - {msg}").ok();
}

/// Secondary detail under a heading or row: paths, hints, stderr excerpts.
pub(crate) fn note(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{MUTED}{msg}{MUTED:#}").ok();
}

/// Unstyled passthrough.
pub(crate) fn line(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{msg}").ok();
}

/// A task state word in its listing color.
pub(crate) fn task_state(state: TaskState) -> String {
    let style = match state {
        TaskState::Succeeded => GOOD,
        TaskState::Failed | TaskState::Killed => BAD,
        TaskState::Running => BUSY,
        TaskState::Unknown => STALE,
        TaskState::Waiting | TaskState::Pending => MUTED,
    };
    format!("{style}{state}{style:#}")
}

/// A queue state word in its listing color.
pub(crate) fn queue_state(state: QueueState) -> String {
    let style = match state {
        QueueState::Active => GOOD,
        QueueState::Paused => STALE,
    };
    format!("{style}{state}{style:#}")
}

/// Help styling for clap, on the same palette as the listings.
pub(crate) fn clap_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(BUSY.effects(Effects::BOLD))
        .usage(BUSY.effects(Effects::BOLD))
        .literal(GOOD)
        .placeholder(MUTED)
        .error(BAD.effects(Effects::BOLD))
}
