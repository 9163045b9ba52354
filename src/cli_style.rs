/*!
 * Terminal styling for the pacekeeper CLI
 *
 * Themed text, icons and comfy-table renderers for batch summaries and
 * governor status snapshots.
 */

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use console::{style, StyledObject};

use crate::analytics::{Recommendation, Severity};
use crate::orchestrator::GovernorStatus;
use pacekeeper_core_resilience::CircuitPhase;

// ============================================================================
// THEME
// ============================================================================

pub struct Theme;

impl Theme {
    pub fn primary<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan()
    }

    pub fn success<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).green()
    }

    pub fn warning<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).yellow()
    }

    pub fn error<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).red()
    }

    pub fn muted<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).dim()
    }

    /// Bold cyan
    pub fn header<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan().bold()
    }
}

pub struct Icons;

impl Icons {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "⚠";
    pub const INFO: &'static str = "ℹ";
    pub const GAUGE: &'static str = "⏱";
    pub const SHIELD: &'static str = "🛡";
    pub const LIGHTNING: &'static str = "⚡";
    pub const ARROW_RIGHT: &'static str = "→";
}

// ============================================================================
// TABLES
// ============================================================================

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header_cell(text: &str) -> Cell {
    Cell::new(text).fg(Color::Cyan).add_attribute(Attribute::Bold)
}

/// Outcome counts of one batch, ready for display
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub unprocessed: usize,
    pub requeues: u64,
    pub dead_letters: usize,
    pub peak_concurrency: usize,
    pub final_concurrency: usize,
    pub elapsed_secs: f64,
}

pub fn batch_summary_table(summary: &BatchSummary) -> Table {
    let mut table = create_table();
    table.set_header(vec![header_cell("Batch Summary"), Cell::new("")]);

    table.add_row(vec![
        Cell::new("Items"),
        Cell::new(summary.total.to_string()).add_attribute(Attribute::Bold),
    ]);
    table.add_row(vec![
        Cell::new("Succeeded"),
        Cell::new(summary.succeeded.to_string())
            .fg(Color::Green)
            .add_attribute(Attribute::Bold),
    ]);

    if summary.failed > 0 {
        table.add_row(vec![
            Cell::new("Failed"),
            Cell::new(summary.failed.to_string())
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
        ]);
    }
    if summary.expired > 0 {
        table.add_row(vec![
            Cell::new("Expired in queue"),
            Cell::new(summary.expired.to_string()).fg(Color::Yellow),
        ]);
    }
    if summary.unprocessed > 0 {
        table.add_row(vec![
            Cell::new("Not processed"),
            Cell::new(summary.unprocessed.to_string()).fg(Color::Yellow),
        ]);
    }

    table.add_row(vec![
        Cell::new("Requeues"),
        Cell::new(summary.requeues.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Dead letters"),
        Cell::new(summary.dead_letters.to_string()).fg(Color::DarkGrey),
    ]);
    table.add_row(vec![
        Cell::new("Concurrency (peak / final)"),
        Cell::new(format!(
            "{} / {}",
            summary.peak_concurrency, summary.final_concurrency
        )),
    ]);
    table.add_row(vec![
        Cell::new("Duration"),
        Cell::new(format_duration(summary.elapsed_secs)).fg(Color::Cyan),
    ]);

    table
}

fn phase_cell(phase: CircuitPhase) -> Cell {
    let color = match phase {
        CircuitPhase::Closed => Color::Green,
        CircuitPhase::HalfOpen => Color::Yellow,
        CircuitPhase::Open => Color::Red,
    };
    Cell::new(phase.to_string()).fg(color).add_attribute(Attribute::Bold)
}

/// Key governor signals as a two-column table
pub fn status_table(status: &GovernorStatus) -> Table {
    let mut table = create_table();
    table.set_header(vec![header_cell("Governor"), Cell::new("")]);

    table.add_row(vec![Cell::new("Circuit"), phase_cell(status.circuit.phase)]);
    table.add_row(vec![
        Cell::new("Times opened"),
        Cell::new(status.circuit.times_opened.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Concurrency"),
        Cell::new(format!(
            "{} (range {}-{})",
            status.concurrency.current, status.concurrency.min, status.concurrency.max
        )),
    ]);
    table.add_row(vec![
        Cell::new("Recent success rate"),
        Cell::new(format!("{:.1}%", status.recent_success_rate * 100.0)),
    ]);
    table.add_row(vec![
        Cell::new("Requests (last min / hour)"),
        Cell::new(format!(
            "{} / {}",
            status.rate_windows.last_minute, status.rate_windows.last_hour
        )),
    ]);
    table.add_row(vec![
        Cell::new("Effective limit / min"),
        Cell::new(status.effective_per_minute.to_string()),
    ]);

    let learned = status
        .detected_limits
        .per_minute
        .map(|l| format!("{} ({:?})", l.value, l.source).to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    table.add_row(vec![
        Cell::new("Learned limit / min"),
        Cell::new(learned).fg(Color::Magenta),
    ]);
    table.add_row(vec![
        Cell::new("Base delay"),
        Cell::new(format!(
            "{}ms (x{:.2})",
            status.planner.base_delay_ms, status.planner.adaptive_multiplier
        )),
    ]);
    table.add_row(vec![
        Cell::new("Bursts (started / rate limited)"),
        Cell::new(format!(
            "{} / {}",
            status.burst.stats.started, status.burst.stats.ended_rate_limited
        )),
    ]);
    table.add_row(vec![
        Cell::new("Retries (recovered / exhausted)"),
        Cell::new(format!(
            "{} ({} / {})",
            status.recovery.retries, status.recovery.recovered, status.recovery.exhausted
        )),
    ]);

    table
}

fn severity_cell(severity: Severity) -> Cell {
    let color = match severity {
        Severity::Info => Color::Cyan,
        Severity::Warning => Color::Yellow,
        Severity::Critical => Color::Red,
    };
    Cell::new(severity.to_string()).fg(color)
}

pub fn recommendations_table(recommendations: &[Recommendation]) -> Table {
    let mut table = create_table();
    table.set_header(vec![
        header_cell("Kind"),
        header_cell("Severity"),
        header_cell("Confidence"),
        header_cell("Rationale"),
    ]);

    for rec in recommendations {
        table.add_row(vec![
            Cell::new(rec.kind.to_string()),
            severity_cell(rec.severity),
            Cell::new(format!("{:.0}%", rec.confidence * 100.0)),
            Cell::new(&rec.rationale).fg(Color::DarkGrey),
        ]);
    }

    table
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Draw a section header with a line
pub fn section_header(title: &str) {
    let line_len = 50 - title.len().min(40);
    println!(
        "\n{} {}",
        Theme::header(title),
        Theme::muted("─".repeat(line_len))
    );
}

pub fn print_error(message: &str, suggestion: Option<&str>) {
    eprintln!(
        "\n{} {}",
        Theme::error(format!("{} Error:", Icons::ERROR)),
        message
    );

    if let Some(hint) = suggestion {
        eprintln!(
            "  {} {}",
            Theme::muted(Icons::ARROW_RIGHT),
            Theme::muted(hint)
        );
    }
    eprintln!();
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", Theme::warning(Icons::WARNING), Theme::warning(message));
}

pub fn print_success(message: &str) {
    println!("{} {}", Theme::success(Icons::SUCCESS), Theme::success(message));
}

pub fn print_info(message: &str) {
    println!("{} {}", Theme::primary(Icons::INFO), message);
}

pub fn print_banner() {
    println!();
    println!(
        "{} {} {}",
        Theme::header(format!("{} pacekeeper", Icons::GAUGE)),
        Theme::muted(format!("v{}", env!("CARGO_PKG_VERSION"))),
        Theme::muted("adaptive request governor")
    );
    println!();
}

/// Format seconds into a short human-readable duration
pub fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining = secs % 60.0;
        format!("{}m {:.0}s", mins, remaining)
    } else {
        let hours = (secs / 3600.0).floor();
        let mins = ((secs % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours, mins)
    }
}
