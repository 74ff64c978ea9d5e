use crate::errors::GraderError;
use crate::logging::structured_fallback_line;
use crate::orchestrator::{RunOutcome, RunStatus};
use crate::report::{CaseSummary, SuiteSummary};
use crate::runtime::Terminal;
use ratatui::backend::TestBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};

const FRAME_WIDTH: u16 = 100;
const MAX_FRAME_HEIGHT: u16 = 200;

fn case_row(case: &CaseSummary) -> Row<'static> {
    let (verdict, color) = if case.passed {
        ("PASS", Color::Green)
    } else {
        ("FAIL", Color::Red)
    };
    let first_reason = case.reasons.first().cloned().unwrap_or_default();
    Row::new(vec![
        Cell::from(case.name.clone()),
        Cell::from(Span::styled(verdict, Style::default().fg(color))),
        Cell::from(format!("{}", case.mark)),
        Cell::from(first_reason),
    ])
}

/// Renders the suite results as a text frame: a results table and a totals block.
pub fn render_summary_frame(
    summary: &SuiteSummary,
    status: RunStatus,
    width: u16,
) -> Result<String, GraderError> {
    let table_height = (summary.cases.len() as u16).saturating_add(3);
    let height = table_height.saturating_add(5).min(MAX_FRAME_HEIGHT);
    let backend = TestBackend::new(width, height);
    let mut terminal =
        ratatui::Terminal::new(backend).map_err(|e| GraderError::Io(e.to_string()))?;
    terminal
        .draw(|frame| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Min(table_height), Constraint::Length(5)])
                .split(frame.area());

            let header = Row::new(vec!["Case", "Result", "Mark", "First issue"])
                .style(Style::default().add_modifier(Modifier::BOLD));
            let table = Table::new(
                summary.cases.iter().map(case_row).collect::<Vec<_>>(),
                [
                    Constraint::Length(24),
                    Constraint::Length(8),
                    Constraint::Length(8),
                    Constraint::Min(10),
                ],
            )
            .header(header)
            .block(Block::default().borders(Borders::ALL).title("Cases"));
            frame.render_widget(table, chunks[0]);

            let totals = vec![
                Line::from(vec![
                    Span::styled(
                        format!("run {}", status.as_str()),
                        Style::default().fg(Color::Cyan),
                    ),
                    Span::raw(format!(
                        "  passed={} failed={}",
                        summary.passed_count(),
                        summary.failed_count()
                    )),
                ]),
                Line::from(format!(
                    "mark {} / {}",
                    summary.earned_mark(),
                    summary.total_mark()
                )),
            ];
            frame.render_widget(
                Paragraph::new(totals).block(Block::default().borders(Borders::ALL).title("Totals")),
                chunks[1],
            );
        })
        .map_err(|e| GraderError::Io(e.to_string()))?;

    let buffer = terminal.backend().buffer();
    let mut out = String::new();
    for row in buffer.content().chunks(width as usize) {
        for cell in row {
            out.push_str(cell.symbol());
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn fallback_lines(outcome: &RunOutcome) -> Vec<String> {
    let mut lines = outcome
        .summary
        .cases
        .iter()
        .map(|case| {
            let state = if case.passed { "pass" } else { "fail" };
            let mut message = format!("name={} mark={}", case.name, case.mark);
            if let Some(reason) = case.reasons.first() {
                message.push_str(&format!(" reason={reason}"));
            }
            structured_fallback_line("case", state, &message)
        })
        .collect::<Vec<_>>();
    let mut message = format!(
        "passed={} failed={}",
        outcome.summary.passed_count(),
        outcome.summary.failed_count()
    );
    if let Some(path) = &outcome.summary_path {
        message.push_str(&format!(" summary={}", path.display()));
    }
    if let Some(failure) = &outcome.failure {
        message.push_str(&format!(" failure={failure}"));
    }
    lines.push(structured_fallback_line("run", outcome.status.as_str(), &message));
    lines
}

pub fn present_outcome(terminal: &dyn Terminal, outcome: &RunOutcome) -> Result<(), GraderError> {
    if terminal.stdout_is_tty() {
        let frame = render_summary_frame(&outcome.summary, outcome.status, FRAME_WIDTH)?;
        terminal.draw(&frame)?;
        if let Some(path) = &outcome.summary_path {
            terminal.write_line(&format!("Summary written to {}", path.display()))?;
        }
        if let Some(failure) = &outcome.failure {
            terminal.write_line(&format!("Run failed: {failure}"))?;
        }
        return Ok(());
    }
    for line in fallback_lines(outcome) {
        terminal.write_line(&line)?;
    }
    Ok(())
}
