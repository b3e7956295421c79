use fleet_core::TabId;
use fleet_live::{Connectivity, PanelBoard};
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use std::time::Duration;

const COMPACT_WIDTH: u16 = 92;

#[derive(Clone, Copy)]
struct ConsoleTheme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn console_theme() -> ConsoleTheme {
    ConsoleTheme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

/// Link details the board does not track itself.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub endpoint: String,
    pub retry_in: Option<Duration>,
    pub awaiting_first_snapshot: bool,
}

pub fn render_ui(frame: &mut ratatui::Frame, board: &PanelBoard, active: TabId, link: &LinkStatus) {
    let size = frame.size();
    let theme = console_theme();
    let banner = board.offline_banner_visible();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(if banner { 1 } else { 0 }),
            Constraint::Min(0),
        ])
        .split(size);
    frame.render_widget(render_header(board, active, link, theme, size.width), layout[0]);
    if banner {
        frame.render_widget(render_offline_banner(link, theme), layout[1]);
    }
    frame.render_widget(render_panel(board, active, link, theme), layout[2]);
}

fn render_header(
    board: &PanelBoard,
    active: TabId,
    link: &LinkStatus,
    theme: ConsoleTheme,
    width: u16,
) -> Paragraph<'static> {
    let compact = width < COMPACT_WIDTH;
    let mut tabs = Vec::new();
    for (index, tab) in TabId::ALL.iter().enumerate() {
        let label = if compact {
            format!(" {} ", index + 1)
        } else {
            format!(" {} {} ", index + 1, tab.title())
        };
        let style = if *tab == active {
            Style::default()
                .fg(theme.bg)
                .bg(theme.accent)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(theme.muted)
        };
        tabs.push(Span::styled(label, style));
    }

    let connectivity = board.connectivity();
    let link_color = match connectivity {
        Connectivity::Live => theme.ok,
        Connectivity::Offline => theme.critical,
        Connectivity::Unknown => theme.warn,
    };
    let mut status = vec![Span::styled(
        connectivity.label().to_string(),
        Style::default().fg(link_color).add_modifier(Modifier::BOLD),
    )];
    if let Some(age) = board.stale_age() {
        status.push(Span::styled(
            format!("  stale {}s", age.as_secs()),
            Style::default().fg(theme.warn),
        ));
    }
    let inner_width = width.saturating_sub(4) as usize;
    let endpoint = ellipsize(&link.endpoint, (inner_width / 2).max(12));
    status.push(Span::styled(
        format!("  {endpoint}"),
        Style::default().fg(theme.muted),
    ));

    Paragraph::new(Text::from(vec![Line::from(tabs), Line::from(status)]))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .style(Style::default().bg(theme.bg))
                .title(Span::styled(
                    "Fleet",
                    Style::default()
                        .fg(theme.title)
                        .add_modifier(Modifier::BOLD),
                )),
        )
}

fn render_offline_banner(link: &LinkStatus, theme: ConsoleTheme) -> Paragraph<'static> {
    let text = match link.retry_in {
        Some(delay) => format!(
            " Connection lost. Retrying in {:.1}s (c to retry now)",
            delay.as_secs_f32()
        ),
        None => " Connection lost. Showing last known state.".to_string(),
    };
    Paragraph::new(Line::from(Span::styled(
        text,
        Style::default()
            .fg(theme.text)
            .bg(theme.critical)
            .add_modifier(Modifier::BOLD),
    )))
}

fn render_panel(
    board: &PanelBoard,
    active: TabId,
    link: &LinkStatus,
    theme: ConsoleTheme,
) -> Paragraph<'static> {
    let panel = board.panel(active);
    let lines: Vec<Line<'static>> = if !panel.boundaries.is_empty() {
        let mut lines: Vec<Line<'static>> = panel
            .boundaries
            .iter()
            .map(|boundary| {
                Line::from(Span::styled(
                    format!("This view failed: {}", boundary.message),
                    Style::default().fg(theme.critical),
                ))
            })
            .collect();
        lines.push(Line::from(Span::styled(
            "Press r to retry.",
            Style::default().fg(theme.muted),
        )));
        lines
    } else if panel.lines.is_empty() {
        let hint = if link.awaiting_first_snapshot {
            "Waiting for the first fleet snapshot..."
        } else {
            "Nothing to show here yet."
        };
        vec![Line::from(Span::styled(hint, Style::default().fg(theme.muted)))]
    } else {
        panel
            .lines
            .iter()
            .map(|line| Line::from(Span::styled(line.clone(), Style::default().fg(theme.text))))
            .collect()
    };

    Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .style(Style::default().bg(theme.surface))
                .title(Span::styled(
                    format!("{}  (q quit, Tab next, r retry, f filter)", active.title()),
                    Style::default()
                        .fg(theme.title)
                        .add_modifier(Modifier::BOLD),
                )),
        )
}

pub fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return "...".chars().take(max).collect();
    }
    let prefix: String = input.chars().take(max - 3).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_live::{StatusIndicator, TabPresenter};
    use ratatui::{backend::TestBackend, Terminal};

    fn screen(board: &PanelBoard, active: TabId, link: &LinkStatus) -> String {
        let mut terminal = Terminal::new(TestBackend::new(120, 16)).expect("terminal");
        terminal
            .draw(|frame| render_ui(frame, board, active, link))
            .expect("draw");
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn offline_banner_and_label_show_after_drop() {
        let board = PanelBoard::new();
        board.show_offline();
        let link = LinkStatus {
            endpoint: "ws://127.0.0.1:18767/ws".to_string(),
            retry_in: Some(Duration::from_secs(4)),
            awaiting_first_snapshot: false,
        };
        let text = screen(&board, TabId::Overview, &link);
        assert!(text.contains("OFFLINE"));
        assert!(text.contains("Retrying in 4.0s"));
    }

    #[test]
    fn boundary_replaces_panel_content() {
        let board = PanelBoard::new();
        board.show_live();
        board.set_lines(TabId::Pipelines, vec!["row".to_string()]);
        board.show_error_boundary(TabId::Pipelines, "table exploded");
        let text = screen(&board, TabId::Pipelines, &LinkStatus::default());
        assert!(text.contains("LIVE"));
        assert!(text.contains("This view failed: table exploded"));
        assert!(text.contains("Press r to retry."));
        assert!(!text.contains("Connection lost"));
    }

    #[test]
    fn ellipsize_truncates_long_values() {
        assert_eq!(ellipsize("pipeline", 20), "pipeline");
        assert_eq!(ellipsize("pipeline-runner", 8), "pipel...");
        assert_eq!(ellipsize("abc", 2), "..");
    }
}
