use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use testpilot_core::state::{Role, TranscriptEntry};
use crate::app::App;

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, body, footer
    let [header_area, body_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat_screen(app, frame, body_area);
    render_footer(app, frame, footer_area);

    if !app.is_active() {
        render_api_key_input(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let title = Line::from(vec![
        Span::styled(" testpilot ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("{} ", app.model),
            Style::default().fg(Color::White),
        ),
        Span::styled(
            format!("{} ", app.command.work_dir.display()),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let busy = app.conversation.is_processing();
    let (mode_text, mode_style) = match (app.is_active(), busy) {
        (false, false) => (" SETUP ", Style::default().bg(Color::Yellow).fg(Color::Black)),
        (false, true) => (" STARTING ", Style::default().bg(Color::Magenta).fg(Color::White)),
        (true, false) => (" CHAT ", Style::default().bg(Color::Blue).fg(Color::White)),
        (true, true) => (" WORKING ", Style::default().bg(Color::Magenta).fg(Color::White)),
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let mut hints = if app.is_active() {
        vec![
            Span::styled(" Enter/^S ", key_style),
            Span::styled(" send ", label_style),
            Span::styled(" PgUp/PgDn ", key_style),
            Span::styled(" scroll ", label_style),
        ]
    } else {
        vec![
            Span::styled(" Enter ", key_style),
            Span::styled(" start ", label_style),
        ]
    };
    hints.extend(vec![
        Span::styled(" Esc/^C ", key_style),
        Span::styled(" quit ", label_style),
    ]);

    let footer_content = Line::from(
        vec![
            Span::styled(mode_text, mode_style),
            Span::styled(" ", label_style),
        ]
        .into_iter()
        .chain(hints)
        .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn entry_lines(entry: &TranscriptEntry, lines: &mut Vec<Line<'static>>) {
    let time = Span::styled(
        format!("[{}] ", entry.timestamp.format("%H:%M:%S")),
        Style::default().fg(Color::DarkGray),
    );

    if entry.role == Role::Tool {
        lines.push(Line::from(vec![
            time,
            Span::styled(
                entry.content.replace('\n', " "),
                Style::default().fg(Color::Magenta),
            ),
        ]));
        return;
    }

    let (label, label_style) = match entry.role {
        Role::User => ("You:", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Role::Assistant => ("AI:", Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        _ if entry.is_error => ("System:", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)),
        _ => ("System:", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
    };
    lines.push(Line::from(vec![time, Span::styled(label, label_style)]));

    let content_style = if entry.is_error {
        Style::default().fg(Color::Red)
    } else {
        Style::default()
    };
    for line in entry.content.lines() {
        lines.push(Line::from(Span::styled(format!("  {}", line), content_style)));
    }
    lines.push(Line::default());
}

fn transcript_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for entry in app.conversation.entries() {
        entry_lines(entry, &mut lines);
    }

    if app.conversation.is_processing() && app.is_active() {
        // Animated ellipsis: cycles through ".", "..", "..."
        let dots = ".".repeat((app.animation_frame as usize) + 1);
        lines.push(Line::from(Span::styled(
            format!("Working{}", dots),
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )));
    }
    lines
}

/// Rows the lines occupy once wrapped to `width`.
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let rows: usize = lines
        .iter()
        .map(|line| line.width().max(1).div_ceil(width))
        .sum();
    rows.min(u16::MAX as usize) as u16
}

fn render_chat_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let [chat_area, input_area] = Layout::vertical([
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .areas(area);

    // Inner size minus borders
    let inner_height = chat_area.height.saturating_sub(2);
    let inner_width = chat_area.width.saturating_sub(2);
    app.chat_height = inner_height;

    let lines = transcript_lines(app);
    let max_scroll = wrapped_height(&lines, inner_width).saturating_sub(inner_height);
    if app.follow_output || app.chat_scroll >= max_scroll {
        app.chat_scroll = max_scroll;
        app.follow_output = true;
    }

    let chat_text = if lines.is_empty() {
        let hint = if app.is_active() {
            "Ask for a change, or to generate unit tests for a Go file..."
        } else {
            "Enter your Gemini API key to start the agent."
        };
        Text::from(Span::styled(hint, Style::default().fg(Color::DarkGray)))
    } else {
        Text::from(lines)
    };

    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Conversation ");

    let chat = Paragraph::new(chat_text)
        .block(chat_block)
        .wrap(Wrap { trim: false })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, chat_area);

    render_chat_input(app, frame, input_area);
}

fn render_chat_input(app: &App, frame: &mut Frame, area: Rect) {
    let accepting = app.is_active() && !app.conversation.is_processing();
    let (title, border_color) = if !app.is_active() {
        (" Message ", Color::DarkGray)
    } else if accepting {
        (" Message (Enter to send) ", Color::Yellow)
    } else {
        (" Waiting for the agent... ", Color::DarkGray)
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    // Calculate visible portion of input with horizontal scrolling
    let inner_width = area.width.saturating_sub(2) as usize;
    let cursor_pos = app.chat_cursor;

    // Scroll offset keeps the cursor visible
    let scroll_offset = if inner_width == 0 {
        0
    } else if cursor_pos >= inner_width {
        cursor_pos - inner_width + 1
    } else {
        0
    };

    let visible_text: String = app
        .chat_input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);

    frame.render_widget(input, area);

    if app.is_active() {
        let cursor_x = (cursor_pos - scroll_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}

/// Asterisks with the last four characters visible.
fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len <= 4 {
        "*".repeat(len)
    } else {
        let masked_len = len - 4;
        let last_four: String = key.chars().skip(masked_len).collect();
        format!("{}...{}", "*".repeat(masked_len.min(20)), last_four)
    }
}

fn render_api_key_input(app: &App, frame: &mut Frame, area: Rect) {
    // Calculate popup size and position (centered)
    let popup_width = 60.min(area.width.saturating_sub(4));
    let popup_height = 7;

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;

    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Enter Gemini API Key ");

    let inner = block.inner(popup_area);
    frame.render_widget(block, popup_area);

    let instructions = Paragraph::new("Paste your API key below. Press Enter to start, Esc to quit.")
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(instructions, Rect::new(inner.x, inner.y, inner.width, 1));

    let input_area = Rect::new(inner.x, inner.y + 2, inner.width, 1);
    let display_text = mask_key(&app.api_key_input);
    let display_len = display_text.chars().count();
    frame.render_widget(
        Paragraph::new(display_text).style(Style::default().fg(Color::Cyan)),
        input_area,
    );

    let starting = app.conversation.is_processing();
    if !starting {
        // The mask hides positions, so the cursor sits at the end while editing at the end.
        let key_len = app.api_key_input.chars().count();
        let cursor = if app.api_key_input_cursor >= key_len {
            display_len
        } else {
            app.api_key_input_cursor.min(display_len)
        };
        let cursor_x = cursor.min(input_area.width as usize) as u16;
        frame.set_cursor_position((input_area.x + cursor_x, input_area.y));
    }

    let status_text = if starting {
        "Starting agent...".to_string()
    } else {
        format!("{} characters", app.api_key_input.chars().count())
    };
    let status = Paragraph::new(status_text).style(Style::default().fg(Color::DarkGray));
    frame.render_widget(status, Rect::new(inner.x, inner.y + 4, inner.width, 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::{backend::TestBackend, Terminal};
    use serde_json::json;
    use testpilot_core::{Config, Envelope};

    fn screen_text(app: &mut App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(80, 24)).unwrap();
        terminal.draw(|frame| render(app, frame)).unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("abcd"), "****");
        assert_eq!(mask_key("abcdefgh"), "****...efgh");
    }

    #[test]
    fn test_wrapped_height() {
        let lines = vec![Line::from("x".repeat(25)), Line::default()];
        assert_eq!(wrapped_height(&lines, 10), 4);
    }

    #[test]
    fn test_credential_popup_masks_key() {
        let mut config = Config::new();
        config.api_key = Some("supersecretkey".to_string());
        let mut app = App::detached(&config);

        let text = screen_text(&mut app);
        assert!(text.contains("Enter Gemini API Key"));
        assert!(text.contains("tkey"));
        assert!(!text.contains("supersecret"));
    }

    #[test]
    fn test_transcript_rendering() {
        let mut app = App::detached(&Config::new());
        assert!(app.conversation.request_start("key"));
        app.handle_worker_event(Ok(Envelope::initialized("ready")));
        app.handle_worker_event(Ok(Envelope::tool_call(
            "read_file",
            json!({"filePath": "calc.go"}).as_object().cloned().unwrap(),
        )));
        app.handle_worker_event(Ok(Envelope::error("read_file failed: not found", None)));

        let mut lines = Vec::new();
        for entry in app.conversation.entries() {
            entry_lines(entry, &mut lines);
        }
        let rendered: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        assert!(rendered.iter().any(|l| l.ends_with("System:")));
        let tool = rendered.iter().find(|l| l.contains("🔧 Tool: read_file")).unwrap();
        assert!(tool.starts_with('['));
        assert!(rendered.iter().any(|l| l == "  ❌ Error: read_file failed: not found"));

        let text = screen_text(&mut app);
        assert!(text.contains("Conversation"));
        assert!(!text.contains("Enter Gemini API Key"));
    }
}
