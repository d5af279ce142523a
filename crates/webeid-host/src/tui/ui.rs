use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

/// What the PIN form shows
pub struct PinView<'a> {
    pub origin: &'a str,
    pub token: &'a str,
    pub purpose: &'a str,
    pub entered: usize,
    pub warning: Option<&'a str>,
    pub final_try: bool,
}

fn layout(frame: &Frame) -> [Rect; 3] {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with origin
            Constraint::Min(0),    // Dialog content
            Constraint::Length(3), // Controls
        ])
        .split(frame.area());
    [chunks[0], chunks[1], chunks[2]]
}

fn render_header(frame: &mut Frame, area: Rect, origin: &str, color: Color) {
    let max_title_width = area.width.saturating_sub(4) as usize;
    let title_base = "Web eID - ";
    let available = max_title_width.saturating_sub(title_base.len());

    let origin = if origin.chars().count() > available {
        let kept: String = origin.chars().take(available.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        origin.to_string()
    };

    let block = Block::default().borders(Borders::ALL).title(Span::styled(
        format!("{}{}", title_base, origin),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    ));
    frame.render_widget(block, area);
}

fn render_controls(frame: &mut Frame, area: Rect, text: &str) {
    let help = Paragraph::new(text)
        .style(Style::default().fg(Color::DarkGray))
        .block(Block::default().borders(Borders::ALL).title("Controls"));
    frame.render_widget(help, area);
}

pub fn render_pin(frame: &mut Frame, view: &PinView<'_>) {
    let [header, content, controls] = layout(frame);
    let color = if view.final_try { Color::Red } else { Color::Green };
    render_header(frame, header, view.origin, color);

    let mut lines = vec![
        Line::from(format!("{} requests a {} operation.", view.origin, view.purpose)),
        Line::from(vec![
            Span::raw("Token: "),
            Span::styled(view.token, Style::default().add_modifier(Modifier::BOLD)),
        ]),
        Line::from(""),
        Line::from(vec![
            Span::raw("PIN: "),
            Span::styled("*".repeat(view.entered), Style::default().fg(Color::Yellow)),
        ]),
    ];
    if let Some(warning) = view.warning {
        let color = if view.final_try { Color::Red } else { Color::Yellow };
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            warning,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
    }

    let form = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Enter PIN"));
    frame.render_widget(form, content);

    render_controls(frame, controls, "Enter: Confirm | Backspace: Delete | Esc: Cancel");
}

pub fn render_picker(frame: &mut Frame, origin: &str, items: &[String], state: &mut ListState) {
    let [header, content, controls] = layout(frame);
    render_header(frame, header, origin, Color::Green);

    let items: Vec<ListItem> = items.iter().map(|item| ListItem::new(item.as_str())).collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Select certificate"))
        .highlight_style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, content, state);

    render_controls(frame, controls, "↑/↓: Move | Enter: Select | Esc: Cancel");
}

pub fn render_busy(frame: &mut Frame, origin: &str, reader: &str) {
    let [header, content, controls] = layout(frame);
    render_header(frame, header, origin, Color::Yellow);

    let notice = Paragraph::new(vec![
        Line::from(format!("{} is using the card reader", origin)),
        Line::from(Span::styled(reader, Style::default().add_modifier(Modifier::BOLD))),
    ])
    .wrap(Wrap { trim: true })
    .style(Style::default().fg(Color::Cyan))
    .block(Block::default().borders(Borders::ALL).title("Reader in use"));
    frame.render_widget(notice, content);

    render_controls(frame, controls, "Esc: End access");
}
