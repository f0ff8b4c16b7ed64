use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};

use crate::config::ThemeConfig;

const TYPING_CURSOR: &str = "▌";

/// Renders an entry body or a piece of feedback. Handles headings, bullets,
/// quotes, fenced blocks and inline `**bold**` / `code`.
pub fn render(content: &str, base: Style, theme: &ThemeConfig) -> Text<'static> {
    let mut lines = Vec::new();
    let mut in_code_block = false;

    for line in content.lines() {
        if line.starts_with("```") {
            in_code_block = !in_code_block;
            continue;
        }

        if in_code_block {
            lines.push(Line::from(Span::styled(
                format!("  {}", line),
                Style::default().fg(theme.timestamp),
            )));
            continue;
        }

        if let Some(rest) = line.strip_prefix("# ").or_else(|| line.strip_prefix("## ")) {
            lines.push(Line::from(Span::styled(
                rest.to_string(),
                base.fg(theme.header).add_modifier(Modifier::BOLD),
            )));
        } else if let Some(rest) = line.strip_prefix("### ") {
            lines.push(Line::from(Span::styled(
                rest.to_string(),
                base.add_modifier(Modifier::BOLD),
            )));
        } else if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            let mut spans = vec![Span::styled("  • ", Style::default().fg(theme.header))];
            spans.extend(inline_spans(rest, base));
            lines.push(Line::from(spans));
        } else if let Some(rest) = line.strip_prefix("> ") {
            lines.push(Line::from(Span::styled(
                format!("  ┃ {}", rest),
                base.add_modifier(Modifier::ITALIC),
            )));
        } else {
            lines.push(Line::from(inline_spans(line, base)));
        }
    }
    Text::from(lines)
}

/// Feedback as currently revealed, with a cursor while it is still typing.
pub fn render_feedback(shown: &str, is_typing: bool, theme: &ThemeConfig) -> Text<'static> {
    let base = Style::default().fg(theme.feedback);
    let mut text = render(shown, base, theme);
    if is_typing {
        let cursor = Span::styled(
            TYPING_CURSOR,
            Style::default()
                .fg(theme.typing_cursor)
                .add_modifier(Modifier::SLOW_BLINK),
        );
        // A trailing newline means the cursor sits on a fresh line.
        if shown.is_empty() || shown.ends_with('\n') {
            text.lines.push(Line::from(cursor));
        } else if let Some(last) = text.lines.last_mut() {
            last.spans.push(cursor);
        }
    }
    text
}

/// First line of a body, flattened for one-line list rows.
pub fn preview(content: &str, max_chars: usize) -> String {
    let flat: String = content
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let flat = flat.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", cut)
    } else {
        flat
    }
}

fn inline_spans(line: &str, base: Style) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    let mut current = line;

    while !current.is_empty() {
        let bold_start = current.find("**");
        let code_start = current.find('`');

        match (bold_start, code_start) {
            (Some(b), c) if c.map_or(true, |c| b < c) => {
                spans.push(Span::styled(current[..b].to_string(), base));
                let rest = &current[b + 2..];
                match rest.find("**") {
                    Some(end) => {
                        spans.push(Span::styled(
                            rest[..end].to_string(),
                            base.add_modifier(Modifier::BOLD),
                        ));
                        current = &rest[end + 2..];
                    }
                    None => {
                        spans.push(Span::styled("**", base));
                        current = rest;
                    }
                }
            }
            (_, Some(c)) => {
                spans.push(Span::styled(current[..c].to_string(), base));
                let rest = &current[c + 1..];
                match rest.find('`') {
                    Some(end) => {
                        spans.push(Span::styled(
                            rest[..end].to_string(),
                            Style::default().bg(Color::Rgb(40, 44, 52)).fg(Color::LightCyan),
                        ));
                        current = &rest[end + 1..];
                    }
                    None => {
                        spans.push(Span::styled("`", base));
                        current = rest;
                    }
                }
            }
            _ => {
                spans.push(Span::styled(current.to_string(), base));
                break;
            }
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &Text) -> Vec<String> {
        text.lines
            .iter()
            .map(|l| l.spans.iter().map(|s| s.content.as_ref()).collect())
            .collect()
    }

    #[test]
    fn inline_markup_is_stripped() {
        let theme = ThemeConfig::default();
        let text = render("a **b** `c` d\n- item", Style::default(), &theme);
        assert_eq!(plain(&text), vec!["a b c d", "  • item"]);
        assert!(text.lines[0].spans[1]
            .style
            .add_modifier
            .contains(Modifier::BOLD));
    }

    #[test]
    fn unterminated_markers_are_kept() {
        let theme = ThemeConfig::default();
        let text = render("2 ** 3", Style::default(), &theme);
        assert_eq!(plain(&text), vec!["2 ** 3"]);
    }

    #[test]
    fn cursor_follows_typing_feedback() {
        let theme = ThemeConfig::default();
        let typing = render_feedback("Nice", true, &theme);
        assert_eq!(plain(&typing), vec![format!("Nice{}", TYPING_CURSOR)]);

        let empty = render_feedback("", true, &theme);
        assert_eq!(plain(&empty), vec![TYPING_CURSOR.to_string()]);

        let done = render_feedback("Nice", false, &theme);
        assert_eq!(plain(&done), vec!["Nice"]);
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("one\ntwo\tthree", 40), "one two three");
        assert_eq!(preview("abcdefghij", 5), "abcd…");
    }
}
