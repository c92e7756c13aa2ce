use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use chat_stream::StreamObserver;
use chrono::{DateTime, Utc};
use core_model::{ChatMessage, ChatRole, Snippet};
use owo_colors::OwoColorize;

pub fn color_enabled() -> bool {
    io::stdout().is_terminal()
        && io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none()
}

/// Coarse age such as `3h ago`, keeping only the largest unit.
pub fn relative_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).to_std().unwrap_or_default().as_secs();
    if secs == 0 {
        return "just now".to_string();
    }
    let full = humantime::format_duration(Duration::from_secs(secs)).to_string();
    let largest = full.split_whitespace().next().unwrap_or(&full);
    format!("{largest} ago")
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(if ch.is_whitespace() { ' ' } else { ch });
    }
    out
}

pub fn snippet_line(snippet: &Snippet, now: DateTime<Utc>, use_color: bool) -> String {
    let age = relative_age(now, snippet.updated_at);
    let preview = truncate_text(&snippet.content, 40);
    if use_color {
        let separator = " | ".dimmed().to_string();
        format!(
            "{}{separator}{}{separator}{}{separator}{}",
            snippet.id.cyan(),
            snippet.name.bold(),
            age.dimmed(),
            preview.dimmed()
        )
    } else {
        format!("{} | {} | {} | {}", snippet.id, snippet.name, age, preview)
    }
}

pub fn print_snippet_list(snippets: &[Snippet], now: DateTime<Utc>) {
    let use_color = color_enabled();
    for snippet in snippets {
        println!("{}", snippet_line(snippet, now, use_color));
    }
}

pub fn role_label(role: ChatRole, use_color: bool) -> String {
    let label = format!("{role}:");
    if !use_color {
        return label;
    }
    match role {
        ChatRole::User => label.cyan().bold().to_string(),
        ChatRole::Assistant => label.magenta().bold().to_string(),
    }
}

pub fn print_history(messages: &[ChatMessage]) {
    let use_color = color_enabled();
    for message in messages {
        println!("{} {}", role_label(message.role, use_color), message.content);
    }
}

/// Echoes a streaming answer to stdout as it grows.
pub struct LiveAnswer {
    printed: usize,
    use_color: bool,
}

impl LiveAnswer {
    pub fn new() -> Self {
        Self {
            printed: 0,
            use_color: color_enabled(),
        }
    }

    /// Ends the line once the stream is done.
    pub fn finish(&self) {
        if self.printed > 0 {
            println!();
        }
    }
}

impl StreamObserver for LiveAnswer {
    fn on_answer(&mut self, answer: &str) {
        if self.printed == 0 && !answer.is_empty() {
            print!("{} ", role_label(ChatRole::Assistant, self.use_color));
        }
        if let Some(fresh) = answer.get(self.printed..) {
            print!("{fresh}");
            // Progress output only; a closed stdout is reported by println later.
            let _ = io::stdout().flush();
            self.printed = answer.len();
        }
    }

    fn on_conversation_id(&mut self, conversation_id: &str) {
        tracing::debug!(conversation_id, "conversation started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ages_keep_largest_unit() {
        assert_eq!(relative_age(at(0), at(0)), "just now");
        assert_eq!(relative_age(at(45), at(0)), "45s ago");
        assert_eq!(relative_age(at(3 * 3600 + 120), at(0)), "3h ago");
        assert_eq!(relative_age(at(2 * 86_400 + 5), at(0)), "2days ago");
    }

    #[test]
    fn future_timestamps_read_as_now() {
        assert_eq!(relative_age(at(0), at(30)), "just now");
    }

    #[test]
    fn truncation_flattens_whitespace() {
        assert_eq!(truncate_text("{\n  \"a\": 1\n}", 100), "{   \"a\": 1 }");
        assert_eq!(truncate_text("abcdef", 3), "abc...");
    }

    #[test]
    fn plain_snippet_line() {
        let snippet = Snippet {
            id: "1700000000000".to_string(),
            name: "orders".to_string(),
            content: "[1,2,3]".to_string(),
            created_at: at(0),
            updated_at: at(0),
        };
        assert_eq!(
            snippet_line(&snippet, at(90), false),
            "1700000000000 | orders | 1m ago | [1,2,3]"
        );
    }

    #[test]
    fn plain_role_labels() {
        assert_eq!(role_label(ChatRole::User, false), "user:");
        assert_eq!(role_label(ChatRole::Assistant, false), "assistant:");
    }
}
