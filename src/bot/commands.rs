use crate::tmux::NamedKey;

/// A chat message, parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Every monitored session with its state and wait time
    Status,
    /// Tail of a session's screen
    Screen(Option<String>),
    /// Select the target session
    Use(Option<String>),
    /// Plain text typed into the target session
    Text(String),
    Key(NamedKey),
    /// User-marked completion
    Done(Option<String>),
    /// Show or set the log length
    LogLength(Option<String>),
    /// Missed-case pattern frequencies
    Patterns,
    Help,
    Unknown(String),
}

pub const HELP: &str = "\
<b>Commands</b>
/status - monitored sessions and wait times
/screen [session] - last lines of the screen
/use &lt;session&gt; - choose the target session
/esc, /interrupt, /clear, /enter - send a key
/done [session] - mark a session as finished
/loglen [100|150|200|300] - show or set screen lines
/patterns - frequent patterns in missed cases
Any other text is typed into the target session.";

fn arg(rest: &str) -> Option<String> {
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let Some(body) = trimmed.strip_prefix('/') else {
            return Command::Text(text.to_string());
        };

        let (head, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        // `/status@relay_bot` in group chats
        let name = head.split('@').next().unwrap_or(head).to_lowercase();

        match name.as_str() {
            "status" => Command::Status,
            "screen" => Command::Screen(arg(rest)),
            "use" => Command::Use(arg(rest)),
            "esc" => Command::Key(NamedKey::Escape),
            "interrupt" => Command::Key(NamedKey::Interrupt),
            "clear" => Command::Key(NamedKey::EraseLine),
            "enter" => Command::Key(NamedKey::Enter),
            "done" => Command::Done(arg(rest)),
            "loglen" => Command::LogLength(arg(rest)),
            "patterns" => Command::Patterns,
            "help" | "start" => Command::Help,
            _ => Command::Unknown(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/status"), Command::Status);
        assert_eq!(Command::parse("/status@relay_bot"), Command::Status);
        assert_eq!(
            Command::parse("/screen claude_api"),
            Command::Screen(Some("claude_api".into()))
        );
        assert_eq!(Command::parse("/screen"), Command::Screen(None));
        assert_eq!(Command::parse("/use   claude_web-2 "), Command::Use(Some("claude_web-2".into())));
        assert_eq!(Command::parse("/interrupt"), Command::Key(NamedKey::Interrupt));
        assert_eq!(Command::parse("/clear"), Command::Key(NamedKey::EraseLine));
        assert_eq!(Command::parse("/loglen 200"), Command::LogLength(Some("200".into())));
        assert_eq!(Command::parse("/frobnicate"), Command::Unknown("frobnicate".into()));
    }

    #[test]
    fn test_plain_text_kept_verbatim() {
        assert_eq!(
            Command::parse("  fix the failing test "),
            Command::Text("  fix the failing test ".into())
        );
    }
}
