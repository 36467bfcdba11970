//! REPL command parsing
//!
//! Anything that does not start with `/` is a turn.

use tandem_core::{ConversationId, Side};

/// One line of user input
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Send a turn
    Submit(String),
    /// Switch to dual mode (optionally naming the second model)
    Dual(Option<String>),
    /// Switch to single mode
    Single,
    /// Keep one side of the last parallel pair
    Pick(Side),
    /// Start a new conversation
    New(Option<String>),
    /// Open a stored conversation
    Open(ConversationId),
    /// List stored conversations
    List,
    /// List available models
    Models,
    /// Change the current conversation's model
    Model(String),
    /// Delete the current conversation
    Delete,
    /// Show conversation, mode and response state
    Status,
    /// Show the command list
    Help,
    /// Leave
    Quit,
}

pub const HELP: &str = "\
Commands:
  /dual [model]   answer each turn with two models
  /single         answer each turn with one model
  /pick a|b       keep one side of the last parallel answer
  /new [title]    start a new conversation
  /open <id>      open a stored conversation
  /list           list stored conversations
  /models         list available models
  /model <name>   change the current conversation's model
  /delete         delete the current conversation
  /status         show mode and response state
  /quit           exit";

/// Parse one input line
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Submit(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };

    match (name, arg) {
        ("dual", arg) => Ok(Command::Dual(arg.map(String::from))),
        ("single", _) => Ok(Command::Single),
        ("pick", Some(side)) => side.parse().map(Command::Pick),
        ("pick", None) => Err("usage: /pick a|b".to_string()),
        ("new", arg) => Ok(Command::New(arg.map(String::from))),
        ("open", Some(id)) => Ok(Command::Open(ConversationId(id.to_string()))),
        ("open", None) => Err("usage: /open <id>".to_string()),
        ("list", _) => Ok(Command::List),
        ("models", _) => Ok(Command::Models),
        ("model", Some(name)) => Ok(Command::Model(name.to_string())),
        ("model", None) => Err("usage: /model <name>".to_string()),
        ("delete", _) => Ok(Command::Delete),
        ("status", _) => Ok(Command::Status),
        ("help" | "?", _) => Ok(Command::Help),
        ("quit" | "exit" | "q", _) => Ok(Command::Quit),
        (other, _) => Err(format!("unknown command '/{other}' (try /help)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_submit() {
        assert_eq!(
            parse("  hello there "),
            Ok(Command::Submit("hello there".to_string()))
        );
    }

    #[test]
    fn test_dual_with_and_without_model() {
        assert_eq!(
            parse("/dual llama3.2"),
            Ok(Command::Dual(Some("llama3.2".to_string())))
        );
        assert_eq!(parse("/dual"), Ok(Command::Dual(None)));
        assert_eq!(parse("/dual   "), Ok(Command::Dual(None)));
    }

    #[test]
    fn test_pick() {
        assert_eq!(parse("/pick a"), Ok(Command::Pick(Side::A)));
        assert_eq!(parse("/pick B"), Ok(Command::Pick(Side::B)));
        assert!(parse("/pick c").is_err());
        assert!(parse("/pick").is_err());
    }

    #[test]
    fn test_new_title_keeps_spaces() {
        assert_eq!(
            parse("/new Rust questions"),
            Ok(Command::New(Some("Rust questions".to_string())))
        );
    }

    #[test]
    fn test_status() {
        assert_eq!(parse("/status"), Ok(Command::Status));
        assert!(HELP.contains("/status"));
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse("/frobnicate").is_err());
    }
}
