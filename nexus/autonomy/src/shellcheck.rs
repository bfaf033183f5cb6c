use thiserror::Error;

/// Why a `run_command` input was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Empty or whitespace-only command.
    #[error("command is empty")]
    Empty,
    /// Newlines, NULs, or other control characters.
    #[error("command contains invalid control characters")]
    ControlCharacters,
    /// Ends with an unfinished escape.
    #[error("command has a trailing escape character")]
    TrailingEscape,
    /// A quote was never closed.
    #[error("command has unterminated quotes")]
    UnterminatedQuotes,
    /// A shell metacharacter outside quotes.
    #[error("command contains disallowed shell metacharacter: {0}")]
    DisallowedMetacharacter(String),
}

/// Validates a command for direct (non-shell) execution.
///
/// Quote-aware: metacharacters inside single quotes are literal, `$(` and
/// backticks are rejected outside single quotes, and `; | & < >` are
/// rejected outside any quotes. Commands are later split and executed
/// without a shell, so substitution can never fire; this check keeps the
/// intent honest.
pub fn validate_command(command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Empty);
    }
    if command.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
        return Err(CommandError::ControlCharacters);
    }

    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '$' if !in_single => {
                if chars.peek() == Some(&'(') {
                    return Err(CommandError::DisallowedMetacharacter("$(".into()));
                }
            }
            '`' if !in_single => {
                return Err(CommandError::DisallowedMetacharacter("`".into()));
            }
            ';' | '|' | '&' | '<' | '>' if !in_single && !in_double => {
                return Err(CommandError::DisallowedMetacharacter(ch.to_string()));
            }
            _ => {}
        }
    }

    if escaped {
        return Err(CommandError::TrailingEscape);
    }
    if in_single || in_double {
        return Err(CommandError::UnterminatedQuotes);
    }
    Ok(())
}

/// Splits a validated command into argv words, honouring quotes and escapes.
pub fn split_args(command: &str) -> Result<Vec<String>, CommandError> {
    validate_command(command)?;

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in command.chars() {
        if escaped {
            current.push(ch);
            in_word = true;
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => {
                in_single = !in_single;
                in_word = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                in_word = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    if args.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_pass() {
        assert!(validate_command("ls -la /tmp").is_ok());
        assert_eq!(
            split_args("echo 'hello world' done").unwrap(),
            vec!["echo", "hello world", "done"]
        );
    }

    #[test]
    fn metacharacters_outside_quotes_fail() {
        for cmd in ["ls; rm x", "cat a | grep b", "echo x > y", "a && b", "cat < f"] {
            assert!(
                matches!(validate_command(cmd), Err(CommandError::DisallowedMetacharacter(_))),
                "{cmd}"
            );
        }
    }

    #[test]
    fn single_quotes_make_metacharacters_literal() {
        assert!(validate_command("echo 'a | b ; c'").is_ok());
        assert!(validate_command("echo 'has $(subst) inside'").is_ok());
    }

    #[test]
    fn substitution_outside_single_quotes_fails() {
        assert_eq!(
            validate_command("echo $(whoami)"),
            Err(CommandError::DisallowedMetacharacter("$(".into()))
        );
        assert_eq!(
            validate_command("echo \"`date`\""),
            Err(CommandError::DisallowedMetacharacter("`".into()))
        );
    }

    #[test]
    fn malformed_quoting_fails() {
        assert_eq!(validate_command("echo 'open"), Err(CommandError::UnterminatedQuotes));
        assert_eq!(validate_command("echo trailing\\"), Err(CommandError::TrailingEscape));
        assert_eq!(validate_command("   "), Err(CommandError::Empty));
        assert_eq!(validate_command("echo a\nb"), Err(CommandError::ControlCharacters));
    }

    #[test]
    fn escapes_and_double_quotes_split_correctly() {
        assert_eq!(
            split_args("grep \"two words\" file\\ name").unwrap(),
            vec!["grep", "two words", "file name"]
        );
    }
}
