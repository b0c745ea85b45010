//! Command specification for the target process
//!
//! The relay server receives the target command as one quoted command line
//! argument. [`CommandSpec::to_command_line`] renders it and
//! [`CommandSpec::parse`] reads it back on the server side.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Executable plus arguments of the process the relay server starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    argv: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first().map(String::is_empty) {
            None => Err(RelayError::Command("no executable given".to_string())),
            Some(true) => Err(RelayError::Command("executable is empty".to_string())),
            Some(false) => Ok(Self { argv }),
        }
    }

    /// Parse a command line produced by [`CommandSpec::to_command_line`]
    /// (or typed by hand with ordinary shell-style quoting)
    pub fn parse(line: &str) -> Result<Self> {
        Self::new(split_command_line(line)?)
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Render as a single quoted command line
    pub fn to_command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| quote_arg(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_line())
    }
}

fn is_bare(c: char) -> bool {
    c.is_ascii_alphanumeric() || "._/:=@%+,-".contains(c)
}

/// Quote an argument for the relay's command line.
/// Single quotes inside the argument end the quote, add an escaped quote,
/// and start a new quote.
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_bare) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    // An argument exists once quotes were seen, even if it is empty
    let mut in_arg = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(RelayError::Command(format!(
                                "unterminated single quote in: {line}"
                            )))
                        }
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => break,
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(RelayError::Command(format!(
                                "unterminated double quote in: {line}"
                            )))
                        }
                    }
                }
            }
            '\\' => {
                in_arg = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => {
                        return Err(RelayError::Command(format!(
                            "trailing backslash in: {line}"
                        )))
                    }
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }

    if in_arg {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_argv() {
        let result = CommandSpec::new(Vec::<String>::new());
        assert!(matches!(result, Err(RelayError::Command(_))));

        let result = CommandSpec::new([""]);
        assert!(result.is_err(), "empty executable should be rejected");
    }

    #[test]
    fn test_plain_words_are_not_quoted() {
        let spec = CommandSpec::new(["echo", "hello"]).unwrap();
        assert_eq!(spec.to_command_line(), "echo hello");
        assert_eq!(spec.program(), "echo");
        assert_eq!(spec.args(), ["hello".to_string()]);
    }

    #[test]
    fn test_recorder_command_survives_the_command_line() {
        let spec = CommandSpec::new([
            "D:/Documents/Curia Recorder/curiarecorder.exe",
            "record",
            "*",
            "test.xdf",
            "-r",
            "-o",
        ])
        .unwrap();
        let line = spec.to_command_line();
        assert!(line.starts_with("'D:/Documents/Curia Recorder/curiarecorder.exe'"));
        assert_eq!(CommandSpec::parse(&line).unwrap(), spec);
    }

    #[test]
    fn test_embedded_single_quote_and_empty_arg() {
        let spec = CommandSpec::new(["sh", "-c", "echo 'it''s'", ""]).unwrap();
        let parsed = CommandSpec::parse(&spec.to_command_line()).unwrap();
        assert_eq!(parsed.argv(), spec.argv());
    }

    #[test]
    fn test_parse_hand_written_quoting() {
        let spec = CommandSpec::parse(r#"prog "a b" c\ d  'e"f' "g\"h""#).unwrap();
        assert_eq!(spec.argv(), ["prog", "a b", "c d", "e\"f", "g\"h"]);
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        assert!(CommandSpec::parse("prog 'oops").is_err());
        assert!(CommandSpec::parse("prog \"oops").is_err());
        assert!(CommandSpec::parse("prog oops\\").is_err());
    }

    #[test]
    fn test_parse_blank_line_is_empty_command() {
        assert!(matches!(
            CommandSpec::parse("   "),
            Err(RelayError::Command(_))
        ));
    }
}
