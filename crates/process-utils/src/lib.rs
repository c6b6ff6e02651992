//! Small process-related helpers shared across the workspace.
//!
//! Encoder command lines arrive as opaque text. This crate turns them into
//! spawnable commands: quote-aware token splitting for direct launches,
//! platform-shell wrapping (`sh -c` / `cmd /C`) for shell-mode launches, and
//! the Windows `CREATE_NO_WINDOW` flag so child consoles never flash over a
//! GUI host.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a `std::process::Command` that runs `line` through the platform
/// shell: `sh -c` on Unix, `cmd /C` on Windows.
pub fn shell_command(line: &str) -> std::process::Command {
    #[cfg(windows)]
    {
        let mut cmd = std_command("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = std_command("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

/// Tokio variant of [`shell_command`].
#[cfg(feature = "tokio")]
pub fn tokio_shell_command(line: &str) -> tokio::process::Command {
    #[cfg(windows)]
    {
        let mut cmd = tokio_command("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = tokio_command("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

/// A command line ended inside a quoted section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnbalancedQuote;

impl std::fmt::Display for UnbalancedQuote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command line has an unbalanced quote")
    }
}

impl std::error::Error for UnbalancedQuote {}

/// Split a command line into argv tokens.
///
/// Whitespace separates tokens. Single quotes preserve their content
/// literally, double quotes allow `\"` and `\\` escapes, and a backslash
/// outside quotes escapes the next character. Quoted empty strings produce
/// empty tokens.
pub fn split_command_line(line: &str) -> Result<Vec<String>, UnbalancedQuote> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(UnbalancedQuote),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(UnbalancedQuote),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(UnbalancedQuote),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => current.push('\\'),
                }
            }
            ch => {
                in_token = true;
                current.push(ch);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_tokens() {
        let tokens = split_command_line("ffmpeg -i input.mkv output.mkv").unwrap();
        assert_eq!(tokens, vec!["ffmpeg", "-i", "input.mkv", "output.mkv"]);
    }

    #[test]
    fn preserves_quoted_whitespace() {
        let tokens = split_command_line(r#"ffmpeg -i "my file.mkv" 'out put.mkv'"#).unwrap();
        assert_eq!(tokens, vec!["ffmpeg", "-i", "my file.mkv", "out put.mkv"]);
    }

    #[test]
    fn handles_escapes_in_double_quotes() {
        let tokens = split_command_line(r#"echo "a \"b\" \\c""#).unwrap();
        assert_eq!(tokens, vec!["echo", r#"a "b" \c"#]);
    }

    #[test]
    fn single_quotes_are_literal() {
        let tokens = split_command_line(r"echo 'a \n b'").unwrap();
        assert_eq!(tokens, vec!["echo", r"a \n b"]);
    }

    #[test]
    fn backslash_escapes_outside_quotes() {
        let tokens = split_command_line(r"touch my\ file").unwrap();
        assert_eq!(tokens, vec!["touch", "my file"]);
    }

    #[test]
    fn quoted_empty_token() {
        let tokens = split_command_line(r#"program '' "" tail"#).unwrap();
        assert_eq!(tokens, vec!["program", "", "", "tail"]);
    }

    #[test]
    fn unbalanced_quote_is_an_error() {
        assert_eq!(split_command_line("ffmpeg -i 'input"), Err(UnbalancedQuote));
        assert_eq!(split_command_line(r#"ffmpeg -i "input"#), Err(UnbalancedQuote));
    }

    #[test]
    fn empty_line_yields_no_tokens() {
        assert_eq!(split_command_line("   ").unwrap(), Vec::<String>::new());
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_uses_sh() {
        let cmd = shell_command("echo hi");
        assert_eq!(cmd.get_program(), "sh");
    }
}
