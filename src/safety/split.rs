//! Quote-aware splitting of a shell command line into sub-commands.
//!
//! Only the subset of POSIX shell syntax an agent needs is understood:
//! quoting, escapes, the list operators `;` `&&` `||` `|` `&`, newlines and
//! redirections. Anything that would let text execute outside that structure
//! (command or process substitution, subshell grouping) is rejected so the
//! caller can fail closed.

use thiserror::Error;

/// Operator joining two adjacent sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `;` or newline
    Sequence,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `|` or `|&`
    Pipe,
    /// trailing `&`
    Background,
}

/// A redirection attached to a sub-command, e.g. `2>&1` or `> out.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub op: String,
    pub target: String,
}

impl Redirect {
    /// True for operators that write (`>`, `>>`, `&>`, `2>` ...).
    pub fn is_output(&self) -> bool {
        self.op.contains('>')
    }
}

/// One simple command after splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Source text with redirections removed.
    pub text: String,
    /// Words after shell-style unquoting.
    pub words: Vec<String>,
    pub redirects: Vec<Redirect>,
}

/// A command line split into segments; `separators[i]` joins
/// `segments[i]` and `segments[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub segments: Vec<Segment>,
    pub separators: Vec<Separator>,
}

impl ParsedCommand {
    /// Separator following segment `index`, if any.
    pub fn separator_after(&self, index: usize) -> Option<Separator> {
        self.separators.get(index).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("empty command")]
    Empty,
    #[error("unbalanced quotes")]
    UnbalancedQuotes,
    #[error("command substitution is not allowed")]
    CommandSubstitution,
    #[error("process substitution is not allowed")]
    ProcessSubstitution,
    #[error("subshells and grouping are not allowed")]
    Grouping,
    #[error("operator '{0}' has no command on one side")]
    DanglingOperator(&'static str),
    #[error("redirection '{0}' has no target")]
    MissingRedirectTarget(String),
    #[error("could not tokenize '{0}'")]
    Tokenize(String),
}

#[derive(Default)]
struct RawSegment {
    text: String,
    redirects: Vec<Redirect>,
}

/// Split `command` into sub-commands.
pub fn split_command(command: &str) -> Result<ParsedCommand, SplitError> {
    let chars: Vec<char> = command.chars().collect();
    let mut raw: Vec<RawSegment> = vec![RawSegment::default()];
    let mut separators = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let current = raw.last_mut().ok_or(SplitError::Empty)?;

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            current.text.push(c);
            i += 1;
            continue;
        }

        if c == '\\' {
            current.text.push(c);
            if let Some(n) = next {
                current.text.push(n);
            }
            i += 2;
            continue;
        }

        if c == '`' {
            return Err(SplitError::CommandSubstitution);
        }
        if c == '$' && next == Some('(') {
            return Err(SplitError::CommandSubstitution);
        }

        if in_double {
            if c == '"' {
                in_double = false;
            }
            current.text.push(c);
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.text.push(c);
                i += 1;
            }
            '"' => {
                in_double = true;
                current.text.push(c);
                i += 1;
            }
            '(' | ')' | '{' | '}' if is_word_start(&current.text) => {
                return Err(SplitError::Grouping);
            }
            '(' | ')' => return Err(SplitError::Grouping),
            '<' | '>' if next == Some('(') => return Err(SplitError::ProcessSubstitution),
            ';' | '\n' => {
                separators.push(Separator::Sequence);
                raw.push(RawSegment::default());
                i += 1;
            }
            '|' => {
                let (sep, width) = match next {
                    Some('|') => (Separator::Or, 2),
                    Some('&') => (Separator::Pipe, 2),
                    _ => (Separator::Pipe, 1),
                };
                separators.push(sep);
                raw.push(RawSegment::default());
                i += width;
            }
            '&' if next == Some('&') => {
                separators.push(Separator::And);
                raw.push(RawSegment::default());
                i += 2;
            }
            '&' if next == Some('>') => {
                i = read_redirect(&chars, i, "&".to_string(), current)?;
            }
            '&' => {
                separators.push(Separator::Background);
                raw.push(RawSegment::default());
                i += 1;
            }
            '>' | '<' => {
                let fd = take_fd_prefix(&mut current.text);
                i = read_redirect(&chars, i, fd, current)?;
            }
            _ => {
                current.text.push(c);
                i += 1;
            }
        }
    }

    if in_single || in_double {
        return Err(SplitError::UnbalancedQuotes);
    }

    build(raw, separators)
}

/// True when the segment text so far ends at a word boundary.
fn is_word_start(text: &str) -> bool {
    text.chars().last().map_or(true, char::is_whitespace)
}

/// Move a file-descriptor number (`2` in `2>`) from the text into the operator.
fn take_fd_prefix(text: &mut String) -> String {
    let digits: String = text
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return String::new();
    }
    let keep = text.len() - digits.len();
    if is_word_start(&text[..keep]) {
        text.truncate(keep);
        digits
    } else {
        String::new()
    }
}

/// Read a redirection operator starting at `start` plus its target word.
/// Returns the index just past the target.
fn read_redirect(
    chars: &[char],
    start: usize,
    mut op: String,
    segment: &mut RawSegment,
) -> Result<usize, SplitError> {
    let mut i = start;
    if chars[i] == '&' {
        i += 1;
    }
    let direction = chars[i];
    while i < chars.len()
        && chars[i] == direction
        && op.chars().filter(|c| *c == direction).count() < 3
    {
        op.push(direction);
        i += 1;
    }
    if i < chars.len() && chars[i] == '&' {
        op.push('&');
        i += 1;
    }
    if i < chars.len() && chars[i] == '|' && direction == '>' {
        op.push('|');
        i += 1;
    }
    while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
        i += 1;
    }

    let mut target = String::new();
    let mut quote: Option<char> = None;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => target.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                '\\' => {
                    if let Some(n) = chars.get(i + 1) {
                        target.push(*n);
                        i += 1;
                    }
                }
                c if c.is_whitespace() || matches!(c, ';' | '|' | '&' | '<' | '>') => break,
                '`' => return Err(SplitError::CommandSubstitution),
                '$' if chars.get(i + 1) == Some(&'(') => {
                    return Err(SplitError::CommandSubstitution)
                }
                '(' | ')' => return Err(SplitError::Grouping),
                _ => target.push(c),
            },
        }
        i += 1;
    }
    if quote.is_some() {
        return Err(SplitError::UnbalancedQuotes);
    }
    if target.is_empty() {
        return Err(SplitError::MissingRedirectTarget(op));
    }

    segment.text.push(' ');
    segment.redirects.push(Redirect { op, target });
    Ok(i)
}

fn build(raw: Vec<RawSegment>, separators: Vec<Separator>) -> Result<ParsedCommand, SplitError> {
    let mut segments = Vec::new();
    let mut kept_separators = Vec::new();

    for (index, segment) in raw.into_iter().enumerate() {
        let before = index
            .checked_sub(1)
            .and_then(|i| separators.get(i).copied());
        let after = separators.get(index).copied();
        let words = shlex::split(&segment.text)
            .ok_or_else(|| SplitError::Tokenize(segment.text.trim().to_string()))?;

        if words.is_empty() && segment.redirects.is_empty() {
            for sep in [before, after].into_iter().flatten() {
                if let Some(name) = binary_operator_name(sep) {
                    return Err(SplitError::DanglingOperator(name));
                }
            }
            continue;
        }

        if !segments.is_empty() {
            kept_separators.push(before.unwrap_or(Separator::Sequence));
        }
        segments.push(Segment {
            text: segment.text.trim().to_string(),
            words,
            redirects: segment.redirects,
        });
    }

    if segments.is_empty() {
        return Err(SplitError::Empty);
    }

    Ok(ParsedCommand {
        segments,
        separators: kept_separators,
    })
}

fn binary_operator_name(sep: Separator) -> Option<&'static str> {
    match sep {
        Separator::And => Some("&&"),
        Separator::Or => Some("||"),
        Separator::Pipe => Some("|"),
        Separator::Sequence | Separator::Background => None,
    }
}
