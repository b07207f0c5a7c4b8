//! Instrumentation harness generation
//!
//! The untrusted source becomes the body of a single entry-point function in
//! a fixed template. The template has exactly one insertion point; the body
//! is re-indented so every non-blank line sits inside the entry point, and is
//! scanned so it cannot leave a string, bracket or line continuation open
//! across the insertion point.
//!
//! The generated program:
//! - enables `cProfile` around the entry point and disables it in a
//!   `finally`, so statistics are persisted even when the code raises
//! - writes the profiler table to [`STATS_FILE`] as tab-separated rows
//! - writes the peak resident size to [`MEMORY_FILE`] as
//!   `Memory Usage (in MB): X.XX`
//!
//! Artifact names are relative to the child's working directory, so no
//! filesystem path is ever spliced into program text.

use crate::error::ValidationError;
#[cfg(test)]
use crate::workspace::{MEMORY_FILE, STATS_FILE};

/// Name of the function that wraps the untrusted code
pub const ENTRY_POINT: &str = "sandbox_entry";

const INDENT: &str = "    ";
const TAB_STOP: usize = 8;

/// The tokenizer resets the indentation column on form feed, which would let
/// a line dedent out of the entry point.
const FORBIDDEN: &[(char, &str)] = &[
    ('\0', "NUL byte"),
    ('\x0b', "vertical tab"),
    ('\x0c', "form feed"),
];

const TEMPLATE_HEAD: &str = r"import cProfile as _sandprof_cprofile
import resource as _sandprof_resource


def sandbox_entry():
";

const TEMPLATE_TAIL: &str = r"
def _sandprof_clean(value):
    return str(value).replace('\t', ' ').replace('\n', ' ')


def _sandprof_persist(profiler):
    profiler.create_stats()
    with open('profile.stats', 'w', encoding='utf-8') as handle:
        for (filename, lineno, name), (cc, nc, tt, ct, _) in profiler.stats.items():
            handle.write('%s\t%d\t%s\t%d\t%d\t%.9f\t%.9f\n' % (
                _sandprof_clean(filename), lineno, _sandprof_clean(name), cc, nc, tt, ct))


def _sandprof_report_memory():
    peak_kb = _sandprof_resource.getrusage(_sandprof_resource.RUSAGE_SELF).ru_maxrss
    with open('memory.txt', 'w', encoding='utf-8') as handle:
        handle.write('Memory Usage (in MB): %.2f\n' % (peak_kb / 1024.0))


_sandprof_profiler = _sandprof_cprofile.Profile()
_sandprof_profiler.enable()
try:
    sandbox_entry()
finally:
    _sandprof_profiler.disable()
    try:
        _sandprof_persist(_sandprof_profiler)
    finally:
        _sandprof_report_memory()
";

/// A rendered harness program, ready to be written into a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harness {
    source: String,
}

impl Harness {
    /// Wrap `code` in the profiling template.
    pub fn render(code: &str) -> Result<Self, ValidationError> {
        let body = normalize_body(code)?;

        let mut source =
            String::with_capacity(TEMPLATE_HEAD.len() + body.len() + TEMPLATE_TAIL.len());
        source.push_str(TEMPLATE_HEAD);
        source.push_str(&body);
        source.push_str(TEMPLATE_TAIL);

        Ok(Self { source })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Produce the entry-point body: line endings unified, leading tabs expanded,
/// common margin removed and every non-blank line indented one level. A
/// trailing `pass` keeps comment-only and empty input valid.
///
/// Lines that begin inside a string literal are part of the literal's value
/// and are copied unchanged.
fn normalize_body(code: &str) -> Result<String, ValidationError> {
    if let Some((_, name)) = FORBIDDEN.iter().find(|(c, _)| code.contains(*c)) {
        return Err(ValidationError::Injection(format!("{name} is not allowed")));
    }

    let text = code.replace("\r\n", "\n").replace('\r', "\n");
    let in_string = ensure_closed(&text)?;

    let lines: Vec<Line> = text
        .split('\n')
        .zip(in_string)
        .map(|(line, literal)| {
            if literal {
                Line::Literal(line)
            } else {
                Line::Code(expand_leading_tabs(line))
            }
        })
        .collect();
    let margin = lines
        .iter()
        .filter_map(|line| match line {
            Line::Code(code) if !code.trim().is_empty() => Some(indent_width(code)),
            _ => None,
        })
        .min()
        .unwrap_or(0);

    let mut body = String::with_capacity(text.len() + lines.len() * INDENT.len() + 16);
    for line in &lines {
        match line {
            Line::Literal(literal) => body.push_str(literal),
            Line::Code(code) if code.trim().is_empty() => {}
            Line::Code(code) => {
                body.push_str(INDENT);
                body.push_str(&code[margin..]);
            }
        }
        body.push('\n');
    }
    body.push_str(INDENT);
    body.push_str("pass\n");

    Ok(body)
}

enum Line<'a> {
    Code(String),
    /// Starts inside a multi-line string literal
    Literal(&'a str),
}

fn indent_width(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b' ').count()
}

fn expand_leading_tabs(line: &str) -> String {
    let mut column = 0;
    let mut consumed = 0;
    for (idx, ch) in line.char_indices() {
        match ch {
            ' ' => column += 1,
            '\t' => column = (column / TAB_STOP + 1) * TAB_STOP,
            _ => break,
        }
        consumed = idx + ch.len_utf8();
    }
    let mut out = " ".repeat(column);
    out.push_str(&line[consumed..]);
    out
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Code,
    Comment,
    Str {
        quote: char,
        triple: bool,
        format: bool,
    },
    /// Replacement field `{...}` of an f-string; `depth` counts brackets
    /// opened inside it
    Field { depth: usize },
    /// Format spec after `:` in a replacement field
    Spec,
}

/// Lexical check that the body ends outside any string literal, bracket or
/// explicit line continuation. Anything that fails here is also a syntax
/// error in Python; rejecting it here keeps the template tail intact.
///
/// Replacement fields of f-strings are lexed as code, so quotes nested in
/// them may reuse the outer quote character.
///
/// Returns, for every line of `text`, whether it begins inside a string.
fn ensure_closed(text: &str) -> Result<Vec<bool>, ValidationError> {
    let chars: Vec<char> = text.chars().collect();
    let mut stack = vec![Frame::Code];
    let mut brackets: Vec<char> = Vec::new();
    let mut in_string = vec![false];
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        let mut step = 1;

        match stack.last().copied().unwrap_or(Frame::Code) {
            Frame::Comment => {
                if ch == '\n' {
                    stack.pop();
                }
            }
            Frame::Str {
                quote,
                triple,
                format,
            } => {
                if ch == '\\' {
                    step = 2;
                } else if format && ch == '{' {
                    if next == Some('{') {
                        step = 2;
                    } else {
                        stack.push(Frame::Field { depth: 0 });
                    }
                } else if ch == quote && !triple {
                    stack.pop();
                } else if ch == quote && next == Some(quote) && chars.get(i + 2) == Some(&quote) {
                    stack.pop();
                    step = 3;
                } else if ch == '\n' && !triple {
                    return Err(unterminated());
                }
            }
            Frame::Spec => match ch {
                '{' => stack.push(Frame::Field { depth: 0 }),
                '}' => {
                    stack.pop();
                    stack.pop();
                }
                _ => {}
            },
            top @ (Frame::Code | Frame::Field { .. }) => match ch {
                '#' => stack.push(Frame::Comment),
                '\'' | '"' => {
                    let triple = next == Some(ch) && chars.get(i + 2) == Some(&ch);
                    stack.push(Frame::Str {
                        quote: ch,
                        triple,
                        format: is_format_prefix(&chars[..i]),
                    });
                    if triple {
                        step = 3;
                    }
                }
                '(' | '[' | '{' => match stack.last_mut() {
                    Some(Frame::Field { depth }) => *depth += 1,
                    _ => brackets.push(ch),
                },
                ')' | ']' | '}' => match top {
                    Frame::Field { depth: 0 } if ch == '}' => {
                        stack.pop();
                    }
                    Frame::Field { depth: 0 } => return Err(unbalanced(ch)),
                    Frame::Field { depth } => {
                        if let Some(Frame::Field { depth: open }) = stack.last_mut() {
                            *open = depth - 1;
                        }
                    }
                    _ => {
                        let open = match ch {
                            ')' => '(',
                            ']' => '[',
                            _ => '{',
                        };
                        if brackets.pop() != Some(open) {
                            return Err(unbalanced(ch));
                        }
                    }
                },
                ':' if matches!(top, Frame::Field { depth: 0 }) => stack.push(Frame::Spec),
                '\\' => {
                    if chars[i + 1..].iter().all(|c| c.is_whitespace()) {
                        return Err(ValidationError::Injection(
                            "dangling line continuation at end of input".into(),
                        ));
                    }
                    step = 2;
                }
                _ => {}
            },
        }

        let end = (i + step).min(chars.len());
        for _ in chars[i..end].iter().filter(|c| **c == '\n') {
            in_string.push(stack.iter().any(|f| matches!(f, Frame::Str { .. })));
        }
        i = end;
    }

    if stack
        .iter()
        .any(|f| matches!(f, Frame::Str { .. } | Frame::Field { .. } | Frame::Spec))
    {
        return Err(unterminated());
    }
    if let Some(open) = brackets.last() {
        return Err(ValidationError::Injection(format!("unclosed '{open}'")));
    }
    Ok(in_string)
}

/// Whether the letters right before a quote form an f-string (or t-string)
/// prefix such as `f`, `rf` or `Fr`.
fn is_format_prefix(before: &[char]) -> bool {
    let prefix: Vec<char> = before
        .iter()
        .rev()
        .take_while(|c| c.is_alphanumeric() || **c == '_')
        .copied()
        .collect();
    prefix.len() <= 2
        && prefix
            .iter()
            .all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'b' | 'u' | 'f' | 't'))
        && prefix
            .iter()
            .any(|c| matches!(c.to_ascii_lowercase(), 'f' | 't'))
}

fn unterminated() -> ValidationError {
    ValidationError::Injection("unterminated string literal".into())
}

fn unbalanced(ch: char) -> ValidationError {
    ValidationError::Injection(format!("unbalanced '{ch}'"))
}
