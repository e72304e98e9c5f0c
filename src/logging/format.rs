//! # Log record formatting.
//!
//! [`LogFormat`] renders records according to the `logformat` configuration
//! string. The syntax is `%(field)` followed by an optional printf-style
//! width spec, e.g. the default format:
//!
//! ```text
//! %(levelname)-5.5s %(program)s: %(message)s
//! ```
//!
//! Supported fields: `levelname`, `program`, `message`, `asctime`.
//! `%%` renders a literal percent sign. Unknown fields render empty, they do
//! not fail: a bad logformat must never take the whole supervisor down.

use chrono::{DateTime, Local};

use super::LogRecord;

/// Default format: 5-char padded level, program tag, message.
pub const DEFAULT_FORMAT: &str = "%(levelname)-5.5s %(program)s: %(message)s";

/// Debug format with timestamps, used when `debug: true` sets no explicit format.
pub const DEBUG_FORMAT: &str = "%(asctime)s %(levelname)-5.5s %(program)s: %(message)s";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field {
        field: Field,
        left_align: bool,
        width: Option<usize>,
        precision: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Levelname,
    Program,
    Message,
    Asctime,
    Unknown,
}

impl Field {
    fn parse(name: &str) -> Self {
        match name {
            "levelname" => Field::Levelname,
            "program" => Field::Program,
            "message" => Field::Message,
            "asctime" => Field::Asctime,
            _ => Field::Unknown,
        }
    }
}

/// Compiled `logformat` string.
#[derive(Debug, Clone)]
pub struct LogFormat {
    tokens: Vec<Token>,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::parse(DEFAULT_FORMAT)
    }
}

impl LogFormat {
    /// Compiles a format string.
    ///
    /// Parsing is total: malformed specifiers are kept as literals.
    pub fn parse(format: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = format.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.peek() {
                Some('%') => {
                    chars.next();
                    literal.push('%');
                }
                Some('(') => {
                    chars.next();
                    let mut name = String::new();
                    for n in chars.by_ref() {
                        if n == ')' {
                            break;
                        }
                        name.push(n);
                    }
                    // Optional printf-ish spec: -, width, .precision, then a
                    // conversion character which is consumed and ignored.
                    let mut left_align = false;
                    if chars.peek() == Some(&'-') {
                        chars.next();
                        left_align = true;
                    }
                    let width = take_number(&mut chars);
                    let precision = if chars.peek() == Some(&'.') {
                        chars.next();
                        take_number(&mut chars)
                    } else {
                        None
                    };
                    if chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
                        chars.next();
                    }

                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Field {
                        field: Field::parse(&name),
                        left_align,
                        width,
                        precision,
                    });
                }
                _ => literal.push('%'),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Self { tokens }
    }

    /// Renders one record (no trailing newline).
    pub fn render(&self, record: &LogRecord) -> String {
        let mut out = String::with_capacity(record.message.len() + 16);
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Field {
                    field,
                    left_align,
                    width,
                    precision,
                } => {
                    let value = match field {
                        Field::Levelname => record.level.as_str().to_string(),
                        Field::Program => record.program.clone(),
                        Field::Message => record.message.clone(),
                        Field::Asctime => asctime(record.at),
                        Field::Unknown => String::new(),
                    };
                    out.push_str(&pad(&value, *left_align, *width, *precision));
                }
            }
        }
        out
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits.parse().ok()
}

fn pad(value: &str, left_align: bool, width: Option<usize>, precision: Option<usize>) -> String {
    let mut v: String = match precision {
        Some(p) => value.chars().take(p).collect(),
        None => value.to_string(),
    };
    if let Some(w) = width {
        let len = v.chars().count();
        if len < w {
            let fill = " ".repeat(w - len);
            if left_align {
                v.push_str(&fill);
            } else {
                v = format!("{fill}{v}");
            }
        }
    }
    v
}

fn asctime(at: std::time::SystemTime) -> String {
    let dt: DateTime<Local> = at.into();
    format!(
        "{},{:03}",
        dt.format("%Y-%m-%d %H:%M:%S"),
        dt.timestamp_subsec_millis()
    )
}
