//! Redis-style glob patterns (`*`, `?`, `[abc]`, `[^a-z]`, `\x`) for matching
//! keys outside Redis: tier-1 eviction and the in-memory store.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(pattern))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 6);
    // Keys are binary-safe in Redis; `*` and `?` must match newlines too
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    out.push('[');
                    for (n, c) in chars[i + 1..i + 1 + len].iter().enumerate() {
                        match c {
                            '^' if n == 0 => out.push('^'),
                            '-' => out.push('-'),
                            '\\' | '[' | ']' | '&' | '~' | '^' => {
                                out.push('\\');
                                out.push(*c);
                            }
                            c => out.push(*c),
                        }
                    }
                    out.push(']');
                    i += len + 1;
                }
                // Unterminated or empty class: literal bracket
                _ => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Escape glob metacharacters so `value` only matches itself.
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
