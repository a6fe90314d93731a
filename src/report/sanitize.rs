//! Report scrubbing
//!
//! Reports are meant to be pasted into public bug trackers, so everything
//! that identifies the machine or user is rewritten before assembly:
//! home directory paths, the username, the hostname, and long hex tokens
//! (machine ids, session cookies) that tend to leak through journal lines.

use std::{env, fs};

/// Placeholder substitutions for one machine
#[derive(Debug, Clone)]
pub struct Sanitizer {
    home: Option<String>,
    user: Option<String>,
    host: Option<String>,
}

impl Sanitizer {
    /// Build from the current process environment
    pub fn from_env() -> Self {
        let host = fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| env::var("HOSTNAME").ok().filter(|s| !s.is_empty()));

        Self {
            // A one-character home would shred every path in the report
            home: env::var("HOME").ok().filter(|home| home.len() > 1),
            user: env::var("USER")
                .or_else(|_| env::var("LOGNAME"))
                .ok()
                .filter(|user| user.len() >= 2),
            host,
        }
    }

    /// Sanitizer over explicit identity values (tests and callers that
    /// already resolved them)
    pub fn new(home: Option<&str>, user: Option<&str>, host: Option<&str>) -> Self {
        Self {
            home: home.map(str::to_string),
            user: user.map(str::to_string),
            host: host.map(str::to_string),
        }
    }

    /// Rewrite all identifying substrings in `text`
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        if let Some(home) = &self.home {
            out = out.replace(home, "/home/<user>");
        }
        if let Some(user) = &self.user {
            out = replace_bounded(&out, user, "<user>");
        }
        if let Some(host) = &self.host {
            if host.len() >= 2 && host != "localhost" {
                out = replace_bounded(&out, host, "<host>");
            }
        }
        redact_hex_tokens(&out)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Replace whole-word occurrences of `needle`. Matches inside larger
/// identifiers (user "max" in "maximum") and inside already-inserted
/// placeholders are left alone.
fn replace_bounded(text: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut search = 0;
    while let Some(pos) = text[search..].find(needle) {
        let start = search + pos;
        let end = start + needle.len();
        let prev_ok = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !is_word_char(c));
        let next_ok = text[end..].chars().next().map_or(true, |c| !is_word_char(c));
        let in_placeholder = text[..start].ends_with('<') && text[end..].starts_with('>');
        if prev_ok && next_ok && !in_placeholder {
            out.push_str(&text[last..start]);
            out.push_str(replacement);
            last = end;
        }
        search = end;
    }
    out.push_str(&text[last..]);
    out
}

/// Replace standalone hex runs of 32+ characters (machine ids, cookies).
/// Dashed UUIDs survive: no single group reaches the threshold.
fn redact_hex_tokens(text: &str) -> String {
    const MIN_LEN: usize = 32;

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_hexdigit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                i += 1;
            }
            let prev_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
            let next_ok = i == bytes.len() || !bytes[i].is_ascii_alphanumeric();
            if i - start >= MIN_LEN && prev_ok && next_ok {
                out.push_str(&text[last..start]);
                out.push_str("<redacted>");
                last = i;
            }
        } else {
            i += 1;
        }
    }
    out.push_str(&text[last..]);
    out
}
