//! Unified diff rendering for fix previews
//!
//! Previews must show byte-for-byte what apply() will write, in a format
//! people already know how to read, so this renders classic `diff -u`
//! hunks from a line-level longest-common-subsequence.

use std::fmt;

/// Context lines on each side of a change
const CONTEXT: usize = 3;

/// A rendered unified diff. Empty when the inputs were identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    text: String,
}

impl Diff {
    /// No textual change between old and new
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The rendered hunks, without the "(No changes)" placeholder
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "(No changes)")
        } else {
            write!(f, "{}", self.text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit<'a> {
    Keep(&'a str),
    Del(&'a str),
    Ins(&'a str),
}

impl Edit<'_> {
    fn is_change(&self) -> bool {
        !matches!(self, Edit::Keep(_))
    }
}

/// Render a unified diff from `old` to `new`
pub fn unified_diff(old: &str, new: &str, old_label: &str, new_label: &str) -> Diff {
    if old == new {
        return Diff {
            text: String::new(),
        };
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let edits = edit_script(&old_lines, &new_lines);

    let mut text = format!("--- {old_label}\n+++ {new_label}\n");
    for hunk in hunks(&edits) {
        render_hunk(&mut text, &edits, hunk);
    }

    Diff { text }
}

/// Line-level edit script via LCS dynamic programming.
///
/// Quadratic in line count, which is fine for config-file-sized inputs.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Edit<'a>> {
    let n = old.len();
    let m = new.len();

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut edits = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            edits.push(Edit::Keep(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            edits.push(Edit::Del(old[i]));
            i += 1;
        } else {
            edits.push(Edit::Ins(new[j]));
            j += 1;
        }
    }
    edits.extend(old[i..].iter().map(|l| Edit::Del(l)));
    edits.extend(new[j..].iter().map(|l| Edit::Ins(l)));
    edits
}

/// Group changed edit indices into hunk ranges, merging hunks whose
/// context would overlap or touch
fn hunks(edits: &[Edit<'_>]) -> Vec<std::ops::Range<usize>> {
    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_change())
        .map(|(i, _)| i)
        .collect();

    let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();
    for &index in &changes {
        let start = index.saturating_sub(CONTEXT);
        let end = (index + CONTEXT + 1).min(edits.len());
        match ranges.last_mut() {
            Some(last) if start <= last.end => last.end = end,
            _ => ranges.push(start..end),
        }
    }
    ranges
}

fn render_hunk(out: &mut String, edits: &[Edit<'_>], range: std::ops::Range<usize>) {
    // Line numbers of the hunk start on each side
    let mut old_start = 0usize;
    let mut new_start = 0usize;
    for edit in &edits[..range.start] {
        match edit {
            Edit::Keep(_) => {
                old_start += 1;
                new_start += 1;
            }
            Edit::Del(_) => old_start += 1,
            Edit::Ins(_) => new_start += 1,
        }
    }

    let hunk = &edits[range];
    let old_count = hunk
        .iter()
        .filter(|e| matches!(e, Edit::Keep(_) | Edit::Del(_)))
        .count();
    let new_count = hunk
        .iter()
        .filter(|e| matches!(e, Edit::Keep(_) | Edit::Ins(_)))
        .count();

    out.push_str(&format!(
        "@@ -{} +{} @@\n",
        format_range(old_start, old_count),
        format_range(new_start, new_count)
    ));
    for edit in hunk {
        match edit {
            Edit::Keep(line) => {
                out.push(' ');
                out.push_str(line);
            }
            Edit::Del(line) => {
                out.push('-');
                out.push_str(line);
            }
            Edit::Ins(line) => {
                out.push('+');
                out.push_str(line);
            }
        }
        out.push('\n');
    }
}

/// `diff -u` range notation: 1-based start, length omitted when 1,
/// empty ranges anchored at the line before
fn format_range(start: usize, count: usize) -> String {
    match count {
        1 => format!("{}", start + 1),
        0 => format!("{start},0"),
        _ => format!("{},{}", start + 1, count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs_empty_diff() {
        let diff = unified_diff("a\nb\n", "a\nb\n", "old", "new");
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "(No changes)");
    }

    #[test]
    fn test_create_from_empty() {
        let diff = unified_diff("", "[preferred]\ndefault=kde\n", "current", "proposed");
        let text = diff.as_str();
        assert!(text.contains("--- current\n"));
        assert!(text.contains("+++ proposed\n"));
        assert!(text.contains("@@ -0,0 +1,2 @@\n"));
        assert!(text.contains("+[preferred]\n"));
        assert!(text.contains("+default=kde\n"));
    }

    #[test]
    fn test_single_line_change() {
        let old = "[preferred]\ndefault=gnome\n";
        let new = "[preferred]\ndefault=kde\n";
        let diff = unified_diff(old, new, "a", "b");
        let text = diff.as_str();
        assert!(text.contains("@@ -1,2 +1,2 @@\n"));
        assert!(text.contains(" [preferred]\n"));
        assert!(text.contains("-default=gnome\n"));
        assert!(text.contains("+default=kde\n"));
    }

    #[test]
    fn test_distant_changes_make_two_hunks() {
        let old: String = (1..=20).map(|i| format!("line {i}\n")).collect();
        let new = old.replace("line 2\n", "LINE 2\n").replace("line 19\n", "LINE 19\n");

        let diff = unified_diff(&old, &new, "a", "b");
        let hunk_count = diff.as_str().matches("@@ -").count();
        assert_eq!(hunk_count, 2);
        assert!(diff.as_str().contains("-line 2\n"));
        assert!(diff.as_str().contains("+LINE 19\n"));
    }

    #[test]
    fn test_nearby_changes_merge_into_one_hunk() {
        let old: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        let new = old.replace("line 4\n", "LINE 4\n").replace("line 7\n", "LINE 7\n");

        let diff = unified_diff(&old, &new, "a", "b");
        assert_eq!(diff.as_str().matches("@@ -").count(), 1);
    }

    #[test]
    fn test_deletion_to_empty() {
        let diff = unified_diff("only line\n", "", "a", "b");
        let text = diff.as_str();
        assert!(text.contains("@@ -1 +0,0 @@\n"));
        assert!(text.contains("-only line\n"));
    }
}
