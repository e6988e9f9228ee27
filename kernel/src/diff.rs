//! Unified-diff previews for staged changes
//!
//! Produces git-style unified diffs for stage-level review. Previews are
//! advisory (the file session applies full contents, not hunks) but their
//! byte size feeds the per-step diff budget.

const CONTEXT_LINES: usize = 3;

/// Maximum line-pair product for the LCS table. Beyond this the diff
/// degrades to a whole-file replacement hunk rather than an O(n*m) table.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Produce a unified diff between `old` and `new` with git-style headers.
///
/// `path` is the project-relative POSIX path used in both headers. Creations
/// pass `old = ""` and deletions pass `new = ""`.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = split_lines(old);
    let new_lines: Vec<&str> = split_lines(new);

    let mut out = String::new();
    out.push_str(&format!("--- a/{path}\n"));
    out.push_str(&format!("+++ b/{path}\n"));

    let ops = if old_lines.len().saturating_mul(new_lines.len()) > MAX_LCS_CELLS {
        full_replace_ops(&old_lines, &new_lines)
    } else {
        diff_ops(&old_lines, &new_lines)
    };

    for hunk in build_hunks(&ops) {
        out.push_str(&hunk.header());
        for op in &hunk.ops {
            match op {
                Op::Equal(line) => {
                    out.push(' ');
                    out.push_str(line);
                    out.push('\n');
                }
                Op::Delete(line) => {
                    out.push('-');
                    out.push_str(line);
                    out.push('\n');
                }
                Op::Insert(line) => {
                    out.push('+');
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }

    out
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Line-level diff via an LCS table, emitted as a flat op sequence.
fn diff_ops<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(old[i]));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            ops.push(Op::Delete(old[i]));
            i += 1;
        } else {
            ops.push(Op::Insert(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|l| Op::Delete(l)));
    ops.extend(new[j..].iter().map(|l| Op::Insert(l)));
    ops
}

fn full_replace_ops<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    let mut ops: Vec<Op<'a>> = old.iter().map(|l| Op::Delete(l)).collect();
    ops.extend(new.iter().map(|l| Op::Insert(l)));
    ops
}

struct Hunk<'a> {
    old_start: usize,
    old_count: usize,
    new_start: usize,
    new_count: usize,
    ops: Vec<Op<'a>>,
}

impl Hunk<'_> {
    fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

/// Group a flat op sequence into hunks with `CONTEXT_LINES` of context.
fn build_hunks<'a>(ops: &[Op<'a>]) -> Vec<Hunk<'a>> {
    // Indices of ops that are changes (delete/insert)
    let change_idx: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_)))
        .map(|(i, _)| i)
        .collect();

    if change_idx.is_empty() {
        return Vec::new();
    }

    // Merge changes whose context windows touch into ranges over op indices.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &ci in &change_idx {
        let start = ci.saturating_sub(CONTEXT_LINES);
        let end = (ci + CONTEXT_LINES + 1).min(ops.len());
        match ranges.last_mut() {
            Some((_, last_end)) if start <= *last_end => *last_end = end.max(*last_end),
            _ => ranges.push((start, end)),
        }
    }

    // Walk ops once, tracking line numbers, and emit each range as a hunk.
    let mut hunks = Vec::new();
    let mut old_line = 1usize;
    let mut new_line = 1usize;
    let mut cursor = 0usize;

    for (start, end) in ranges {
        // Advance line counters up to the range start.
        while cursor < start {
            match ops[cursor] {
                Op::Equal(_) => {
                    old_line += 1;
                    new_line += 1;
                }
                Op::Delete(_) => old_line += 1,
                Op::Insert(_) => new_line += 1,
            }
            cursor += 1;
        }

        let old_start = old_line;
        let new_start = new_line;
        let mut old_count = 0usize;
        let mut new_count = 0usize;
        let mut hunk_ops = Vec::new();

        while cursor < end {
            match ops[cursor] {
                Op::Equal(l) => {
                    old_line += 1;
                    new_line += 1;
                    old_count += 1;
                    new_count += 1;
                    hunk_ops.push(Op::Equal(l));
                }
                Op::Delete(l) => {
                    old_line += 1;
                    old_count += 1;
                    hunk_ops.push(Op::Delete(l));
                }
                Op::Insert(l) => {
                    new_line += 1;
                    new_count += 1;
                    hunk_ops.push(Op::Insert(l));
                }
            }
            cursor += 1;
        }

        hunks.push(Hunk {
            old_start: if old_count == 0 { old_start.saturating_sub(1) } else { old_start },
            old_count,
            new_start: if new_count == 0 { new_start.saturating_sub(1) } else { new_start },
            new_count,
            ops: hunk_ops,
        });
    }

    hunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_is_empty() {
        assert_eq!(unified_diff("a.ts", "same\n", "same\n"), "");
    }

    #[test]
    fn test_creation_all_inserts() {
        let diff = unified_diff("src/new.ts", "", "line one\nline two");
        assert!(diff.contains("+++ b/src/new.ts"));
        assert!(diff.contains("+line one"));
        assert!(diff.contains("+line two"));
        assert!(!diff.contains("\n-"));
    }

    #[test]
    fn test_deletion_all_deletes() {
        let diff = unified_diff("src/old.ts", "gone", "");
        assert!(diff.contains("-gone"));
    }

    #[test]
    fn test_single_line_change_has_context() {
        let old = "a\nb\nc\nd\ne\nf\ng";
        let new = "a\nb\nc\nD\ne\nf\ng";
        let diff = unified_diff("x.ts", old, new);
        assert!(diff.contains("-d"));
        assert!(diff.contains("+D"));
        // Context above and below, bounded at 3 lines.
        assert!(diff.contains(" a"));
        assert!(diff.contains(" g"));
        assert!(diff.contains("@@ -1,7 +1,7 @@"));
    }

    #[test]
    fn test_distant_changes_make_separate_hunks() {
        let old: Vec<String> = (0..40).map(|i| format!("line{i}")).collect();
        let mut new = old.clone();
        new[2] = "changed-early".into();
        new[35] = "changed-late".into();
        let diff = unified_diff("x.ts", &old.join("\n"), &new.join("\n"));
        assert_eq!(diff.matches("@@ -").count(), 2);
    }
}
