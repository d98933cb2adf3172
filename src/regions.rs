//! Marked regions inside issue bodies.
//!
//! The daemon owns two HTML-comment-delimited spans in an issue's markdown
//! body: the research section and the plan section. Regions are replaced
//! idempotently and the surrounding body is preserved byte-for-byte.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Research,
    Plan,
}

impl RegionKind {
    pub fn open_marker(self) -> &'static str {
        match self {
            Self::Research => "<!-- kiln:research -->",
            Self::Plan => "<!-- kiln:plan -->",
        }
    }

    pub fn close_marker(self) -> &'static str {
        match self {
            Self::Research => "<!-- /kiln:research -->",
            Self::Plan => "<!-- /kiln:plan -->",
        }
    }

    pub fn all() -> [RegionKind; 2] {
        [Self::Research, Self::Plan]
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Research => write!(f, "research"),
            Self::Plan => write!(f, "plan"),
        }
    }
}

/// Byte span of a region in `body`, markers included.
fn find_span(body: &str, kind: RegionKind) -> Option<(usize, usize)> {
    let start = body.find(kind.open_marker())?;
    let after_open = start + kind.open_marker().len();
    let close_rel = body[after_open..].find(kind.close_marker())?;
    let end = after_open + close_rel + kind.close_marker().len();
    Some((start, end))
}

/// Content between the markers, trimmed of the newline padding the writer adds.
pub fn extract(body: &str, kind: RegionKind) -> Option<&str> {
    let (start, end) = find_span(body, kind)?;
    let inner_start = start + kind.open_marker().len();
    let inner_end = end - kind.close_marker().len();
    Some(body[inner_start..inner_end].trim_matches('\n'))
}

pub fn contains(body: &str, kind: RegionKind) -> bool {
    find_span(body, kind).is_some()
}

/// Replace the region's content, or append a new region at the end of the
/// body. Replacing an existing region leaves every byte outside the span
/// untouched, so applying the same content twice is a fixed point.
pub fn replace(body: &str, kind: RegionKind, content: &str) -> String {
    let rendered = format!(
        "{}\n{}\n{}",
        kind.open_marker(),
        content.trim_matches('\n'),
        kind.close_marker()
    );
    match find_span(body, kind) {
        Some((start, end)) => {
            let mut out = String::with_capacity(body.len() + rendered.len());
            out.push_str(&body[..start]);
            out.push_str(&rendered);
            out.push_str(&body[end..]);
            out
        }
        None => {
            if body.is_empty() {
                rendered
            } else {
                format!("{}\n\n{}", body.trim_end_matches('\n'), rendered)
            }
        }
    }
}

/// Remove one region, markers included, collapsing the blank line the
/// append path inserted before it.
pub fn strip(body: &str, kind: RegionKind) -> String {
    match find_span(body, kind) {
        Some((start, end)) => {
            let head = body[..start].trim_end_matches('\n');
            let tail = body[end..].trim_start_matches('\n');
            match (head.is_empty(), tail.is_empty()) {
                (true, _) => tail.to_string(),
                (false, true) => head.to_string(),
                (false, false) => format!("{head}\n\n{tail}"),
            }
        }
        None => body.to_string(),
    }
}

/// Remove every kiln-managed region. Used by reset.
pub fn strip_all(body: &str) -> String {
    RegionKind::all()
        .into_iter()
        .fold(body.to_string(), |acc, kind| strip(&acc, kind))
}

/// Minimal line diff between two region snapshots, rendered in unified
/// style for the reply comment. Common prefix and suffix lines are elided
/// down to a small context window.
pub fn line_diff(before: &str, after: &str) -> String {
    const CONTEXT: usize = 2;

    if before == after {
        return String::new();
    }

    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();

    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut out = String::new();
    let ctx_start = prefix.saturating_sub(CONTEXT);
    if ctx_start > 0 {
        out.push_str("...\n");
    }
    for line in &old[ctx_start..prefix] {
        out.push_str(&format!("  {line}\n"));
    }
    for line in &old[prefix..old.len() - suffix] {
        out.push_str(&format!("- {line}\n"));
    }
    for line in &new[prefix..new.len() - suffix] {
        out.push_str(&format!("+ {line}\n"));
    }
    let suffix_ctx = suffix.min(CONTEXT);
    for line in &old[old.len() - suffix..old.len() - suffix + suffix_ctx] {
        out.push_str(&format!("  {line}\n"));
    }
    if suffix > CONTEXT {
        out.push_str("...\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "Issue description.\n\nSome details.";

    #[test]
    fn append_then_extract_round_trips() {
        let updated = replace(BODY, RegionKind::Research, "findings here");
        assert!(updated.starts_with("Issue description."));
        assert_eq!(extract(&updated, RegionKind::Research), Some("findings here"));
        assert!(!contains(&updated, RegionKind::Plan));
    }

    #[test]
    fn replace_is_idempotent() {
        let once = replace(BODY, RegionKind::Research, "findings");
        let twice = replace(&once, RegionKind::Research, "findings");
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_preserves_surrounding_bytes() {
        let with_region = format!(
            "before\n{}\nold\n{}\nafter",
            RegionKind::Plan.open_marker(),
            RegionKind::Plan.close_marker()
        );
        let updated = replace(&with_region, RegionKind::Plan, "new");
        assert!(updated.starts_with("before\n"));
        assert!(updated.ends_with("\nafter"));
        assert_eq!(extract(&updated, RegionKind::Plan), Some("new"));
    }

    #[test]
    fn regions_are_independent() {
        let body = replace(BODY, RegionKind::Research, "r");
        let body = replace(&body, RegionKind::Plan, "p");
        let body = replace(&body, RegionKind::Research, "r2");
        assert_eq!(extract(&body, RegionKind::Research), Some("r2"));
        assert_eq!(extract(&body, RegionKind::Plan), Some("p"));
    }

    #[test]
    fn strip_all_removes_both_regions() {
        let body = replace(BODY, RegionKind::Research, "r");
        let body = replace(&body, RegionKind::Plan, "p");
        let stripped = strip_all(&body);
        assert!(!contains(&stripped, RegionKind::Research));
        assert!(!contains(&stripped, RegionKind::Plan));
        assert_eq!(stripped, BODY);
    }

    #[test]
    fn strip_missing_region_is_noop() {
        assert_eq!(strip(BODY, RegionKind::Research), BODY);
    }

    #[test]
    fn unclosed_marker_is_not_a_region() {
        let body = format!("{}\ndangling", RegionKind::Research.open_marker());
        assert!(!contains(&body, RegionKind::Research));
        assert_eq!(extract(&body, RegionKind::Research), None);
    }

    #[test]
    fn diff_marks_changed_lines() {
        let diff = line_diff("a\nb\nc", "a\nx\nc");
        assert!(diff.contains("- b"));
        assert!(diff.contains("+ x"));
        assert!(diff.contains("  a"));
    }

    #[test]
    fn diff_of_equal_inputs_is_empty() {
        assert!(line_diff("same", "same").is_empty());
    }
}
