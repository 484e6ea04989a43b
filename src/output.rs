//! Post-processing of captured command output.
//!
//! Everything here is pure text manipulation: the display header wrapped
//! around every result, line-count truncation for very large payloads,
//! removal of task records by type from the embedded JSON array, and
//! case-insensitive match counting for search.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Marker line that precedes the raw output in a formatted result.
pub const OUTPUT_MARKER: &str = "OUTPUT:";
/// Task type excluded by the "background tasks" toggle.
pub const BACKGROUND_TASK_TYPE: &str = "DELETE_INSTANCE";

const HEADER_RULE_WIDTH: usize = 60;
const BANNER_WIDTH: usize = 80;
const TRUNCATION_PREFIX: &str = "... (truncated at ";
// Field names a task record may carry its type under, in lookup order.
const TASK_TYPE_FIELDS: [&str; 4] = ["type", "Type", "task_type", "taskType"];

/// Wraps raw output in the `COMMAND:` / `OUTPUT:` display block.
pub fn format_command_output(command: &str, output: &str) -> String {
    let rule = "─".repeat(HEADER_RULE_WIDTH);
    format!("COMMAND: {command}\n{rule}\n{OUTPUT_MARKER}\n\n{output}")
}

/// Keeps the first `max_lines` lines of `text` and appends a notice with the
/// original line count. `max_lines == 0` means unlimited.
///
/// A notice left by an earlier truncation is not counted as content, so
/// re-applying the same limit leaves the text unchanged.
pub fn truncate_lines(text: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return text.to_string();
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    let mut total = None;
    if let Some(previous) = lines.last().copied().and_then(parse_truncation_notice) {
        lines.pop();
        total = Some(previous);
    }
    if lines.len() <= max_lines {
        return text.to_string();
    }
    let total = total.unwrap_or(lines.len()).max(lines.len());
    let kept = lines[..max_lines].join("\n");
    format!("{kept}\n{TRUNCATION_PREFIX}{max_lines} lines, total: {total} lines)")
}

fn parse_truncation_notice(line: &str) -> Option<usize> {
    let rest = line.strip_prefix(TRUNCATION_PREFIX)?;
    let (_, total) = rest.split_once(" lines, total: ")?;
    total.strip_suffix(" lines)")?.parse().ok()
}

/// Which task types to drop from the tasks output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Drop `DELETE_INSTANCE` tasks.
    pub exclude_background: bool,
    /// Comma-separated list of additional task types.
    pub custom: String,
}

impl TaskFilter {
    pub fn new(exclude_background: bool, custom: impl Into<String>) -> Self {
        Self {
            exclude_background,
            custom: custom.into(),
        }
    }

    /// Upper-cased labels to exclude.
    pub fn labels(&self) -> BTreeSet<String> {
        let mut labels: BTreeSet<String> = self
            .custom
            .split(',')
            .map(|label| label.trim().to_uppercase())
            .filter(|label| !label.is_empty())
            .collect();
        if self.exclude_background {
            labels.insert(BACKGROUND_TASK_TYPE.to_string());
        }
        labels
    }

    pub fn is_active(&self) -> bool {
        !self.labels().is_empty()
    }
}

/// Drops task records whose type matches an excluded label.
///
/// The JSON array is expected after the `OUTPUT:` marker and its blank line
/// (or to be the whole text when no marker exists). The result keeps the
/// header, then a `#` banner with the counts, then the remaining records as
/// pretty JSON. Input that does not parse as an array of objects is returned
/// unchanged, as is any input when the filter has no labels.
pub fn filter_tasks(text: &str, filter: &TaskFilter) -> String {
    let labels = filter.labels();
    if labels.is_empty() {
        return text.to_string();
    }

    let (header, body) = split_formatted_output(text);
    let records: Vec<Map<String, Value>> = match serde_json::from_str(body) {
        Ok(records) => records,
        Err(_) => return text.to_string(),
    };
    let original = records.len();
    let kept: Vec<Map<String, Value>> = records
        .into_iter()
        .filter(|record| !task_type(record).is_some_and(|ty| labels.contains(&ty.to_uppercase())))
        .collect();
    let Ok(json) = serde_json::to_string_pretty(&kept) else {
        return text.to_string();
    };

    let border = "#".repeat(BANNER_WIDTH);
    let removed_types = labels.iter().cloned().collect::<Vec<_>>().join(", ");
    let mut result = String::new();
    if let Some(header) = header {
        result.push_str(header);
        result.push('\n');
    }
    result.push_str(&border);
    result.push('\n');
    result.push_str("# FILTERS APPLIED\n");
    result.push_str(&format!("# Removed task types: {removed_types}\n"));
    result.push_str(&format!("# Original task count: {original}\n"));
    result.push_str(&format!("# Filtered task count: {}\n", kept.len()));
    result.push_str(&format!("# Tasks removed: {}\n", original - kept.len()));
    result.push_str(&border);
    result.push('\n');
    result.push_str(&json);
    result
}

fn task_type(record: &Map<String, Value>) -> Option<&str> {
    TASK_TYPE_FIELDS
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))
}

// Splits a formatted result into the header (through the `OUTPUT:` line)
// and the payload, skipping the blank separator when present and any
// earlier filter banner.
fn split_formatted_output(text: &str) -> (Option<&str>, &str) {
    let mut offset = 0;
    let mut header = None;
    for line in text.split_inclusive('\n') {
        offset += line.len();
        if line.trim() == OUTPUT_MARKER {
            header = Some(text[..offset].trim_end_matches('\n'));
            break;
        }
    }
    let mut body = match header {
        Some(_) => &text[offset..],
        None => text,
    };
    if let Some(rest) = body.strip_prefix('\n') {
        body = rest;
    }
    (header, strip_banner(body))
}

fn strip_banner(body: &str) -> &str {
    let border = "#".repeat(BANNER_WIDTH);
    let Some(rest) = body.strip_prefix(border.as_str()) else {
        return body;
    };
    match rest.find(&format!("\n{border}")) {
        Some(end) => rest[end + 1 + border.len()..].trim_start_matches('\n'),
        None => body,
    }
}

/// Counts case-insensitive, non-overlapping occurrences of `query`.
pub fn count_matches(text: &str, query: &str) -> usize {
    if query.is_empty() {
        return 0;
    }
    let query = query.to_lowercase();
    text.to_lowercase().matches(query.as_str()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks_json() -> String {
        serde_json::json!([
            {"id": 1, "type": "DELETE_INSTANCE"},
            {"id": 2, "Type": "backup"},
            {"id": 3, "task_type": "delete_instance"},
            {"id": 4, "taskType": "RESIZE"},
            {"id": 5, "name": "untyped"}
        ])
        .to_string()
    }

    #[test]
    fn formats_command_header() {
        let formatted = format_command_output("efdb cluster info c1", "{}");
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(lines[0], "COMMAND: efdb cluster info c1");
        assert_eq!(lines[1].chars().count(), 60);
        assert!(lines[1].chars().all(|c| c == '─'));
        assert_eq!(lines[2], "OUTPUT:");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "{}");
    }

    #[test]
    fn truncation_keeps_first_lines_and_notice() {
        let text = (1..=10).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let truncated = truncate_lines(&text, 3);
        let lines: Vec<&str> = truncated.split('\n').collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(&lines[..3], &["1", "2", "3"]);
        assert_eq!(lines[3], "... (truncated at 3 lines, total: 10 lines)");
    }

    #[test]
    fn truncation_leaves_short_text_alone() {
        assert_eq!(truncate_lines("a\nb\nc", 3), "a\nb\nc");
        assert_eq!(truncate_lines("a\nb\nc", 0), "a\nb\nc");
        assert_eq!(truncate_lines("", 1), "");
    }

    #[test]
    fn truncation_is_stable_when_reapplied() {
        let text = (1..=10).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let once = truncate_lines(&text, 4);
        assert_eq!(truncate_lines(&once, 4), once);
        let tighter = truncate_lines(&once, 2);
        assert!(tighter.ends_with("(truncated at 2 lines, total: 10 lines)"));
    }

    #[test]
    fn filter_removes_matching_types_case_insensitively() {
        let text = format_command_output("efdb cluster show-all-tasks c1", &tasks_json());
        let filtered = filter_tasks(&text, &TaskFilter::new(true, " resize , "));
        assert!(filtered.starts_with("COMMAND: efdb cluster show-all-tasks c1\n"));
        assert!(filtered.contains(&format!("\nOUTPUT:\n{}\n# FILTERS APPLIED\n", "#".repeat(80))));
        assert!(filtered.contains("# Removed task types: DELETE_INSTANCE, RESIZE\n"));
        assert!(filtered.contains("# Original task count: 5\n"));
        assert!(filtered.contains("# Filtered task count: 2\n"));
        assert!(filtered.contains("# Tasks removed: 3\n"));

        let json_start = filtered.find("[\n").unwrap();
        let remaining: Vec<Value> = serde_json::from_str(&filtered[json_start..]).unwrap();
        let ids: Vec<i64> = remaining.iter().map(|t| t["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn filter_is_idempotent() {
        let text = format_command_output("cmd", &tasks_json());
        let filter = TaskFilter::new(true, "");
        let once = filter_tasks(&text, &filter);
        let twice = filter_tasks(&once, &filter);
        assert!(twice.contains("# Original task count: 3\n"));
        assert!(twice.contains("# Tasks removed: 0\n"));
        assert_eq!(twice.matches("# FILTERS APPLIED").count(), 1);
        assert_eq!(twice.matches("OUTPUT:\n#").count(), 1);
    }

    #[test]
    fn filter_works_without_header() {
        let filtered = filter_tasks(&tasks_json(), &TaskFilter::new(false, "backup"));
        assert!(filtered.starts_with(&"#".repeat(80)));
        assert!(filtered.contains("# Tasks removed: 1\n"));
    }

    #[test]
    fn filter_fails_open() {
        let text = format_command_output("cmd", "{\"not\": \"an array\"}");
        assert_eq!(filter_tasks(&text, &TaskFilter::new(true, "")), text);
        let truncated = format_command_output("cmd", "[\n  {\"type\": \"X\"},\n... (truncated)");
        assert_eq!(filter_tasks(&truncated, &TaskFilter::new(true, "x")), truncated);
    }

    #[test]
    fn inactive_filter_returns_input() {
        let text = format_command_output("cmd", &tasks_json());
        assert_eq!(filter_tasks(&text, &TaskFilter::default()), text);
        assert!(!TaskFilter::new(false, " , ").is_active());
    }

    #[test]
    fn counts_case_insensitive_matches() {
        assert_eq!(count_matches("AAbAAbA", "a"), 5);
        assert_eq!(count_matches("aaaa", "aa"), 2);
        assert_eq!(count_matches("Cluster cluster CLUSTER", "cluster"), 3);
        assert_eq!(count_matches("anything", ""), 0);
    }
}
