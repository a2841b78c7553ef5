//! Commit-message trailer handling, compatible with `git interpret-trailers`
//! conventions: the trailing line-group of a message is recognized as a
//! trailer block either when every non-empty line is trailer-shaped, or when
//! at least one known generated trailer is present and at least 25% of the
//! group's lines are trailer-shaped.

use crate::re;

/// Trailer keys this tool generates itself. Their presence rescues a mixed
/// final paragraph under the 25% rule, mirroring git's treatment of its own
/// generated trailers.
const GENERATED_PREFIXES: &[&str] = &[
    "ghstack-source-id:",
    "ghstack-comment-id:",
    "Pull-Request:",
    "Pull-Request-resolved:",
    "Pull Request resolved:",
    "gh-metadata:",
    "Signed-off-by:",
    "(cherry picked from commit",
];

re!(trailer_line_re, r"^[A-Za-z0-9][A-Za-z0-9-]*:\s");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: String,
    pub body: String,
    /// Raw trailer lines, in original order.
    pub trailers: Vec<String>,
}

impl ParsedMessage {
    /// Reassembles subject + body + trailer block into a message.
    pub fn render(&self) -> String {
        let mut out = self.subject.clone();
        if !self.body.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.body);
        }
        if !self.trailers.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.trailers.join("\n"));
        }
        out
    }
}

fn is_trailer_shaped(line: &str) -> bool {
    trailer_line_re().is_match(line)
        || line.starts_with(' ')
        || GENERATED_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn is_generated(line: &str) -> bool {
    GENERATED_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Splits a message into subject, body, and trailer block.
pub fn parse(message: &str) -> ParsedMessage {
    let message = message.trim_end();
    let lines: Vec<&str> = message.lines().collect();

    let subject = lines.first().copied().unwrap_or("").trim_end().to_string();

    // The trailer block is the final contiguous line-group, and must be
    // preceded by a blank line (so a single-paragraph message has none).
    let group_start = lines
        .iter()
        .rposition(|l| l.trim().is_empty())
        .map(|blank| blank + 1);

    let (body_end, trailers) = match group_start {
        Some(start) if start < lines.len() => {
            let group = &lines[start..];
            let non_empty: Vec<&&str> = group.iter().filter(|l| !l.trim().is_empty()).collect();
            let shaped = non_empty.iter().filter(|l| is_trailer_shaped(l)).count();
            let all_shaped = !non_empty.is_empty() && shaped == non_empty.len();
            let generated_rescue = non_empty.iter().any(|l| is_generated(l))
                && shaped * 4 >= non_empty.len();
            if all_shaped || generated_rescue {
                (start - 1, group.iter().map(|l| l.to_string()).collect())
            } else {
                (lines.len(), Vec::new())
            }
        }
        _ => (lines.len(), Vec::new()),
    };

    let body = if lines.len() > 1 {
        let end = body_end.clamp(1, lines.len());
        lines[1..end].join("\n").trim().to_string()
    } else {
        String::new()
    };

    ParsedMessage { subject, body, trailers }
}

/// Appends trailer lines after any existing ones, never reordering what is
/// already there.
pub fn add_trailers(message: &str, new_lines: &[String]) -> String {
    if new_lines.is_empty() {
        return message.trim_end().to_string();
    }
    let mut parsed = parse(message);
    parsed.trailers.extend(new_lines.iter().cloned());
    parsed.render()
}

/// The value of the last trailer with the given key, if any.
pub fn trailer_value(message: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}:");
    parse(message)
        .trailers
        .iter()
        .rev()
        .find_map(|l| l.strip_prefix(&prefix))
        .map(|v| v.trim().to_string())
}

/// Replaces the value of an existing trailer in place, or appends a new one.
pub fn set_trailer(message: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}:");
    let mut parsed = parse(message);
    if let Some(line) = parsed.trailers.iter_mut().find(|l| l.starts_with(&prefix)) {
        *line = format!("{key}: {value}");
        parsed.render()
    } else {
        add_trailers(message, &[format!("{key}: {value}")])
    }
}

/// Removes all trailers whose key is in `keys`; drops the block entirely if
/// nothing remains.
pub fn strip_trailers(message: &str, keys: &[&str]) -> String {
    let mut parsed = parse(message);
    parsed
        .trailers
        .retain(|l| !keys.iter().any(|k| l.starts_with(&format!("{k}:"))));
    parsed.render()
}
