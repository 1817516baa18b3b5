//! Shared utility functions for the foreman crate.

use anyhow::{Result, bail};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"))
}

/// Substitute `{key}` placeholders from `vars`.
///
/// Unknown keys are an error so that a typo in a branch or worktree template
/// cannot silently produce a path shared by every task.
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> Result<String> {
    let mut unknown = Vec::new();
    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.get(key) {
            Some(value) => value.clone(),
            None => {
                unknown.push(key.to_string());
                caps[0].to_string()
            }
        }
    });
    if !unknown.is_empty() {
        bail!(
            "Unknown template key(s) {} in '{}'",
            unknown
                .iter()
                .map(|k| format!("{{{}}}", k))
                .collect::<Vec<_>>()
                .join(", "),
            template
        );
    }
    Ok(rendered.into_owned())
}

/// Placeholder keys referenced by a template.
pub fn template_keys(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// `MM:SS`, or `HH:MM:SS` once an hour has passed.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, rem) = (total / 3600, total % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Quote a value for interpolation into a `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:,=@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Parse an environment-style boolean (`1/true/yes/on`, `0/false/no/off`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
