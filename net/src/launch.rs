//! Launch-command construction for remote worker processes.
//!
//! A node's [`ConnectionDescription`](crate::connection::ConnectionDescription)
//! may carry a command template describing how to start the worker on the
//! remote side (`"ssh %c host"`, say).  The token `%c` stands for
//! "program name plus arguments".  Building the command is pure text
//! transformation; actually spawning the process belongs to the caller.

use log::info;

/// Placeholder token marker.
const PLACEHOLDER: char = '%';

/// Expand `template` with the worker invocation.
///
/// Every `%c` is replaced by `"{program_name} {args}"`; a `%` followed by
/// anything else is kept literally.  If the template contains no `%c` at
/// all, the invocation is appended directly to the template, with no
/// separator; callers relying on the append form must include their own
/// trailing whitespace.
pub fn build_launch_command(template: &str, program_name: &str, args: &str) -> String {
    let invocation = format!("{program_name} {args}");
    let mut result = String::with_capacity(template.len().saturating_add(invocation.len()));
    let mut found = false;

    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == PLACEHOLDER && chars.peek() == Some(&'c') {
            chars.next();
            result.push_str(&invocation);
            found = true;
        } else {
            result.push(c);
        }
    }

    if !found {
        result.push_str(&invocation);
    }

    info!("launch command: {result}");
    result
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_substituted() {
        assert_eq!(
            build_launch_command("ssh %c host", "worker", "--id 3"),
            "ssh worker --id 3 host"
        );
    }

    #[test]
    fn test_append_has_no_separator() {
        // Historical append semantics: no separating space.
        assert_eq!(
            build_launch_command("run-remote", "worker", "--id 3"),
            "run-remoteworker --id 3"
        );
    }

    #[test]
    fn test_empty_template_yields_bare_invocation() {
        assert_eq!(build_launch_command("", "worker", "--id 3"), "worker --id 3");
    }

    #[test]
    fn test_every_placeholder_is_substituted() {
        assert_eq!(
            build_launch_command("%c && %c", "w", "-v"),
            "w -v && w -v"
        );
    }

    #[test]
    fn test_unknown_marker_is_literal() {
        assert_eq!(
            build_launch_command("nice -n %p", "worker", "-x"),
            "nice -n %pworker -x"
        );
    }

    #[test]
    fn test_trailing_marker_is_kept() {
        assert_eq!(build_launch_command("odd%", "w", "-v"), "odd%w -v");
    }

    #[test]
    fn test_long_substitution_grows_output() {
        let args = "a".repeat(4096);
        let command = build_launch_command("run %c now", "worker", &args);
        assert!(command.starts_with("run worker a"));
        assert!(command.ends_with(" now"));
        assert_eq!(command.len(), "run worker  now".len().saturating_add(args.len()));
    }
}
