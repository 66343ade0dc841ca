//! Command parser and verb dispatch for the pre-signaling phase of a
//! Zork control connection.

use crate::protocol::PROTOCOL_VERSION;

/// The mode a session settles into on its first `give`/`get` verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Give,
    Get,
}

/// Outcome of dispatching one command-phase line.
pub enum CommandOutcome {
    /// Send this line back on the control transport (caller appends `\n`).
    Reply(String),
    /// No reply; the verb had a side effect only (`transform with`/`config`).
    NoReply,
    /// The control transport should be closed (`quit`).
    Quit,
    /// The session entered a mode; the caller must run the give/get init
    /// protocol (4.4 / 4.5) for it.
    EnterMode(Mode),
}

/// Splits a command line into tokens on runs of non-word characters,
/// discarding empty tokens produced by leading/trailing separators.
fn tokenize(line: &str) -> Vec<&str> {
    line.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|tok| !tok.is_empty())
        .collect()
}

/// Dispatches one command-phase line. `num_getters` is read fresh by the
/// caller for the `getters` verb; `transformer_config` is the session's
/// stash, mutated in place by `transform` sub-verbs.
pub fn dispatch(
    line: &str,
    num_getters: u64,
    transform_name: &mut Option<String>,
    transform_config: &mut Option<String>,
) -> CommandOutcome {
    let tokens = tokenize(line);
    let Some(verb_raw) = tokens.first() else {
        return CommandOutcome::Reply("I don't understand that command. ()".to_string());
    };
    let verb = verb_raw.to_lowercase();

    match verb.as_str() {
        "ping" => CommandOutcome::Reply("ping".to_string()),
        "xyzzy" => CommandOutcome::Reply("Nothing happens.".to_string()),
        "version" => CommandOutcome::Reply(PROTOCOL_VERSION.to_string()),
        "quit" => CommandOutcome::Quit,
        "getters" => CommandOutcome::Reply(num_getters.to_string()),
        "transform" => dispatch_transform(line, transform_name, transform_config),
        "give" => CommandOutcome::EnterMode(Mode::Give),
        "get" => CommandOutcome::EnterMode(Mode::Get),
        other => CommandOutcome::Reply(format!("I don't understand that command. ({other})")),
    }
}

fn dispatch_transform(
    line: &str,
    transform_name: &mut Option<String>,
    transform_config: &mut Option<String>,
) -> CommandOutcome {
    // Locate the verb token's own boundaries the same way tokenize() does
    // (a run of word chars), rather than assuming "transform" starts the
    // line after whitespace-only trimming — a non-whitespace separator
    // ahead of the verb (e.g. ";transform ...") would otherwise still
    // dispatch here (tokenize() would have found "transform" as the first
    // token) while a hardcoded or whitespace-trimmed offset cuts mid-string.
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let verb_start = line.find(is_word).unwrap_or(0);
    let verb_end = verb_start
        + line[verb_start..]
            .find(|c: char| !is_word(c))
            .unwrap_or(line.len() - verb_start);

    let after_verb = &line[verb_end..];
    let rest = after_verb.trim_start();
    let rest_offset = verb_end + (after_verb.len() - rest.len());

    // Sub-verbs ("with"/"config") are matched case-insensitively, same as
    // the top-level verb; only the captured name/blob preserves its case.
    if let Some(name) = strip_prefix_ci(rest, "with ") {
        *transform_name = Some(name.trim().to_string());
        return CommandOutcome::NoReply;
    }

    if strip_prefix_ci(rest, "config ").is_some() {
        // The recorded blob is an exact substring of the original line
        // (not a re-trimmed copy), found via this sub-verb's own offset
        // rather than a re-scan for a literal " config " marker.
        let blob_start = rest_offset + "config ".len();
        *transform_config = Some(line[blob_start..].to_string());
        return CommandOutcome::NoReply;
    }

    CommandOutcome::Reply("usage: transform with <name> | transform config <json>".to_string())
}

/// ASCII case-insensitive `strip_prefix`. `prefix` must be ASCII; a match
/// guarantees the consumed bytes are ASCII too, so slicing at `prefix.len()`
/// always lands on a char boundary.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let n = prefix.len();
    if s.len() >= n && s.as_bytes()[..n].eq_ignore_ascii_case(prefix.as_bytes()) {
        Some(&s[n..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(line: &str, num_getters: u64) -> (Option<String>, Option<String>, CommandOutcome) {
        let mut name = None;
        let mut config = None;
        let outcome = dispatch(line, num_getters, &mut name, &mut config);
        (name, config, outcome)
    }

    #[test]
    fn s1_trivial_command_echo() {
        assert!(matches!(
            run("ping", 0).2,
            CommandOutcome::Reply(r) if r == "ping"
        ));
        assert!(matches!(
            run("xyzzy", 0).2,
            CommandOutcome::Reply(r) if r == "Nothing happens."
        ));
        assert!(matches!(
            run("nonsense", 0).2,
            CommandOutcome::Reply(r) if r == "I don't understand that command. (nonsense)"
        ));
    }

    #[test]
    fn s2_getters_count() {
        assert!(matches!(
            run("getters", 0).2,
            CommandOutcome::Reply(r) if r == "0"
        ));
        assert!(matches!(
            run("getters", 3).2,
            CommandOutcome::Reply(r) if r == "3"
        ));
    }

    #[test]
    fn s3_transform_stash() {
        let (name, config, outcome) = run("transform with caesar", 0);
        assert!(matches!(outcome, CommandOutcome::NoReply));
        assert_eq!(name.as_deref(), Some("caesar"));
        assert_eq!(config, None);

        let (name, config, outcome) = run(r#"transform config {"k":1}"#, 0);
        assert!(matches!(outcome, CommandOutcome::NoReply));
        assert_eq!(name, None);
        assert_eq!(config.as_deref(), Some(r#"{"k":1}"#));
    }

    #[test]
    fn transform_unknown_suffix_gets_usage() {
        assert!(matches!(run("transform bogus", 0).2, CommandOutcome::Reply(_)));
    }

    #[test]
    fn give_and_get_enter_mode() {
        assert!(matches!(
            run("give", 0).2,
            CommandOutcome::EnterMode(Mode::Give)
        ));
        assert!(matches!(
            run("get", 0).2,
            CommandOutcome::EnterMode(Mode::Get)
        ));
    }

    #[test]
    fn verb_is_lowercased_but_args_are_not() {
        let (name, _, outcome) = run("TRANSFORM WITH Caesar", 0);
        assert!(matches!(outcome, CommandOutcome::NoReply));
        assert_eq!(name.as_deref(), Some("Caesar"));
    }

    #[test]
    fn quit_closes_transport() {
        assert!(matches!(run("quit", 0).2, CommandOutcome::Quit));
    }

    #[test]
    fn separator_immediately_after_verb_does_not_misalign_the_slice() {
        // tokenize() still sees "transform" as the verb here even though it's
        // not the first character of the line; dispatch_transform must find
        // the sub-verb by the same token boundary, not a hardcoded offset.
        let (name, _, outcome) = run(";transform with foo", 0);
        assert!(matches!(outcome, CommandOutcome::NoReply));
        assert_eq!(name.as_deref(), Some("foo"));
    }
}
