//! String expansion
//!
//! Rewrites `${NAME}`, `${NAME:-default}`, `${NAME|filter|...}` and
//! `$(shell command)` occurrences in config strings. Single left-to-right
//! pass: substituted values are inserted literally and never re-scanned, so
//! an environment value that happens to contain expansion syntax cannot
//! inject a second round of substitution. Defaults and `$(...)` bodies are
//! part of the template itself and are expanded before use.
//!
//! `check()` performs the same parse without evaluating anything; the
//! resolver runs it over every expandable string so unbalanced brackets and
//! unknown filter names abort the run before any test executes.

use std::path::Path;
use std::time::Duration;

use crate::env::EnvMap;
use crate::exec::run_captured;

/// The closed registry of expansion filters, in documentation order.
/// The set of names is part of the config file format's contract.
pub const FILTER_NAMES: &[&str] = &[
    "strip",
    "lstrip",
    "rstrip",
    "upper",
    "lower",
    "title",
    "capitalize",
    "swapcase",
];

/// Everything a `$(...)` substitution command needs from the enclosing test:
/// its resolved environment, working directory, and timeout bound.
pub struct ExpandContext<'a> {
    pub env: &'a EnvMap,
    pub chdir: Option<&'a Path>,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("missing closing '{0}'")]
    Unclosed(char),
    #[error("no such filter: {0}")]
    UnknownFilter(String),
    #[error("substitution failed: $({command}): {detail}")]
    Substitution { command: String, detail: String },
}

/// Expand a template against the given context.
pub fn expand(template: &str, ctx: &ExpandContext<'_>) -> Result<String, ExpandError> {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            push_byte_run(template, &mut out, &mut i);
            continue;
        }
        match bytes[i + 1] {
            b'{' => {
                let close = find_matching(bytes, i + 1, b'{', b'}')
                    .ok_or(ExpandError::Unclosed('}'))?;
                let content = &template[i + 2..close];
                out.push_str(&eval_braced(content, ctx)?);
                i = close + 1;
            }
            b'(' => {
                let close = find_matching(bytes, i + 1, b'(', b')')
                    .ok_or(ExpandError::Unclosed(')'))?;
                let command = expand(&template[i + 2..close], ctx)?;
                out.push_str(&eval_substitution(&command, ctx)?);
                i = close + 1;
            }
            // Literal '$' not followed by '{' or '(' passes through
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }

    Ok(out)
}

/// Parse a template without evaluating it: verifies bracket balance and
/// filter names, recursing into defaults and substitution bodies.
pub fn check(template: &str) -> Result<(), ExpandError> {
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'{' => {
                let close = find_matching(bytes, i + 1, b'{', b'}')
                    .ok_or(ExpandError::Unclosed('}'))?;
                let (_, default, filters) = parse_braced(&template[i + 2..close]);
                if let Some(default) = default {
                    check(default)?;
                }
                for filter in filters {
                    if !FILTER_NAMES.contains(&filter) {
                        return Err(ExpandError::UnknownFilter(filter.to_string()));
                    }
                }
                i = close + 1;
            }
            b'(' => {
                let close = find_matching(bytes, i + 1, b'(', b')')
                    .ok_or(ExpandError::Unclosed(')'))?;
                check(&template[i + 2..close])?;
                i = close + 1;
            }
            _ => i += 2,
        }
    }

    Ok(())
}

/// Copy plain characters up to the next '$' (or the end) in one go.
fn push_byte_run(template: &str, out: &mut String, i: &mut usize) {
    let rest = &template[*i..];
    if let Some(stripped) = rest.strip_prefix('$') {
        // Dangling '$' at the end of the template
        debug_assert!(stripped.is_empty());
        out.push('$');
        *i += 1;
        return;
    }
    let len = rest.find('$').unwrap_or(rest.len());
    out.push_str(&rest[..len]);
    *i += len;
}

/// Find the index of the close byte matching the open byte at `open_at`,
/// counting nested `$<open>` tokens the way the original grammar does.
fn find_matching(bytes: &[u8], open_at: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = open_at + 1;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == open {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Split braced content into (name, default, filters). Separators are only
/// recognized at nesting depth zero, so a default may contain `${...}` or
/// `$(...)` without confusing the parse.
fn parse_braced(content: &str) -> (&str, Option<&str>, Vec<&str>) {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut seg_start = 0;
    let bytes = content.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if i + 1 < bytes.len() && (bytes[i + 1] == b'{' || bytes[i + 1] == b'(') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' | b')' if depth > 0 => depth -= 1,
            b'|' if depth == 0 => {
                segments.push(&content[seg_start..i]);
                seg_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&content[seg_start..]);

    let head = segments[0];
    let filters = segments[1..].to_vec();
    match head.find(":-") {
        Some(at) => (&head[..at], Some(&head[at + 2..]), filters),
        None => (head, None, filters),
    }
}

fn eval_braced(content: &str, ctx: &ExpandContext<'_>) -> Result<String, ExpandError> {
    let (name, default, filters) = parse_braced(content);

    // Defined wins over the default, even when defined as the empty string.
    let mut value = match ctx.env.get(name) {
        Some(v) => v.to_string(),
        None => match default {
            Some(d) => expand(d, ctx)?,
            None => String::new(),
        },
    };

    for filter in filters {
        value = apply_filter(filter, &value)
            .ok_or_else(|| ExpandError::UnknownFilter(filter.to_string()))?;
    }
    Ok(value)
}

fn eval_substitution(command: &str, ctx: &ExpandContext<'_>) -> Result<String, ExpandError> {
    let shell = ctx.env.get("SHELL").unwrap_or("/bin/sh").to_string();
    let args = ["-c".to_string(), command.to_string()];
    let run = run_captured(&shell, &args, ctx.env, ctx.chdir, ctx.timeout).map_err(|e| {
        ExpandError::Substitution {
            command: command.to_string(),
            detail: e.to_string(),
        }
    })?;

    if run.timed_out {
        return Err(ExpandError::Substitution {
            command: command.to_string(),
            detail: "timed out".to_string(),
        });
    }
    match run.exit_code() {
        Some(0) => {}
        Some(code) => {
            return Err(ExpandError::Substitution {
                command: command.to_string(),
                detail: format!("exit code {}", code),
            })
        }
        None => {
            return Err(ExpandError::Substitution {
                command: command.to_string(),
                detail: "terminated by signal".to_string(),
            })
        }
    }

    // Raw stdout, trailing newline included
    Ok(String::from_utf8_lossy(&run.output).into_owned())
}

fn apply_filter(name: &str, value: &str) -> Option<String> {
    let out = match name {
        "strip" => value.trim().to_string(),
        "lstrip" => value.trim_start().to_string(),
        "rstrip" => value.trim_end().to_string(),
        "upper" => value.to_uppercase(),
        "lower" => value.to_lowercase(),
        "title" => {
            let mut out = String::with_capacity(value.len());
            let mut at_word_start = true;
            for c in value.chars() {
                if c.is_alphabetic() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            out
        }
        "capitalize" => {
            let mut chars = value.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        }
        "swapcase" => value
            .chars()
            .flat_map(|c| {
                if c.is_uppercase() {
                    c.to_lowercase().collect::<Vec<_>>()
                } else {
                    c.to_uppercase().collect::<Vec<_>>()
                }
            })
            .collect(),
        _ => return None,
    };
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        let mut env = EnvMap::new();
        for (k, v) in pairs {
            env.set(*k, *v);
        }
        env
    }

    fn ctx(env: &EnvMap) -> ExpandContext<'_> {
        ExpandContext {
            env,
            chdir: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn plain_variable() {
        let env = env(&[("NAME", "world")]);
        assert_eq!(expand("hello ${NAME}", &ctx(&env)).unwrap(), "hello world");
    }

    #[test]
    fn undefined_without_default_is_empty() {
        let env = env(&[]);
        assert_eq!(expand("a${MISSING}b", &ctx(&env)).unwrap(), "ab");
    }

    #[test]
    fn default_taken_when_unset() {
        let env = env(&[]);
        assert_eq!(expand("${X:-fallback}", &ctx(&env)).unwrap(), "fallback");
    }

    #[test]
    fn empty_but_defined_beats_default() {
        let env = env(&[("X", "")]);
        assert_eq!(expand("${X:-fallback}", &ctx(&env)).unwrap(), "");
    }

    #[test]
    fn default_may_contain_nested_expansion() {
        let env = env(&[("Y", "inner")]);
        assert_eq!(expand("${X:-${Y}}", &ctx(&env)).unwrap(), "inner");
    }

    #[test]
    fn filter_chain() {
        let env = env(&[("X", "hello \n")]);
        assert_eq!(expand("${X|rstrip|upper}", &ctx(&env)).unwrap(), "HELLO");
    }

    #[test]
    fn filters_apply_after_default() {
        let env = env(&[]);
        assert_eq!(expand("${X:-abc|upper}", &ctx(&env)).unwrap(), "ABC");
    }

    #[test]
    fn unknown_filter_is_an_error() {
        let env = env(&[("X", "v")]);
        assert_eq!(
            expand("${X|frobnicate}", &ctx(&env)).unwrap_err(),
            ExpandError::UnknownFilter("frobnicate".into())
        );
        assert_eq!(
            check("${X|frobnicate}").unwrap_err(),
            ExpandError::UnknownFilter("frobnicate".into())
        );
    }

    #[test]
    fn no_double_expansion() {
        // A value that is itself expansion syntax stays literal.
        let env = env(&[("FIRST", "${OTHER}"), ("OTHER", "oops")]);
        assert_eq!(expand("${FIRST}", &ctx(&env)).unwrap(), "${OTHER}");
    }

    #[test]
    fn literal_dollar_passes_through() {
        let env = env(&[]);
        assert_eq!(expand("cost: $5 and $X", &ctx(&env)).unwrap(), "cost: $5 and $X");
        assert_eq!(expand("trailing $", &ctx(&env)).unwrap(), "trailing $");
    }

    #[test]
    fn missing_close_brace_is_an_error() {
        assert_eq!(check("${OOPS").unwrap_err(), ExpandError::Unclosed('}'));
        assert_eq!(check("$(oops").unwrap_err(), ExpandError::Unclosed(')'));
    }

    #[test]
    fn command_substitution_keeps_trailing_newline() {
        let env = env(&[]);
        assert_eq!(expand("$(echo hi)", &ctx(&env)).unwrap(), "hi\n");
    }

    #[test]
    fn command_substitution_sees_environment() {
        let env = env(&[("GREETING", "yo")]);
        assert_eq!(expand("$(printf %s \"$GREETING\")", &ctx(&env)).unwrap(), "yo");
    }

    #[test]
    fn failing_substitution_is_an_error() {
        let env = env(&[]);
        let err = expand("$(exit 3)", &ctx(&env)).unwrap_err();
        assert!(matches!(err, ExpandError::Substitution { .. }));
    }

    #[test]
    fn nested_substitution_body_is_expanded_first() {
        let env = env(&[("WORD", "nested")]);
        assert_eq!(expand("$(echo ${WORD})", &ctx(&env)).unwrap(), "nested\n");
    }

    #[test]
    fn filter_registry_transforms() {
        for (filter, input, want) in [
            ("strip", "  x  ", "x"),
            ("lstrip", "  x", "x"),
            ("rstrip", "x \n", "x"),
            ("upper", "aBc", "ABC"),
            ("lower", "AbC", "abc"),
            ("title", "hello there world", "Hello There World"),
            ("capitalize", "hELLO", "Hello"),
            ("swapcase", "aBc", "AbC"),
        ] {
            assert_eq!(apply_filter(filter, input).unwrap(), want, "filter {}", filter);
            assert!(FILTER_NAMES.contains(&filter));
        }
    }
}
