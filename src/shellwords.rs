//! Bourne-style command line splitting and escaping.
//!
//! `split` tokenizes a command line the way `/bin/sh` would; `escape` and
//! `join` render an argv back into a string that `split` round-trips.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::OnceLock;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\s*(?:([^\s\\'"]+)|'([^']*)'|"((?:[^"\\]|\\.)*)"|(\\.?)|(\S))(\s|$)?"#)
            .expect("token regex")
    })
}

fn double_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Inside double quotes only $, backtick, ", \ and newline are escapable.
    RE.get_or_init(|| Regex::new("\\\\([$`\"\\\\\n])").expect("double quote regex"))
}

fn escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\(.)").expect("escape regex"))
}

/// Split a command line into tokens the way the UNIX Bourne shell does.
///
/// Fails when the input contains an unmatched single or double quote.
pub fn split(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut field = String::new();

    for caps in token_re().captures_iter(input) {
        if caps.get(5).is_some() {
            bail!("unmatched quote: `{input}`");
        }

        if let Some(word) = caps.get(1) {
            field.push_str(word.as_str());
        } else if let Some(sq) = caps.get(2) {
            field.push_str(sq.as_str());
        } else if let Some(dq) = caps.get(3) {
            field.push_str(&double_quote_re().replace_all(dq.as_str(), "$1"));
        } else if let Some(esc) = caps.get(4) {
            field.push_str(&escape_re().replace_all(esc.as_str(), "$1"));
        }

        if caps.get(6).is_some() {
            words.push(std::mem::take(&mut field));
        }
    }

    Ok(words)
}

/// Escape a string so it survives a Bourne shell command line unchanged.
///
/// Empty input renders as `''`; embedded newlines are wrapped in single
/// quotes so the token round-trips through [`split`].
pub fn escape(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\n' => out.push_str("'\n'"),
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ',' | ':' | '+' | '/' | '@') => {
                out.push(c);
            }
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}

/// Build a command line from an argument list, escaping each argument.
pub fn join(inputs: &[String]) -> String {
    inputs
        .iter()
        .map(|s| escape(s))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_quoted_arguments() {
        let result = split(r#"ruby -i'.bak' -pe "sub /foo/, '\\&bar'" foobar\ me.txt"#)
            .expect("split should succeed");
        assert_eq!(
            result,
            vec![
                "ruby",
                "-i.bak",
                "-pe",
                r"sub /foo/, '\&bar'",
                "foobar me.txt",
            ]
        );
    }

    #[test]
    fn split_bare_words() {
        let result = split("ruby my_prog.rb | less").expect("split should succeed");
        assert_eq!(result, vec!["ruby", "my_prog.rb", "|", "less"]);
    }

    #[test]
    fn split_empty_input() {
        assert!(split("").expect("split should succeed").is_empty());
        assert!(split("   ").expect("split should succeed").is_empty());
    }

    #[test]
    fn split_unmatched_quotes() {
        for cmd in [r#"one two "three"#, "one two 'three", r#"one '""""#] {
            let err = split(cmd).expect_err("unmatched quote should fail");
            assert!(err.to_string().contains("unmatched quote"), "{cmd}");
        }
    }

    #[test]
    fn split_backslash_sequences() {
        // Lone escapes outside quotes collapse; quoted runs keep their
        // backslashes per the quoting style.
        let cases = [
            (
                r#"/a//b///c////d/////e/ "/a//b///c////d/////e/ "'/a//b///c////d/////e/ '/a//b///c////d/////e/ "#,
                vec!["a/b/c//d//e /a/b//c//d///e/ /a//b///c////d/////e/ a/b/c//d//e "],
            ),
            (
                "printf %s /\"/$/`///\"/r/n",
                vec!["printf", "%s", "\"$`/\"rn"],
            ),
            (
                "printf %s \"/\"/$/`///\"/r/n\"",
                vec!["printf", "%s", "\"$`/\"/r/n"],
            ),
        ];
        for (cmdline, expected) in cases {
            let cmdline = cmdline.replace('/', "\\");
            let expected: Vec<String> = expected.iter().map(|s| s.replace('/', "\\")).collect();
            let result = split(&cmdline).expect("split should succeed");
            assert_eq!(result, expected, "input: {cmdline}");
        }
    }

    #[test]
    fn split_trailing_backslash_is_literal() {
        assert_eq!(split(r"abc\").expect("split should succeed"), vec![r"abc\"]);
    }

    #[test]
    fn escape_empty_and_specials() {
        assert_eq!(escape(""), "''");
        assert_eq!(
            escape("^AZaz09_\\-.,:/@\n+'\""),
            "\\^AZaz09_\\\\-.,:/@'\n'+\\'\\\""
        );
    }

    #[test]
    fn escape_multibyte_characters() {
        assert_eq!(escape("あい"), "\\あ\\い");
    }

    #[test]
    fn join_round_trips_whitespace_tokens() {
        let tokens: Vec<String> = ["", " ", "  ", "\n", "\n\n", "\t", "\t\t", "", " \n\t", ""]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        for token in &tokens {
            let escaped = escape(token);
            let result = split(&escaped).expect("split should succeed");
            assert_eq!(result.len(), 1);
            assert_eq!(&result[0], token);
        }

        let joined = join(&tokens);
        let result = split(&joined).expect("split should succeed");
        assert_eq!(result, tokens);
    }

    #[test]
    fn split_join_law_on_mixed_argv() {
        let argv: Vec<String> = [
            "cat",
            "-n",
            "file with spaces.txt",
            "",
            "line1\nline2",
            "quote'inside",
            "dollar$sign",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        assert_eq!(split(&join(&argv)).expect("split should succeed"), argv);
    }
}
