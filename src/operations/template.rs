//! `${{NAME}}` placeholder handling.
//!
//! Names are upper snake case (`[A-Z]+(_[A-Z]+)*`). Substituted values are
//! inserted verbatim; commands are later split with shell-word rules and
//! executed directly, never through a shell.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{([A-Z]+(?:_[A-Z]+)*)\}\}").expect("placeholder regex"));

/// Distinct placeholder names in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn token(name: &str) -> String {
    format!("${{{{{name}}}}}")
}

/// Remove every `${{NAME}}` together with a directly preceding `--flag=`.
///
/// The flag name may not contain whitespace, unlike the looser `(--[^=]+=)?`
/// form, so an earlier `--flag` on the same line is never swallowed.
fn remove_placeholder(template: &str, name: &str) -> String {
    let pattern = format!(r"(--[^=\s]+=)?\$\{{\{{{}\}}\}}", regex::escape(name));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(template, "").into_owned(),
        Err(_) => template.replace(&token(name), ""),
    }
}

/// Substitute resolved values into `template`.
///
/// Empty values drop the placeholder and its `--flag=` prefix entirely,
/// others replace it literally. The result is trimmed.
pub fn substitute(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut filled = template.to_string();
    for (name, value) in values {
        filled = if value.is_empty() {
            remove_placeholder(&filled, name)
        } else {
            filled.replace(&token(name), value)
        };
    }
    filled.trim().to_string()
}

/// Substitute every placeholder, or return the names that have no value.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String, Vec<String>> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|name| !values.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }
    Ok(substitute(template, values))
}

/// Hex-encoded SHA-256 of a filled command.
pub fn content_hash(command: &str) -> String {
    hex::encode(Sha256::digest(command.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_distinct_and_ordered() {
        let names = placeholders("${{B}} ${{A_B}} ${{B}} ${{lower}} ${{A__B}} ${{C}}");
        assert_eq!(names, vec!["B", "A_B", "C"]);
    }

    #[test]
    fn substitute_replaces_literally() {
        let out = substitute("echo ${{A}} ${{A}}", &values(&[("A", "x; rm -rf /")]));
        assert_eq!(out, "echo x; rm -rf / x; rm -rf /");
    }

    #[test]
    fn empty_value_removes_flag_fragment() {
        let out = substitute(
            "tool --verbose --region=${{REGION}} ${{TARGET}}",
            &values(&[("REGION", ""), ("TARGET", "vm-1")]),
        );
        assert_eq!(out, "tool --verbose  vm-1");
    }

    #[test]
    fn empty_value_without_flag_removes_only_token() {
        let out = substitute("a ${{X}} b", &values(&[("X", "")]));
        assert_eq!(out, "a  b");
    }

    #[test]
    fn render_reports_missing_names() {
        let err = render("${{A}} ${{B}} ${{C}}", &values(&[("B", "1")])).unwrap_err();
        assert_eq!(err, vec!["A", "C"]);
        let ok = render("${{A}}-${{B}}", &values(&[("A", "x"), ("B", "y")])).unwrap();
        assert_eq!(ok, "x-y");
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = content_hash("test1 test2");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("test1 test2"));
        assert_ne!(h, content_hash("test1 test3"));
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
