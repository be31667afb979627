// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! `{{name}}` string interpolation.
//!
//! Substitution is textual and shallow: `{{a.b.c}}` looks up the literal key
//! `"a.b.c"` in the table, never a nested field of a structured value. The
//! table itself only ever holds `String`s — dynamic/structured data (loop
//! items, tool arguments) is marshalled to JSON only at those specific
//! boundaries, never inside the interpolator.

use std::collections::HashMap;

/// Built-in namespace prefixes/names the Variable Validator treats as always
/// resolvable, regardless of the static DAG.
pub const BUILTIN_BASES: &[&str] = &["input", "loop", "env", "iteration", "item", "index", "consensus"];

/// Single string-keyed variable table backing all interpolation in a
/// workflow (or sub-workflow) execution.
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    table: HashMap<String, String>,
}

impl Interpolator {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Seeds `{{input}}` for a fresh (sub-)workflow execution.
    pub fn with_input(input: impl Into<String>) -> Self {
        let mut me = Self::new();
        me.set("input", input);
        me
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.table.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.table.get(key).map(|s| s.as_str())
    }

    /// Populates the `env.*` namespace from a workflow's `env:` map.
    pub fn set_env(&mut self, env: &HashMap<String, String>) {
        for (k, v) in env {
            self.set(format!("env.{k}"), v.clone());
        }
    }

    /// Populates the reserved `loop.*` namespace for the current iteration.
    /// Overwrites whatever was there for the previous iteration.
    pub fn set_loop_vars(&mut self, iteration: u32, last_output: &str, history: &[String]) {
        self.set("loop.iteration", iteration.to_string());
        self.set("iteration", iteration.to_string());
        self.set("loop.output", last_output.to_string());
        self.set("loop.last.output", last_output.to_string());
        self.set("loop.history", history.join("\n---\n"));
    }

    /// Populates `item` / `index` for one iterate-mode element.
    pub fn set_iterate_vars(&mut self, item_json: &str, index: usize) {
        self.set("item", item_json.to_string());
        self.set("index", index.to_string());
    }

    /// Scans `text` for `{{...}}` tokens, substituting each trimmed inner
    /// name from the table. Unknown names are left untouched in the output
    /// (so the string remains readable) and collected into the returned
    /// list, in first-seen order, deduplicated.
    pub fn interpolate(&self, text: &str) -> (String, Vec<String>) {
        let mut out = String::with_capacity(text.len());
        let mut missing = Vec::new();
        let mut seen_missing = std::collections::HashSet::new();

        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if let Some(end) = find_close(text, i + 2) {
                    let inner = &text[i + 2..end];
                    let key = inner.trim();
                    match self.table.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str(&text[i..end + 2]);
                            if seen_missing.insert(key.to_string()) {
                                missing.push(key.to_string());
                            }
                        }
                    }
                    i = end + 2;
                    continue;
                }
            }
            // Push one char (byte-accurate for ASCII token delimiters; UTF-8
            // continuation bytes are copied verbatim since we never split
            // inside a multi-byte sequence below).
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
        }

        (out, missing)
    }

    /// Extracts the set of `{{base}}` base names referenced in `text`,
    /// without performing any substitution. Used by the Variable Validator.
    pub fn extract_references(text: &str) -> Vec<String> {
        let mut refs = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if let Some(end) = find_close(text, i + 2) {
                    let key = text[i + 2..end].trim().to_string();
                    if !key.is_empty() && seen.insert(key.clone()) {
                        refs.push(key);
                    }
                    i = end + 2;
                    continue;
                }
            }
            i += utf8_len(bytes[i]);
        }
        refs
    }
}

fn find_close(text: &str, from: usize) -> Option<usize> {
    text[from..].find("}}").map(|pos| from + pos)
}

fn utf8_len(byte: u8) -> usize {
    if byte & 0b1000_0000 == 0 {
        1
    } else if byte & 0b1110_0000 == 0b1100_0000 {
        2
    } else if byte & 0b1111_0000 == 0b1110_0000 {
        3
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_single_token() {
        let mut it = Interpolator::new();
        it.set("name", "world");
        let (out, missing) = it.interpolate("hello {{name}}");
        assert_eq!(out, "hello world");
        assert!(missing.is_empty());
    }

    #[test]
    fn substitutes_repeated_token() {
        let mut it = Interpolator::new();
        it.set("x", "1");
        let (out, _) = it.interpolate("{{x}}-{{x}}-{{x}}");
        assert_eq!(out, "1-1-1");
    }

    #[test]
    fn trims_whitespace_inside_braces() {
        let mut it = Interpolator::new();
        it.set("name", "world");
        let (out, _) = it.interpolate("hello {{ name }}");
        assert_eq!(out, "hello world");
    }

    #[test]
    fn reports_missing_but_keeps_token() {
        let it = Interpolator::new();
        let (out, missing) = it.interpolate("hello {{unknown}}");
        assert_eq!(out, "hello {{unknown}}");
        assert_eq!(missing, vec!["unknown".to_string()]);
    }

    #[test]
    fn dotted_reference_is_a_literal_key_not_a_path() {
        let mut it = Interpolator::new();
        it.set("a.b.c", "flat");
        let (out, missing) = it.interpolate("{{a.b.c}}");
        assert_eq!(out, "flat");
        assert!(missing.is_empty());
    }

    #[test]
    fn idempotent_on_text_without_markers() {
        let it = Interpolator::new();
        let (out1, _) = it.interpolate("plain text, no markers here");
        let (out2, _) = it.interpolate(&out1);
        assert_eq!(out1, out2);
        assert_eq!(out1, "plain text, no markers here");
    }

    #[test]
    fn loop_vars_overwrite_each_iteration() {
        let mut it = Interpolator::new();
        it.set_loop_vars(0, "first", &["first".to_string()]);
        assert_eq!(it.get("loop.iteration"), Some("0"));
        assert_eq!(it.get("loop.output"), Some("first"));
        it.set_loop_vars(1, "second", &["first".to_string(), "second".to_string()]);
        assert_eq!(it.get("loop.iteration"), Some("1"));
        assert_eq!(it.get("loop.output"), Some("second"));
        assert_eq!(it.get("loop.history"), Some("first\n---\nsecond"));
    }

    #[test]
    fn extract_references_dedupes_and_preserves_order() {
        let refs = Interpolator::extract_references("{{b}} and {{a}} and {{b}} again");
        assert_eq!(refs, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn env_namespace_is_prefixed() {
        let mut it = Interpolator::new();
        let mut env = HashMap::new();
        env.insert("API_URL".to_string(), "https://x".to_string());
        it.set_env(&env);
        assert_eq!(it.get("env.API_URL"), Some("https://x"));
    }
}
