//! Filename tokenization shared by indexing and querying.
//!
//! A name is split on whitespace and punctuation into words. Each word is
//! indexed whole and, when it is written in camel case, also by its parts, so
//! `ProjectPlan.pdf` is found by `project`, `plan`, `projectplan` and `pdf`.

use std::collections::BTreeSet;

/// Returns the distinct lowercase keywords of `name`.
pub fn keywords(name: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in name.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        out.insert(word.to_lowercase());
        let parts = camel_parts(word);
        if parts.len() > 1 {
            out.extend(parts.into_iter().map(|p| p.to_lowercase()));
        }
    }
    out
}

fn camel_parts(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        let (idx, cur) = chars[i];
        let prev = chars[i - 1].1;
        let lower_to_upper = (prev.is_lowercase() || prev.is_numeric()) && cur.is_uppercase();
        // "HTMLParser": break before the 'P' that starts a new capitalised word.
        let acronym_end = prev.is_uppercase()
            && cur.is_uppercase()
            && chars.get(i + 1).is_some_and(|(_, next)| next.is_lowercase());
        if lower_to_upper || acronym_end {
            parts.push(&word[start..idx]);
            start = idx;
        }
    }
    parts.push(&word[start..]);
    parts
}
