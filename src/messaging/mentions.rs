//! `@name` extraction from message bodies.

use std::sync::OnceLock;

use regex::Regex;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `@` must start the text or follow a character that cannot be part of an
    // address, so `user@example.com` is not a mention.
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9][\w\-.:]*)").expect("mention regex is valid")
    })
}

/// Mentioned names in order of first appearance, without duplicates.
pub fn extract_mentions(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in mention_regex().captures_iter(body) {
        let name = caps[1].trim_end_matches(['.', ':', '-']);
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}
