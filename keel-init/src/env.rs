// SPDX-License-Identifier: GPL-2.0-only
use std::collections::HashMap;

/// PATH for images that set none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Split `KEY=VALUE`. Entries without `=` or with an empty key are
/// rejected. Values may contain `=`.
pub fn split_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=').filter(|(key, _)| !key.is_empty())
}

/// Image defaults overlaid with the metadata environment. A later value
/// for a key replaces the earlier one in place; PATH is added when
/// neither side sets it.
pub fn merge(image: &[String], metadata: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut values: HashMap<String, String> = HashMap::new();
    for entry in image.iter().chain(metadata) {
        let Some((key, value)) = split_entry(entry) else {
            continue;
        };
        if values.insert(key.to_string(), value.to_string()).is_none() {
            order.push(key.to_string());
        }
    }
    if !values.contains_key("PATH") {
        order.push("PATH".to_string());
        values.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    }
    order
        .into_iter()
        .map(|key| {
            let value = values.remove(&key).unwrap_or_default();
            format!("{key}={value}")
        })
        .collect()
}

pub fn lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .filter_map(|e| split_entry(e))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn metadata_overrides_image_defaults() {
        let env = merge(
            &strings(&["PORT=3000", "MODE=dev", "PATH=/app/bin"]),
            &strings(&["PORT=8080", "SECRET=a=b"]),
        );
        assert_eq!(env, strings(&["PORT=8080", "MODE=dev", "PATH=/app/bin", "SECRET=a=b"]));
    }

    #[test]
    fn default_path_is_added() {
        let env = merge(&[], &strings(&["GREETING=hello"]));
        assert_eq!(lookup(&env, "PATH"), Some(DEFAULT_PATH));
        assert_eq!(lookup(&env, "GREETING"), Some("hello"));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let env = merge(&strings(&["NOEQUALS", "=nokey", "A=1"]), &[]);
        assert_eq!(env, strings(&["A=1", &format!("PATH={DEFAULT_PATH}")]));
    }
}
