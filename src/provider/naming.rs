/// Physical cluster naming
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::resource::{Cluster, PropertyMap};

const SUFFIX_LEN: usize = 8;
const MAX_NAME_LEN: usize = 63;

/// `<logical>-<8 random [a-z0-9]>`, trimmed to a DNS-1123 label
pub fn autoname(logical: &str) -> String {
    let mut prefix: String = logical
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    prefix.truncate(MAX_NAME_LEN - SUFFIX_LEN - 1);
    let prefix = prefix.trim_matches('-');
    let prefix = if prefix.is_empty() { "kind" } else { prefix };

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(SUFFIX_LEN)
        .collect();

    format!("{}-{}", prefix, suffix)
}

/// Explicit `name` input, if any
pub fn explicit_name(inputs: &PropertyMap) -> Option<&str> {
    inputs
        .get(Cluster::NAME)
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
}

/// Physical name for a create: the explicit one or a fresh autoname
pub fn assign_name(logical: &str, inputs: &PropertyMap) -> String {
    explicit_name(inputs)
        .map(str::to_string)
        .unwrap_or_else(|| autoname(logical))
}

/// Keep the previous physical name across a replace when no explicit name is given
pub fn adopt_old_name(inputs: &mut PropertyMap, old_name: Option<&str>) {
    if explicit_name(inputs).is_some() {
        return;
    }
    if let Some(old) = old_name.filter(|name| !name.is_empty()) {
        inputs.insert(Cluster::NAME.to_string(), Value::String(old.to_string()));
    }
}
