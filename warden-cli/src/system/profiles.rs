//! Configuration profiles from `profiles list`.

use std::collections::BTreeMap;
use warden_core::{ProfileCollector, ProfileDescriptor, Result};

use super::run;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfilesCommand;

fn split_field(line: &str) -> Option<(String, String)> {
    if let Some(rest) = line.strip_prefix("attribute: ") {
        let (name, value) = rest.split_once(':')?;
        return Some((format!("attribute: {}", name.trim()), value.trim().to_string()));
    }
    let (key, value) = line.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Group `profiles list` output into per-profile field maps.
///
/// Lines carrying a `_scope[n]` prefix are grouped by that prefix; other
/// `key: value` lines belong to the current block, which a blank line ends.
pub fn parse_profiles(output: &str) -> Vec<ProfileDescriptor> {
    let mut blocks: Vec<(Option<String>, BTreeMap<String, String>)> = Vec::new();
    let mut open = false;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            open = false;
            continue;
        }

        let (scope, rest) = match line.split_once(' ') {
            Some((head, rest)) if head.ends_with(']') && head.contains('[') => {
                (Some(head.to_string()), rest.trim())
            }
            _ => (None, line),
        };
        let Some((key, value)) = split_field(rest) else {
            continue;
        };

        let block = match &scope {
            Some(_) => blocks.iter().position(|(s, _)| *s == scope),
            None if open => blocks.len().checked_sub(1),
            None => None,
        };
        match block {
            Some(index) => {
                blocks[index].1.insert(key, value);
            }
            None => blocks.push((scope, BTreeMap::from([(key, value)]))),
        }
        open = true;
    }

    blocks
        .into_iter()
        .filter_map(|(_, fields)| ProfileDescriptor::from_fields(fields))
        .collect()
}

impl ProfileCollector for ProfilesCommand {
    fn collect(&self) -> Result<Vec<ProfileDescriptor>> {
        let output = run("profiles", &["list", "-all"])?;
        Ok(parse_profiles(&String::from_utf8_lossy(&output.stdout)))
    }
}
