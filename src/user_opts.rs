//! `--user NAME=VALUE` options.
//!
//! Repeated options with the same name accumulate into an ordered list.
//! Names are case-insensitive. An option whose name appears in no loaded
//! script source is a configuration error before the run loop starts —
//! the startup-time rendition of "never queried".

use std::collections::HashMap;

use anyhow::bail;

#[derive(Debug, Default)]
pub struct UserOpts {
    values: HashMap<String, Vec<String>>,
    /// Declaration order of first appearance, for stable error reports.
    order: Vec<String>,
}

impl UserOpts {
    /// Parse `NAME=VALUE` pairs as given on the command line.
    pub fn parse(pairs: &[String]) -> anyhow::Result<Self> {
        let mut opts = Self::default();
        for pair in pairs {
            let Some((name, value)) = pair.split_once('=') else {
                bail!("bad --user option '{pair}' (expected NAME=VALUE)");
            };
            let name = name.trim().to_uppercase();
            if name.is_empty() {
                bail!("bad --user option '{pair}' (empty name)");
            }
            if !opts.values.contains_key(&name) {
                opts.order.push(name.clone());
            }
            opts.values.entry(name).or_default().push(value.to_string());
        }
        Ok(opts)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(&name.to_uppercase()).map(Vec::as_slice)
    }

    /// Option names that no loaded source text mentions.
    pub fn unreferenced(&self, sources: &[(String, String)]) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                !sources
                    .iter()
                    .any(|(_, text)| text.to_uppercase().contains(name.as_str()))
            })
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
