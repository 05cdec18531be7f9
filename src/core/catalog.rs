// src/core/catalog.rs

//! Loads the spawnable-process catalog from its startup file.
//!
//! Each non-comment line is `processName targetHost executable [options...]`.
//! Target hosts other than `any`/`local` are resolved once at load time;
//! entries that fail to parse are logged and skipped.

use std::collections::HashMap;
use std::fs;
use std::net::ToSocketAddrs;
use std::path::Path;
use tracing::{info, warn};

/// Where a template wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    /// Always on the node that received the request.
    Local,
    /// Anywhere; the master's scheduler decides.
    Any,
    /// A specific node label (`node0`...).
    Node(String),
    /// A resolved IP address.
    Address(String),
}

impl TargetHost {
    fn parse(raw: &str) -> Self {
        match raw {
            "local" => TargetHost::Local,
            "any" => TargetHost::Any,
            label if label.starts_with("node") && label[4..].chars().all(|c| c.is_ascii_digit()) => {
                TargetHost::Node(label.to_string())
            }
            host => {
                // Resolve DNS names once at load; an unresolvable host keeps
                // its raw spelling so node-label matching can still work.
                let resolved = (host, 0u16)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| host.to_string());
                TargetHost::Address(resolved)
            }
        }
    }
}

/// One spawnable process template. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessTemplate {
    pub name: String,
    pub target_host: TargetHost,
    pub executable: String,
    pub options: String,
}

impl ProcessTemplate {
    /// The full command line for a spawn: executable, default options, then
    /// caller options (duplicates in the caller's options override by
    /// appearing later on the command line).
    pub fn command_line(&self, caller_options: &str) -> String {
        let mut cmd = self.executable.clone();
        for part in [self.options.as_str(), caller_options] {
            if !part.trim().is_empty() {
                cmd.push(' ');
                cmd.push_str(part.trim());
            }
        }
        cmd
    }
}

/// The process-template catalog, keyed by unique template name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    templates: HashMap<String, ProcessTemplate>,
}

impl Catalog {
    /// Loads the catalog from a whitespace-delimited text file.
    ///
    /// A missing file yields an empty catalog with a warning; every spawn
    /// against it will then fail its lookup, which is the degraded behavior
    /// operators expect from a misplaced rc file.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not open catalog file {}: {}", path.display(), e);
                return Self::default();
            }
        };
        let catalog = Self::parse(&contents);
        info!(
            "Loaded {} process templates from {}",
            catalog.templates.len(),
            path.display()
        );
        catalog
    }

    /// Parses catalog text. Split out from `load` for tests.
    pub fn parse(contents: &str) -> Self {
        let mut templates = HashMap::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let Some(name) = fields.next() else {
                continue;
            };
            let Some(target) = fields.next() else {
                warn!("Missing target host in catalog entry: [{trimmed}]");
                continue;
            };
            let Some(executable) = fields.next() else {
                warn!("Missing executable name in catalog entry: [{trimmed}]");
                continue;
            };
            let options = fields.collect::<Vec<_>>().join(" ");

            let template = ProcessTemplate {
                name: name.to_string(),
                target_host: TargetHost::parse(target),
                executable: executable.to_string(),
                options,
            };
            if templates.insert(name.to_string(), template).is_some() {
                warn!("Duplicate catalog entry for '{name}'; later entry wins");
            }
        }
        Self { templates }
    }

    pub fn get(&self, process_name: &str) -> Option<&ProcessTemplate> {
        self.templates.get(process_name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
