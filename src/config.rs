//! Target-set configuration
//! Turns command-line flags and targets files into `TargetSpec`s.
//! Nothing here touches the filesystem except `load_targets_file`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One raw, unvalidated target set: the four values an operator supplies
/// for a virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetSpec {
    pub host: String,
    pub target_url: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TargetSpec {
    pub fn new(
        host: impl Into<String>,
        target_url: impl Into<String>,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            target_url: target_url.into(),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }
}

/// One of the four repeatable target-set flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFlag {
    Host,
    TargetUrl,
    CertFile,
    KeyFile,
}

impl TargetFlag {
    pub const ALL: [TargetFlag; 4] = [
        TargetFlag::Host,
        TargetFlag::TargetUrl,
        TargetFlag::CertFile,
        TargetFlag::KeyFile,
    ];

    /// Flag name as spelled on the command line.
    pub fn name(self) -> &'static str {
        match self {
            TargetFlag::Host => "host",
            TargetFlag::TargetUrl => "targeturl",
            TargetFlag::CertFile => "certfile",
            TargetFlag::KeyFile => "keyfile",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Occurrences of the `--host`, `--targeturl`, `--certfile` and `--keyfile`
/// flags, each with its position on the command line.
#[derive(Debug, Default, Clone)]
pub struct TargetFlags {
    occurrences: Vec<(usize, TargetFlag, String)>,
}

impl TargetFlags {
    pub fn push(&mut self, position: usize, flag: TargetFlag, value: impl Into<String>) {
        self.occurrences.push((position, flag, value.into()));
    }

    /// Group occurrences into target sets in command-line order.
    ///
    /// A set is the run of flags up to the first repeat of a flag it already
    /// has; order inside a set does not matter. A set lacking one of the four
    /// flags is reported by its index, naming the first missing flag.
    pub fn into_specs(mut self) -> Result<Vec<TargetSpec>, ConfigError> {
        self.occurrences.sort_by_key(|(position, _, _)| *position);

        let mut specs = Vec::new();
        let mut current: [Option<String>; 4] = Default::default();

        for (_, flag, value) in self.occurrences {
            if current[flag.slot()].is_some() {
                let set = std::mem::take(&mut current);
                specs.push(complete_set(specs.len(), set)?);
            }
            current[flag.slot()] = Some(value);
        }

        if current.iter().any(Option::is_some) {
            specs.push(complete_set(specs.len(), current)?);
        }

        Ok(specs)
    }
}

fn complete_set(index: usize, set: [Option<String>; 4]) -> Result<TargetSpec, ConfigError> {
    if let Some(flag) = TargetFlag::ALL.into_iter().find(|f| set[f.slot()].is_none()) {
        return Err(ConfigError::MissingFlag {
            index,
            flag: flag.name(),
        });
    }

    let [host, target_url, cert_file, key_file] = set.map(Option::unwrap_or_default);
    Ok(TargetSpec::new(host, target_url, cert_file, key_file))
}

/// Read a JSON array of target sets:
/// `[{"host": "..", "target_url": "..", "cert_file": "..", "key_file": ".."}]`
pub fn load_targets_file(path: &Path) -> Result<Vec<TargetSpec>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::TargetsFileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&raw).map_err(|source| ConfigError::TargetsFileInvalid {
        path: path.to_path_buf(),
        source,
    })
}
