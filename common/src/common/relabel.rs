//! Prometheus-style relabeling.
//!
//! A rule list is compiled once from [`RelabelConfig`] entries and then applied
//! to label sets with [`Relabeler::process`]. Rules run in declared order and a
//! dropping rule short-circuits the rest.

use regex::Regex;
use serde::de::IntoDeserializer;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

use crate::common::labels::Labels;
use crate::error::{Error, Result};

pub const DEFAULT_SEPARATOR: &str = ";";
pub const DEFAULT_REGEX: &str = "(.*)";
pub const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Replace,
    Keep,
    Drop,
    KeepEqual,
    DropEqual,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
    Lowercase,
    Uppercase,
}

impl Action {
    fn needs_target_label(self) -> bool {
        matches!(
            self,
            Action::Replace
                | Action::HashMod
                | Action::Lowercase
                | Action::Uppercase
                | Action::KeepEqual
                | Action::DropEqual
        )
    }
}

/// One `relabel_configs` entry as written in the job configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: String,
    pub modulus: u64,
    pub target_label: String,
    pub replacement: String,
    #[serde(deserialize_with = "deserialize_action")]
    pub action: Action,
}

/// Actions are matched case-insensitively, `Keep` and `keep` are the same.
fn deserialize_action<'de, D>(deserializer: D) -> std::result::Result<Action, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?.to_lowercase();
    Action::deserialize(IntoDeserializer::<D::Error>::into_deserializer(name))
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
            regex: DEFAULT_REGEX.to_string(),
            modulus: 0,
            target_label: String::new(),
            replacement: DEFAULT_REPLACEMENT.to_string(),
            action: Action::Replace,
        }
    }
}

/// A validated rule with its pattern compiled as `^(?:regex)$`.
#[derive(Debug, Clone)]
pub struct RelabelRule {
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    modulus: u64,
    target_label: String,
    replacement: String,
    action: Action,
}

impl RelabelRule {
    pub fn new(cfg: &RelabelConfig) -> Result<Self> {
        let anchored = format!("^(?:{})$", cfg.regex);
        let regex = Regex::new(&anchored).map_err(|source| Error::InvalidRegex {
            pattern: cfg.regex.clone(),
            source,
        })?;
        if cfg.action.needs_target_label() && cfg.target_label.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "relabel action {:?} requires a target_label",
                cfg.action
            )));
        }
        if cfg.action == Action::HashMod && cfg.modulus == 0 {
            return Err(Error::InvalidConfig(
                "relabel action hashmod requires a non-zero modulus".to_string(),
            ));
        }
        Ok(Self {
            source_labels: cfg.source_labels.clone(),
            separator: cfg.separator.clone(),
            regex,
            modulus: cfg.modulus,
            target_label: cfg.target_label.clone(),
            replacement: cfg.replacement.clone(),
            action: cfg.action,
        })
    }

    fn joined(&self, lset: &Labels) -> String {
        self.source_labels
            .iter()
            .map(|name| lset.get_or_empty(name))
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Applies the rule in place. Returns `false` when the label set must be dropped.
    fn apply(&self, lset: &mut Labels) -> bool {
        let val = self.joined(lset);
        match self.action {
            Action::Drop => {
                if self.regex.is_match(&val) {
                    return false;
                }
            }
            Action::Keep => {
                if !self.regex.is_match(&val) {
                    return false;
                }
            }
            Action::DropEqual => {
                if lset.get_or_empty(&self.target_label) == val {
                    return false;
                }
            }
            Action::KeepEqual => {
                if lset.get_or_empty(&self.target_label) != val {
                    return false;
                }
            }
            Action::Replace => {
                let Some(caps) = self.regex.captures(&val) else {
                    return true;
                };
                let mut target = String::new();
                caps.expand(&self.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }
                let mut res = String::new();
                caps.expand(&self.replacement, &mut res);
                if res.is_empty() {
                    lset.del(&target);
                } else {
                    lset.set(target, res);
                }
            }
            Action::Lowercase => lset.set(self.target_label.clone(), val.to_lowercase()),
            Action::Uppercase => lset.set(self.target_label.clone(), val.to_uppercase()),
            Action::HashMod => {
                let m = sum64(&val) % self.modulus;
                lset.set(self.target_label.clone(), m.to_string());
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = lset
                    .iter()
                    .filter(|l| self.regex.is_match(&l.name))
                    .map(|l| {
                        let name = self
                            .regex
                            .replace_all(&l.name, self.replacement.as_str())
                            .into_owned();
                        (name, l.value.clone())
                    })
                    .collect();
                for (name, value) in mapped {
                    lset.set(name, value);
                }
            }
            Action::LabelDrop => lset.retain(|l| !self.regex.is_match(&l.name)),
            Action::LabelKeep => lset.retain(|l| self.regex.is_match(&l.name)),
        }
        true
    }
}

/// Ordered, compiled rule list for one job.
#[derive(Debug, Clone, Default)]
pub struct Relabeler {
    rules: Vec<RelabelRule>,
}

impl Relabeler {
    pub fn new(configs: &[RelabelConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(RelabelRule::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Returns the rewritten label set, or `None` when a rule dropped it.
    pub fn process(&self, lset: Labels) -> Option<Labels> {
        apply(lset, &self.rules)
    }
}

pub fn apply(mut lset: Labels, rules: &[RelabelRule]) -> Option<Labels> {
    for rule in rules {
        if !rule.apply(&mut lset) {
            return None;
        }
    }
    Some(lset)
}

fn sum64(val: &str) -> u64 {
    let digest = Sha256::digest(val.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[digest.len() - 8..]);
    u64::from_be_bytes(tail)
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
