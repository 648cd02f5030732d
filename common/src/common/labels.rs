use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

const SEP: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=\"{}\"", self.name, self.value)
    }
}

/// Label set kept sorted by name with unique names.
///
/// Sorting on every mutation makes equality, display and hashing independent
/// of the order labels were discovered in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(labels: Vec<Label>) -> Self {
        let mut lset = Labels(Vec::with_capacity(labels.len()));
        for label in labels {
            lset.set(label.name, label.value);
        }
        lset
    }

    pub fn from_map<K, V, I>(map: I) -> Labels
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Labels::new(map.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// Returns the value of `name`, or the empty string when it is absent.
    pub fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Ok(idx) => self.0[idx].value = value,
            Err(idx) => self.0.insert(idx, Label { name, value }),
        }
    }

    /// Sets `name` only when it is not present yet.
    pub fn set_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if let Err(idx) = self.position(name) {
            self.0.insert(idx, Label::new(name, value));
        }
    }

    pub fn del(&mut self, name: &str) -> Option<String> {
        self.position(name).ok().map(|idx| self.0.remove(idx).value)
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Label) -> bool,
    {
        self.0.retain(f)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Feeds every label into `hasher` as `name 0xff value 0xff`, in name order.
    pub fn digest_into(&self, hasher: &mut Sha256) {
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update([SEP]);
            hasher.update(label.value.as_bytes());
            hasher.update([SEP]);
        }
    }

    fn position(&self, name: &str) -> Result<usize, usize> {
        self.0.binary_search_by(|l| l.name.as_str().cmp(name))
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        // already ordered and unique
        Labels(map.into_iter().map(|(name, value)| Label { name, value }).collect())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", label)?;
        }
        write!(f, "}}")
    }
}
