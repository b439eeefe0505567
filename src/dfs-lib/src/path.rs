use crate::{DfsError, DfsResult};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A filesystem path: an immutable sequence of components. The root is the
/// empty sequence and renders as `/`.
///
/// Components never contain `/` (the delimiter) or `:` (reserved for
/// application use) and are never empty.
///
/// Paths carry a total order used whenever several of them must be locked
/// together: locking in increasing order prevents two holders from waiting
/// on each other. The order compares component-wise, with a strict prefix
/// sorting before its extensions, so an ancestor always precedes every
/// descendant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DfsPath {
    components: Vec<String>,
}

fn check_component(component: &str) -> DfsResult<()> {
    if component.is_empty() {
        return Err(DfsError::InvalidArgument(
            "path component is empty".to_string(),
        ));
    }
    if component.contains('/') || component.contains(':') {
        return Err(DfsError::InvalidArgument(format!(
            "path component {:?} contains a reserved character",
            component
        )));
    }
    Ok(())
}

impl DfsPath {
    /// The root directory.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parses a `/`-delimited path string. The string must begin with `/`;
    /// empty components are dropped.
    pub fn parse(s: &str) -> DfsResult<Self> {
        if !s.starts_with('/') {
            return Err(DfsError::InvalidArgument(format!(
                "path {:?} does not start with '/'",
                s
            )));
        }
        let mut components = Vec::new();
        for part in s.split('/') {
            if part.is_empty() {
                continue;
            }
            check_component(part)?;
            components.push(part.to_string());
        }
        Ok(Self { components })
    }

    /// A new path with `component` appended.
    pub fn child(&self, component: &str) -> DfsResult<Self> {
        check_component(component)?;
        let mut components = self.components.clone();
        components.push(component.to_string());
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// The path with the last component dropped; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// The last component; `None` for the root.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether `prefix` is an ancestor of this path or the path itself.
    pub fn starts_with(&self, prefix: &DfsPath) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// The lock chain: this path and every strict ancestor up to and
    /// including the root, leaf first.
    pub fn ancestry(&self) -> Vec<DfsPath> {
        let mut chain = Vec::with_capacity(self.components.len() + 1);
        let mut current = self.clone();
        loop {
            let parent = current.parent();
            chain.push(current);
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }
        chain
    }
}

impl fmt::Display for DfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for DfsPath {
    type Err = DfsError;

    fn from_str(s: &str) -> DfsResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for DfsPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DfsPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DfsPath::parse(&s).map_err(D::Error::custom)
    }
}
