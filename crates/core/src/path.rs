//! Field paths and conflict lists.

use std::fmt;

use serde::{Serialize, Serializer};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Field(String),
    Index(usize),
    Key(String),
}

/// A path into an object, rendered like Kubernetes field paths:
/// `spec.template.spec.domain.devices.gpus[0]`, `metadata.annotations[key]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath {
    segments: SmallVec<[Segment; 8]>,
}

impl FieldPath {
    /// Build a path from dotted field names, e.g. `FieldPath::new(&["spec", "template", "spec"])`.
    pub fn new(fields: &[&str]) -> Self {
        let mut p = Self::default();
        for f in fields { p.segments.push(Segment::Field((*f).to_string())); }
        p
    }

    pub fn child(&self, name: &str) -> Self {
        let mut p = self.clone();
        for part in name.split('.') { p.segments.push(Segment::Field(part.to_string())); }
        p
    }

    pub fn index(&self, i: usize) -> Self {
        let mut p = self.clone();
        p.segments.push(Segment::Index(i));
        p
    }

    pub fn key(&self, k: &str) -> Self {
        let mut p = self.clone();
        p.segments.push(Segment::Key(k.to_string()));
        p
    }

    /// The path without its last segment.
    pub fn parent(&self) -> Self {
        let mut p = self.clone();
        p.segments.pop();
        p
    }

    pub fn is_empty(&self) -> bool { self.segments.is_empty() }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segments {
            match seg {
                Segment::Field(name) => {
                    if !first { f.write_str(".")?; }
                    f.write_str(name)?;
                }
                Segment::Index(i) => write!(f, "[{}]", i)?,
                Segment::Key(k) => write!(f, "[{}]", k)?,
            }
            first = false;
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Why a path was reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConflictKind {
    /// The workload already sets a field the instance type owns.
    Ownership,
    /// A preference requirement is not met by the field at this path.
    Requirement { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub path: FieldPath,
    pub kind: ConflictKind,
}

impl Conflict {
    pub fn ownership(path: FieldPath) -> Self { Self { path, kind: ConflictKind::Ownership } }

    pub fn requirement(path: FieldPath, message: impl Into<String>) -> Self {
        Self { path, kind: ConflictKind::Requirement { message: message.into() } }
    }

    pub fn is_requirement(&self) -> bool { matches!(self.kind, ConflictKind::Requirement { .. }) }
}

/// Ordered conflicts, in merge traversal order. Empty means no conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conflicts(SmallVec<[Conflict; 4]>);

impl Conflicts {
    pub fn new() -> Self { Self::default() }
    pub fn push(&mut self, c: Conflict) { self.0.push(c); }
    pub fn extend(&mut self, other: Conflicts) { self.0.extend(other.0); }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> std::slice::Iter<'_, Conflict> { self.0.iter() }
    pub fn first(&self) -> Option<&Conflict> { self.0.first() }

    /// Record an ownership conflict at `path`.
    pub fn conflict(&mut self, path: FieldPath) { self.0.push(Conflict::ownership(path)); }

    pub fn paths(&self) -> Vec<String> { self.0.iter().map(|c| c.path.to_string()).collect() }

    pub fn contains_path(&self, path: &str) -> bool { self.0.iter().any(|c| c.path.to_string() == path) }

    /// Messages of requirement conflicts, in order.
    pub fn requirement_messages(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|c| match &c.kind {
                ConflictKind::Requirement { message } => Some(message.as_str()),
                ConflictKind::Ownership => None,
            })
            .collect()
    }
}

impl fmt::Display for Conflicts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.paths().join(", "))
    }
}

impl FromIterator<Conflict> for Conflicts {
    fn from_iter<I: IntoIterator<Item = Conflict>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl IntoIterator for Conflicts {
    type Item = Conflict;
    type IntoIter = smallvec::IntoIter<[Conflict; 4]>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

impl<'a> IntoIterator for &'a Conflicts {
    type Item = &'a Conflict;
    type IntoIter = std::slice::Iter<'a, Conflict>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}
