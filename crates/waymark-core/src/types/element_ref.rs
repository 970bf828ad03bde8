//! Element references.
//!
//! An [`ElementRef`] names an element by type and id; a
//! [`VersionedElementRef`] additionally pins one version. Both have compact
//! string forms (`n123`, `n123v1`) used in URLs and JSON payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{WaymarkError, WaymarkResult};

/// The three versioned geographic entity kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    /// One-letter prefix used in string references.
    pub fn prefix(&self) -> char {
        match self {
            Self::Node => 'n',
            Self::Way => 'w',
            Self::Relation => 'r',
        }
    }

    /// Parse the one-letter prefix of a string reference.
    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'n' => Some(Self::Node),
            'w' => Some(Self::Way),
            'r' => Some(Self::Relation),
            _ => None,
        }
    }

    /// Get the storage name (`node`, `way`, `relation`).
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Whether elements of this type may list `member` as a member.
    pub fn accepts_member(&self, member: ElementType) -> bool {
        match self {
            Self::Node => false,
            Self::Way => member == Self::Node,
            Self::Relation => true,
        }
    }
}

/// Identifies an element by type and id.
///
/// Negative ids are client-local placeholders that only exist inside a diff
/// batch. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementRef {
    pub element_type: ElementType,
    pub id: i64,
}

impl ElementRef {
    /// Create a reference. Callers must not pass id 0; parsing rejects it.
    pub const fn new(element_type: ElementType, id: i64) -> Self {
        Self { element_type, id }
    }

    /// Create a node reference.
    pub const fn node(id: i64) -> Self {
        Self::new(ElementType::Node, id)
    }

    /// Create a way reference.
    pub const fn way(id: i64) -> Self {
        Self::new(ElementType::Way, id)
    }

    /// Create a relation reference.
    pub const fn relation(id: i64) -> Self {
        Self::new(ElementType::Relation, id)
    }

    /// Whether this is a client-local placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.id < 0
    }

    /// Pin a version.
    pub fn with_version(self, version: u32) -> VersionedElementRef {
        VersionedElementRef {
            element_type: self.element_type,
            id: self.id,
            version,
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.element_type.prefix(), self.id)
    }
}

impl FromStr for ElementRef {
    type Err = WaymarkError;

    /// Parse `n123`, `w-5`, `r42`.
    fn from_str(s: &str) -> WaymarkResult<Self> {
        let (element_type, rest) = split_prefix(s)?;
        let id = parse_id(s, rest)?;
        Ok(Self::new(element_type, id))
    }
}

impl TryFrom<String> for ElementRef {
    type Error = WaymarkError;

    fn try_from(value: String) -> WaymarkResult<Self> {
        value.parse()
    }
}

impl From<ElementRef> for String {
    fn from(value: ElementRef) -> Self {
        value.to_string()
    }
}

/// Identifies one exact version of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionedElementRef {
    pub element_type: ElementType,
    pub id: i64,
    pub version: u32,
}

impl VersionedElementRef {
    /// Create a versioned reference.
    pub const fn new(element_type: ElementType, id: i64, version: u32) -> Self {
        Self {
            element_type,
            id,
            version,
        }
    }

    /// Drop the version.
    pub fn element_ref(&self) -> ElementRef {
        ElementRef::new(self.element_type, self.id)
    }

    /// Parse the typeless `123v1` form for a known element type.
    pub fn from_type_str(element_type: ElementType, s: &str) -> WaymarkResult<Self> {
        let (id, version) = split_version(s, s)?;
        Ok(Self::new(element_type, id, version))
    }
}

impl fmt::Display for VersionedElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}v{}",
            self.element_type.prefix(),
            self.id,
            self.version
        )
    }
}

impl FromStr for VersionedElementRef {
    type Err = WaymarkError;

    /// Parse `n123v1`.
    fn from_str(s: &str) -> WaymarkResult<Self> {
        let (element_type, rest) = split_prefix(s)?;
        let (id, version) = split_version(s, rest)?;
        Ok(Self::new(element_type, id, version))
    }
}

impl TryFrom<String> for VersionedElementRef {
    type Error = WaymarkError;

    fn try_from(value: String) -> WaymarkResult<Self> {
        value.parse()
    }
}

impl From<VersionedElementRef> for String {
    fn from(value: VersionedElementRef) -> Self {
        value.to_string()
    }
}

fn split_prefix(s: &str) -> WaymarkResult<(ElementType, &str)> {
    let mut chars = s.chars();
    let element_type = chars
        .next()
        .and_then(ElementType::from_prefix)
        .ok_or_else(|| WaymarkError::invalid_ref(format!("Unknown element type in '{}'", s)))?;
    Ok((element_type, chars.as_str()))
}

fn parse_id(original: &str, s: &str) -> WaymarkResult<i64> {
    let id: i64 = s
        .parse()
        .map_err(|_| WaymarkError::invalid_ref(format!("Invalid element id in '{}'", original)))?;
    if id == 0 {
        return Err(WaymarkError::invalid_ref("Element id cannot be 0"));
    }
    Ok(id)
}

fn split_version(original: &str, s: &str) -> WaymarkResult<(i64, u32)> {
    let idx = s
        .rfind('v')
        .ok_or_else(|| WaymarkError::invalid_ref(format!("Missing version in '{}'", original)))?;
    let id = parse_id(original, &s[..idx])?;
    let version: i64 = s[idx + 1..].parse().map_err(|_| {
        WaymarkError::invalid_ref(format!("Invalid element version in '{}'", original))
    })?;
    if version <= 0 {
        return Err(WaymarkError::invalid_ref("Element version must be positive"));
    }
    let version = u32::try_from(version).map_err(|_| {
        WaymarkError::invalid_ref(format!("Element version out of range in '{}'", original))
    })?;
    Ok((id, version))
}
