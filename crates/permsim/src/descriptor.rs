//! Permission descriptors and descriptor matching
//!
//! A [`Descriptor`] names a permission and may carry discriminating fields
//! (for example `midi` with `sysex: true`). Descriptors are compared
//! structurally through a [`DescriptorMatcher`], never by identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a permission: a name plus optional discriminating fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Permission name, e.g. `geolocation`
    pub name: String,
    /// Additional fields, compared only where the matcher cares about them
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Descriptor {
    /// Create a descriptor with no extra fields
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add a boolean field
    pub fn with_flag(self, key: impl Into<String>, value: bool) -> Self {
        self.with_field(key, Value::Bool(value))
    }

    /// Get the permission name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a field value
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a boolean field, `None` when absent or not a boolean
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Render as compact JSON, used in error messages
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"name\":{:?}}}", self.name))
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Descriptor {
    fn from(name: &str) -> Self {
        Descriptor::new(name)
    }
}

/// Equivalence over descriptors
pub trait DescriptorMatcher: Send + Sync {
    /// Check whether `a` and `b` denote the same logical permission
    fn matches(&self, a: &Descriptor, b: &Descriptor) -> bool;
}

impl<F> DescriptorMatcher for F
where
    F: Fn(&Descriptor, &Descriptor) -> bool + Send + Sync,
{
    fn matches(&self, a: &Descriptor, b: &Descriptor) -> bool {
        self(a, b)
    }
}

/// A boolean field that splits one permission name into distinct permissions
#[derive(Debug, Clone, PartialEq, Eq)]
struct Discriminator {
    name: String,
    field: String,
    default: bool,
}

/// Matcher comparing names and known boolean sub-flags
///
/// Absent flags take their default, so `{name: "midi"}` and
/// `{name: "midi", sysex: false}` match. Fields the matcher does not know
/// about are ignored.
#[derive(Debug, Clone)]
pub struct DefaultMatcher {
    discriminators: Vec<Discriminator>,
}

impl DefaultMatcher {
    /// Create a matcher with the standard discriminating flags
    pub fn new() -> Self {
        Self {
            discriminators: Vec::new(),
        }
        .with_discriminator("midi", "sysex", false)
        .with_discriminator("push", "userVisibleOnly", false)
        .with_discriminator("camera", "panTiltZoom", false)
    }

    /// Create a matcher that only compares names
    pub fn names_only() -> Self {
        Self {
            discriminators: Vec::new(),
        }
    }

    /// Register a boolean flag that distinguishes permissions named `name`
    pub fn with_discriminator(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        default: bool,
    ) -> Self {
        self.discriminators.push(Discriminator {
            name: name.into(),
            field: field.into(),
            default,
        });
        self
    }
}

impl Default for DefaultMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorMatcher for DefaultMatcher {
    fn matches(&self, a: &Descriptor, b: &Descriptor) -> bool {
        if a.name != b.name {
            return false;
        }

        self.discriminators
            .iter()
            .filter(|d| d.name == a.name)
            .all(|d| {
                a.flag(&d.field).unwrap_or(d.default) == b.flag(&d.field).unwrap_or(d.default)
            })
    }
}

/// A matcher bound to one descriptor
///
/// Handed to store subscribers so they can test other descriptors against
/// the changed one without re-deriving the comparison.
#[derive(Clone)]
pub struct MatchPredicate {
    matcher: Arc<dyn DescriptorMatcher>,
    descriptor: Descriptor,
}

impl MatchPredicate {
    pub(crate) fn new(matcher: Arc<dyn DescriptorMatcher>, descriptor: Descriptor) -> Self {
        Self {
            matcher,
            descriptor,
        }
    }

    /// Check whether `other` matches the bound descriptor
    pub fn matches(&self, other: &Descriptor) -> bool {
        self.matcher.matches(&self.descriptor, other)
    }

    /// The bound descriptor
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

impl fmt::Debug for MatchPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchPredicate")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
