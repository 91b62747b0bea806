use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Which operations of an endpoint group a proof mechanism applies to.
///
/// On the wire this is `false`, `true`, or a list of operation names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapabilityPolicy {
    #[default]
    Never,
    Always,
    ForOperations(BTreeSet<String>),
}

impl CapabilityPolicy {
    pub fn for_operations<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ForOperations(operations.into_iter().map(Into::into).collect())
    }

    /// Shared by bearer, signature, challenge and OTP evaluation.
    pub fn matches(&self, operation: &str) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::ForOperations(operations) => operations.contains(operation),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PolicyRepr {
    Flag(bool),
    Operations(Vec<String>),
}

impl Serialize for CapabilityPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::Never => PolicyRepr::Flag(false),
            Self::Always => PolicyRepr::Flag(true),
            Self::ForOperations(operations) => {
                PolicyRepr::Operations(operations.iter().cloned().collect())
            }
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CapabilityPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // null is accepted as "never" so partially filled descriptors still load
        let policy = match Option::<PolicyRepr>::deserialize(deserializer)? {
            None | Some(PolicyRepr::Flag(false)) => Self::Never,
            Some(PolicyRepr::Flag(true)) => Self::Always,
            Some(PolicyRepr::Operations(operations)) => Self::for_operations(operations),
        };
        Ok(policy)
    }
}
