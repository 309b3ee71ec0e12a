//! Task identity.

use std::fmt;

/// Identity of a schedulable task.
///
/// Equality is defined by the key alone: two tasks with equal keys are the
/// same task for scheduling purposes, even if their work bodies differ.
///
/// A composite key carries a *major* component (the group identity) and an
/// ordered sequence of *minor* components that disambiguate siblings within
/// the group. A composite key with an empty minor sequence is still a
/// different identity than the simple key with the same major value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey<K> {
    Simple(K),
    Composite { major: K, minors: Vec<K> },
}

impl<K> TaskKey<K> {
    pub fn simple(key: K) -> Self {
        TaskKey::Simple(key)
    }

    pub fn composite(major: K, minors: impl IntoIterator<Item = K>) -> Self {
        TaskKey::Composite {
            major,
            minors: minors.into_iter().collect(),
        }
    }

    /// The major component: the key itself for a simple key, the group
    /// identity for a composite key.
    pub fn major(&self) -> &K {
        match self {
            TaskKey::Simple(key) => key,
            TaskKey::Composite { major, .. } => major,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TaskKey::Composite { .. })
    }
}

impl<K: Clone> TaskKey<K> {
    /// The simple key an aggregate for this identity's major component is
    /// tracked under. For a simple key this is the key itself.
    pub fn aggregate_key(&self) -> TaskKey<K> {
        TaskKey::Simple(self.major().clone())
    }
}

impl<K: fmt::Display> fmt::Display for TaskKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Simple(key) => write!(f, "{key}"),
            TaskKey::Composite { major, minors } => {
                write!(f, "{major}")?;
                for minor in minors {
                    write!(f, "/{minor}")?;
                }
                Ok(())
            }
        }
    }
}
