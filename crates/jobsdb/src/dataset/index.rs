//! Composite dataset sequence identifiers.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use strata_core::DomainError;

/// Sequence identifier of a dataset, e.g. `1`, `2` or `1_1`.
///
/// Components compare numerically from left to right, and a shorter index
/// sorts before any index it prefixes: `1 < 1_1 < 1_2 < 2 < 10`. Nested
/// indices let a dataset be inserted between two existing ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetIndex(Vec<u64>);

impl DatasetIndex {
    pub fn first() -> Self {
        Self(vec![1])
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// The next top-level index, used when rotating: `1_2` -> `2`.
    pub fn next_top(&self) -> Self {
        Self(vec![self.0[0] + 1])
    }

    fn child(&self, component: u64) -> Self {
        let mut components = self.0.clone();
        components.push(component);
        Self(components)
    }

    fn next_sibling(&self) -> Self {
        let mut components = self.0.clone();
        if let Some(last) = components.last_mut() {
            *last += 1;
        }
        Self(components)
    }

    /// An unused index strictly between `self` and `next` (the index that
    /// follows `self` in the catalog, if any).
    ///
    /// A top-level `n` yields `n_1`; a nested `n_k` yields `n_{k+1}`, falling
    /// back to `n_k_1` when that is taken.
    pub fn between(&self, next: Option<&DatasetIndex>) -> Option<DatasetIndex> {
        let fits = |candidate: &DatasetIndex| next.is_none_or(|next| candidate < next);

        let preferred = if self.0.len() > 1 {
            self.next_sibling()
        } else {
            self.child(1)
        };
        if fits(&preferred) {
            return Some(preferred);
        }
        let nested = self.child(1);
        fits(&nested).then_some(nested)
    }
}

impl fmt::Display for DatasetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("_")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for DatasetIndex {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split('_')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(DomainError::validation(format!(
                        "invalid dataset index '{s}'"
                    )));
                }
                part.parse::<u64>()
                    .map_err(|e| DomainError::validation(format!("invalid dataset index '{s}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if components[0] == 0 {
            return Err(DomainError::validation(format!(
                "dataset index '{s}' must start at 1"
            )));
        }
        Ok(Self(components))
    }
}

impl TryFrom<String> for DatasetIndex {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetIndex> for String {
    fn from(value: DatasetIndex) -> Self {
        value.to_string()
    }
}
