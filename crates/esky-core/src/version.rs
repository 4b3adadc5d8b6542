use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const KNOWN_QUALIFIERS: [&str; 4] = ["pre", "alpha", "beta", "rc"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Qualifier {
    None,
    /// `1.0_*`: any qualifier.
    Any,
    Named {
        /// Position in `KNOWN_QUALIFIERS`, `None` for unrecognized names.
        order: Option<usize>,
        number: u64,
        name: String,
    },
}

impl Qualifier {
    fn is_present(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn parse(raw: &str) -> Result<Self> {
        if raw == "final" {
            return Ok(Self::None);
        }

        let name = raw.trim_end_matches(|c: char| c.is_ascii_digit());
        let digits = &raw[name.len()..];
        let number = if digits.is_empty() {
            0
        } else {
            digits
                .parse::<u64>()
                .with_context(|| format!("invalid qualifier number in '{raw}'"))?
        };

        Ok(Self::Named {
            order: KNOWN_QUALIFIERS.iter().position(|known| *known == name),
            number,
            name: name.to_string(),
        })
    }
}

/// Dotted version number with optional `_qualifier` and trailing wildcard.
///
/// Trailing zero components are insignificant (`1.0.0 == 1`), qualified
/// versions sort before the bare release (`1.0_rc < 1.0`), and wildcards only
/// take part in matching via [`VersionNumber::matches`], never in ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionNumber {
    parts: Vec<u64>,
    qualifier: Qualifier,
    wildcard: bool,
}

impl VersionNumber {
    pub fn parse(input: &str) -> Result<Self> {
        input.parse()
    }

    /// The blank wildcard `*`, which matches every version.
    pub fn any() -> Self {
        Self {
            parts: Vec::new(),
            qualifier: Qualifier::None,
            wildcard: true,
        }
    }

    /// The empty version, which stands for "nothing installed".
    pub fn blank() -> Self {
        Self {
            parts: Vec::new(),
            qualifier: Qualifier::None,
            wildcard: false,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn is_blank(&self) -> bool {
        self.parts.is_empty()
    }

    /// True when `other` is matched by this version: a wildcard match when
    /// `self` is a wildcard, exact semantic equality otherwise.
    pub fn matches(&self, other: &VersionNumber) -> bool {
        if self.wildcard {
            self.wildcard_match(other)
        } else {
            self == other
        }
    }

    pub fn in_any<'a>(&self, candidates: impl IntoIterator<Item = &'a VersionNumber>) -> bool {
        candidates
            .into_iter()
            .any(|candidate| candidate.matches(self))
    }

    fn wildcard_match(&self, other: &VersionNumber) -> bool {
        if !self.wildcard {
            return false;
        }
        if self.parts.is_empty() {
            return true;
        }
        if other.parts.is_empty() {
            return false;
        }
        if self.qualifier.is_present() != other.qualifier.is_present() {
            return false;
        }

        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match (self.parts.get(idx), other.parts.get(idx)) {
                // 1.* matches 1.2.3, but 1.1_* does not match 1.1.3_alpha.
                (None, _) => return !self.qualifier.is_present(),
                // 1.0.0.* matches 1.0; 1.0.1.* does not.
                (Some(mine), None) if *mine != 0 => return false,
                (Some(_), None) => {}
                (Some(mine), Some(yours)) if mine != yours => return false,
                (Some(_), Some(_)) => {}
            }
        }

        match (&self.qualifier, &other.qualifier) {
            (Qualifier::None, _) | (Qualifier::Any, _) => true,
            (Qualifier::Named { name: mine, .. }, Qualifier::Named { name: yours, .. }) => {
                mine == yours
            }
            _ => false,
        }
    }

    /// Ordering that also covers what `partial_cmp` refuses: unrecognized
    /// qualifiers sort below every known one. Wildcards and blanks sort last.
    pub fn cmp_lenient(&self, other: &VersionNumber) -> Ordering {
        match (self.orderable(), other.orderable()) {
            (false, false) => return Ordering::Equal,
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (true, true) => {}
        }
        self.partial_cmp(other).unwrap_or_else(|| {
            let rank = |version: &VersionNumber| match &version.qualifier {
                Qualifier::Named { order, number, .. } => {
                    (order.map(|order| order as i64).unwrap_or(-1), *number)
                }
                _ => (i64::MAX, 0),
            };
            self.parts
                .cmp(&other.parts)
                .then_with(|| rank(self).cmp(&rank(other)))
        })
    }

    fn orderable(&self) -> bool {
        !self.wildcard && !self.parts.is_empty()
    }
}

impl PartialOrd for VersionNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.orderable() || !other.orderable() {
            return None;
        }

        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match (self.parts.get(idx), other.parts.get(idx)) {
                (None, _) => return Some(Ordering::Less),
                (_, None) => return Some(Ordering::Greater),
                (Some(mine), Some(yours)) if mine != yours => return Some(mine.cmp(yours)),
                _ => {}
            }
        }

        match (&self.qualifier, &other.qualifier) {
            (Qualifier::None, Qualifier::None) => Some(Ordering::Equal),
            (Qualifier::None, _) => Some(Ordering::Greater),
            (_, Qualifier::None) => Some(Ordering::Less),
            (
                Qualifier::Named {
                    order: mine_order,
                    number: mine_number,
                    name: mine_name,
                },
                Qualifier::Named {
                    order: your_order,
                    number: your_number,
                    name: your_name,
                },
            ) => match (mine_order, your_order) {
                (Some(mine_order), Some(your_order)) => Some(
                    mine_order
                        .cmp(your_order)
                        .then_with(|| mine_number.cmp(your_number)),
                ),
                _ if mine_name == your_name => Some(mine_number.cmp(your_number)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromStr for VersionNumber {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let wildcard = input.ends_with('*');
        let stripped = input.trim_end_matches(['.', '*']);
        if stripped.is_empty() {
            return Ok(Self {
                parts: Vec::new(),
                qualifier: Qualifier::None,
                wildcard,
            });
        }

        let (base, qualifier_raw) = match stripped.split_once('_') {
            Some((base, qualifier)) => (base, Some(qualifier)),
            None => (stripped, None),
        };

        let mut parts = base
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| anyhow!("invalid version component '{part}' in '{input}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        if !wildcard {
            while parts.len() > 1 && parts.last() == Some(&0) {
                parts.pop();
            }
        }

        let qualifier = match qualifier_raw {
            None => Qualifier::None,
            Some("") if wildcard => Qualifier::Any,
            Some(raw) => {
                let qualifier = Qualifier::parse(raw)
                    .with_context(|| format!("invalid version number '{input}'"))?;
                if let Qualifier::Named { number, .. } = &qualifier {
                    if wildcard && *number != 0 {
                        bail!("wildcard given on complete version '{input}'");
                    }
                }
                qualifier
            }
        };

        Ok(Self {
            parts,
            qualifier,
            wildcard,
        })
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard && self.parts.is_empty() {
            return f.write_str("*");
        }

        let base = self
            .parts
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&base)?;

        match (&self.qualifier, self.wildcard) {
            (Qualifier::Any, _) => f.write_str("_*"),
            (Qualifier::Named { name, .. }, true) => write!(f, "_{name}*"),
            (Qualifier::None, true) => f.write_str(".*"),
            (Qualifier::Named { name, number, .. }, false) => {
                write!(f, "_{name}")?;
                if *number != 0 {
                    write!(f, "{number}")?;
                }
                Ok(())
            }
            (Qualifier::None, false) => Ok(()),
        }
    }
}

impl Serialize for VersionNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
