use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved external id of the top-of-DAG node in every kind.
pub const SUPREMUM: &str = "*";

/// The three entity kinds. Each kind lives in its own DAG; the graphs are
/// never collapsed into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subject,
    Object,
    Privilege,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Subject, EntityKind::Object, EntityKind::Privilege];

    /// Entity table for this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Subject => "lattice_subjects",
            EntityKind::Object => "lattice_objects",
            EntityKind::Privilege => "lattice_privileges",
        }
    }

    /// Parent -> child edge table for this kind.
    pub fn edge_table(self) -> &'static str {
        match self {
            EntityKind::Subject => "lattice_subject_edges",
            EntityKind::Object => "lattice_object_edges",
            EntityKind::Privilege => "lattice_privilege_edges",
        }
    }

    /// Reachability index table for this kind.
    pub fn closure_table(self) -> &'static str {
        match self {
            EntityKind::Subject => "lattice_subject_closure",
            EntityKind::Object => "lattice_object_closure",
            EntityKind::Privilege => "lattice_privilege_closure",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Subject => write!(f, "subject"),
            EntityKind::Object => write!(f, "object"),
            EntityKind::Privilege => write!(f, "privilege"),
        }
    }
}

/// A persisted entity row. The surrogate `id` is backend-assigned and
/// opaque; `ext_id` is the caller-visible canonical identifier, unique
/// within the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub ext_id: String,
    pub description: String,
    /// True when the row is owned by the declaration reconciler.
    pub is_static: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn is_supremum(&self) -> bool {
        self.ext_id == SUPREMUM
    }
}

/// Sign of an access rule: a positive grant or a negative veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSign {
    Grant,
    Deny,
}

impl RuleSign {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleSign::Grant => "+",
            RuleSign::Deny => "-",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "+" => Some(RuleSign::Grant),
            "-" => Some(RuleSign::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for RuleSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted access rule. At most one sign exists per triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub subject_id: i64,
    pub object_id: i64,
    pub privilege_id: i64,
    pub sign: RuleSign,
    pub is_static: bool,
    pub created_at: DateTime<Utc>,
}

/// A rule joined back to external identifiers, as returned by listings.
/// Orders by `(subject, object, privilege, sign)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleEntry {
    pub subject_ext: String,
    pub object_ext: String,
    pub privilege_ext: String,
    pub sign: RuleSign,
}

impl PartialOrd for RuleSign {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuleSign {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.subject_ext, self.object_ext, self.privilege_ext, self.sign
        )
    }
}

/// Which side of a rule an entity is matched against when listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSide {
    Subject,
    Object,
}

/// Outcome of an authorization query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
}

impl Decision {
    pub fn is_granted(self) -> bool {
        matches!(self, Decision::Granted)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Granted => write!(f, "granted"),
            Decision::Denied => write!(f, "denied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_round_trips_through_wire_form() {
        assert_eq!(RuleSign::from_str("+"), Some(RuleSign::Grant));
        assert_eq!(RuleSign::from_str("-"), Some(RuleSign::Deny));
        assert_eq!(RuleSign::from_str("?"), None);
        assert_eq!(RuleSign::Grant.as_str(), "+");
    }

    #[test]
    fn rule_entries_order_deterministically() {
        let mut entries = vec![
            RuleEntry {
                subject_ext: "bob".into(),
                object_ext: "doc".into(),
                privilege_ext: "read".into(),
                sign: RuleSign::Grant,
            },
            RuleEntry {
                subject_ext: "alice".into(),
                object_ext: "doc".into(),
                privilege_ext: "read".into(),
                sign: RuleSign::Deny,
            },
            RuleEntry {
                subject_ext: "alice".into(),
                object_ext: "doc".into(),
                privilege_ext: "edit".into(),
                sign: RuleSign::Grant,
            },
        ];
        entries.sort();
        assert_eq!(entries[0].subject_ext, "alice");
        assert_eq!(entries[0].privilege_ext, "edit");
        assert_eq!(entries[1].privilege_ext, "read");
        assert_eq!(entries[2].subject_ext, "bob");
    }
}
