//! Regroup rules and their dense per-group tables

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::lookup::check_groups;
use crate::error::{Error, Result};
use crate::types::{Field, GroupId, Term, TermRef, NO_GROUP};

// ============================================================================
// RegroupCondition
// ============================================================================

/// A field/term test evaluated against the term currently being scanned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegroupCondition {
    /// Field the condition reads
    pub field: Field,
    /// Term compared against
    pub term: Term,
    /// Match every term `<=` this one instead of only equal terms
    pub inequality: bool,
}

impl RegroupCondition {
    /// `field == term` on an integer field
    pub fn int_eq(field: &str, term: i64) -> Self {
        Self {
            field: Field::int(field),
            term: Term::Int(term),
            inequality: false,
        }
    }

    /// `field <= term` on an integer field
    pub fn int_le(field: &str, term: i64) -> Self {
        Self {
            inequality: true,
            ..Self::int_eq(field, term)
        }
    }

    /// `field == term` on a string field
    pub fn string_eq(field: &str, term: &str) -> Self {
        Self {
            field: Field::string(field),
            term: Term::from(term),
            inequality: false,
        }
    }

    /// `field <= term` (byte order) on a string field
    pub fn string_le(field: &str, term: &str) -> Self {
        Self {
            inequality: true,
            ..Self::string_eq(field, term)
        }
    }

    /// Whether a document holding `term` in `field` satisfies the condition
    pub fn fires(&self, field: &Field, term: TermRef<'_>) -> bool {
        if self.field != *field {
            return false;
        }
        match (self.term.as_ref(), term) {
            (TermRef::Int(cond), TermRef::Int(t)) => {
                if self.inequality {
                    t <= cond
                } else {
                    t == cond
                }
            }
            (TermRef::Bytes(cond), TermRef::Bytes(t)) => {
                if self.inequality {
                    t <= cond
                } else {
                    t == cond
                }
            }
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.term.field_type() != self.field.field_type {
            return Err(Error::InvalidArgument(format!(
                "condition on {} compares against a {} term",
                self.field,
                self.term.field_type()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Remap rules
// ============================================================================

/// Single-condition rule for documents currently in `target_group`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRemapRule {
    /// Group the rule applies to
    pub target_group: GroupId,
    /// Condition tested against scanned terms
    pub condition: RegroupCondition,
    /// Destination when the condition never fires for the document
    pub negative_group: GroupId,
    /// Destination when the condition fires
    pub positive_group: GroupId,
}

impl GroupRemapRule {
    /// Create a rule
    pub fn new(
        target_group: GroupId,
        condition: RegroupCondition,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Self {
        Self {
            target_group,
            condition,
            negative_group,
            positive_group,
        }
    }
}

/// Rule mapping one source group to many destinations by condition list
///
/// The lowest-index condition that fires for a document picks its
/// destination; documents matching none go to `negative_group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMultiRemapRule {
    /// Group the rule applies to
    pub target_group: GroupId,
    /// Destination when no condition fires
    pub negative_group: GroupId,
    /// Conditions in priority order
    pub conditions: Vec<RegroupCondition>,
    /// Destination per condition
    pub positive_groups: Vec<GroupId>,
}

impl GroupMultiRemapRule {
    /// Create a rule; `conditions` and `positive_groups` pair up by index
    pub fn new(
        target_group: GroupId,
        negative_group: GroupId,
        conditions: Vec<RegroupCondition>,
        positive_groups: Vec<GroupId>,
    ) -> Result<Self> {
        if conditions.len() != positive_groups.len() {
            return Err(Error::InvalidArgument(format!(
                "{} conditions but {} positive groups",
                conditions.len(),
                positive_groups.len()
            )));
        }
        Ok(Self {
            target_group,
            negative_group,
            conditions,
            positive_groups,
        })
    }
}

/// Common view used to index rules by their source group
pub trait TargetedRule {
    /// Source group the rule applies to
    fn target_group(&self) -> GroupId;

    /// Conditions the rule evaluates
    fn conditions(&self) -> &[RegroupCondition];

    /// Every group the rule can move a document to
    fn destination_groups(&self) -> Vec<GroupId>;
}

impl TargetedRule for GroupRemapRule {
    fn target_group(&self) -> GroupId {
        self.target_group
    }

    fn conditions(&self) -> &[RegroupCondition] {
        std::slice::from_ref(&self.condition)
    }

    fn destination_groups(&self) -> Vec<GroupId> {
        vec![self.negative_group, self.positive_group]
    }
}

impl TargetedRule for GroupMultiRemapRule {
    fn target_group(&self) -> GroupId {
        self.target_group
    }

    fn conditions(&self) -> &[RegroupCondition] {
        &self.conditions
    }

    fn destination_groups(&self) -> Vec<GroupId> {
        let mut groups = self.positive_groups.clone();
        groups.push(self.negative_group);
        groups
    }
}

// ============================================================================
// RuleTable
// ============================================================================

/// Rules indexed densely by source group
///
/// At most one rule per group. When several rules target the same group the
/// first one supplied is kept. Rules targeting group 0 or a group at or
/// beyond `num_groups` can never match a document and are dropped.
#[derive(Debug, Clone)]
pub struct RuleTable<R> {
    rules: Vec<Option<R>>,
    fields: Vec<Field>,
}

impl<R: TargetedRule + Clone> RuleTable<R> {
    /// Index `rules` for a lookup currently spanning `num_groups` groups
    pub fn build(rules: &[R], num_groups: u32) -> Result<Self> {
        let mut table: Vec<Option<R>> = vec![None; num_groups as usize];
        let mut fields: Vec<Field> = Vec::new();

        for rule in rules {
            for condition in rule.conditions() {
                condition.validate()?;
            }
            check_groups(rule.destination_groups())?;

            let target = rule.target_group();
            if target == NO_GROUP || target >= num_groups {
                debug!(target_group = target, num_groups, "Dropping unreachable regroup rule");
                continue;
            }
            let slot = &mut table[target as usize];
            if slot.is_some() {
                debug!(target_group = target, "Duplicate regroup rule, keeping the first");
                continue;
            }
            for condition in rule.conditions() {
                if !fields.contains(&condition.field) {
                    fields.push(condition.field.clone());
                }
            }
            *slot = Some(rule.clone());
        }

        Ok(Self {
            rules: table,
            fields,
        })
    }

    /// Rule for documents in `group`
    #[inline]
    pub fn get(&self, group: GroupId) -> Option<&R> {
        self.rules.get(group as usize).and_then(Option::as_ref)
    }

    /// Distinct fields referenced by kept rules, in first-seen order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of groups that have a rule
    pub fn len(&self) -> usize {
        self.rules.iter().filter(|r| r.is_some()).count()
    }

    /// Whether no group has a rule
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
