use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::expression::Closure;
use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub identity: Identity,
    pub closure: Closure,
}

/// A root closure plus every definition it transitively needs.
///
/// `definitions` is kept in first-discovery order (see `resolve`); each
/// identity appears once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub entry: Closure,
    pub definitions: Vec<ProgramEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    #[error("definition `{0}` appears more than once")]
    Duplicate(Identity),
    #[error("`{referrer}` references `{missing}`, which is not part of the program")]
    Incomplete { referrer: String, missing: Identity },
    #[error("`{owner}` uses `{name}` without a reference for it")]
    Unbound { owner: String, name: String },
}

impl Program {
    pub fn new(entry: Closure) -> Self {
        Self {
            entry,
            definitions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, identity: &Identity) -> Option<&Closure> {
        self.definitions
            .iter()
            .find(|e| &e.identity == identity)
            .map(|e| &e.closure)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.definitions.iter().map(|e| &e.identity)
    }

    pub(crate) fn push(&mut self, identity: Identity, closure: Closure) {
        self.definitions.push(ProgramEntry { identity, closure });
    }

    /// Checks the structural guarantees a loader relies on: no duplicate
    /// identity, every reference present, every free name bound.
    pub fn validate(&self) -> Result<(), ProgramError> {
        let mut seen = BTreeSet::new();
        for entry in &self.definitions {
            if !seen.insert(&entry.identity) {
                return Err(ProgramError::Duplicate(entry.identity.clone()));
            }
        }

        let owners = std::iter::once(("<entry>".to_string(), &self.entry)).chain(
            self.definitions
                .iter()
                .map(|e| (e.identity.to_string(), &e.closure)),
        );
        for (owner, closure) in owners {
            for missing in closure.referenced_identities() {
                if !seen.contains(missing) {
                    return Err(ProgramError::Incomplete {
                        referrer: owner,
                        missing: missing.clone(),
                    });
                }
            }
            if let Some(name) = closure.unbound_identifiers().into_iter().next() {
                return Err(ProgramError::Unbound { owner, name });
            }
        }
        Ok(())
    }
}
