//! Dependency closure resolution.
//!
//! Program order is first-discovery breadth-first: lookups are dispatched in
//! waves, one wave per BFS level, and each wave's results are merged in the
//! order they were dispatched. Within a closure, references are visited in
//! ascending local-name order. Completion order of the lookups never leaks
//! into the result.

use std::collections::HashSet;
use std::fmt;

use futures::future::join_all;
use tracing::debug;

use crate::expression::{identifier, Closure};
use crate::host::{DefinitionNotFoundError, Host};
use crate::identity::Identity;
use crate::program::Program;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved reference to `{missing}` from {}", ReferrerLabel(.referrer.as_ref()))]
pub struct UnresolvedReferenceError {
    pub missing: Identity,
    /// `None` when the reference came from the entry closure itself.
    pub referrer: Option<Identity>,
    #[source]
    pub source: DefinitionNotFoundError,
}

struct ReferrerLabel<'a>(Option<&'a Identity>);

impl fmt::Display for ReferrerLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "`{id}`"),
            None => f.write_str("the entry point"),
        }
    }
}

/// Closure whose only reference is `root`, bound under its exported name.
pub fn root_closure(root: &Identity) -> Closure {
    Closure::leaf(identifier(root.name.clone())).with_reference(root.name.clone(), root.clone())
}

/// Resolves `root` and everything it needs. The root definition is the
/// first entry of the returned program.
pub async fn resolve_identity<H: Host>(
    host: &H,
    root: &Identity,
) -> Result<Program, UnresolvedReferenceError> {
    resolve_closure(host, root_closure(root)).await
}

/// Materializes the transitive definitions referenced by `entry`.
///
/// Fails on the first definition the host cannot supply; no partial program
/// is returned.
pub async fn resolve_closure<H: Host>(
    host: &H,
    entry: Closure,
) -> Result<Program, UnresolvedReferenceError> {
    let mut seen: HashSet<Identity> = HashSet::new();
    let mut frontier: Vec<(Identity, Option<Identity>)> = entry
        .referenced_identities()
        .into_iter()
        .map(|id| (id.clone(), None))
        .collect();
    let mut program = Program::new(entry);
    let mut wave_no = 0usize;

    while !frontier.is_empty() {
        // Memoize at dispatch so two referrers of one identity in the same
        // wave collapse to a single lookup.
        let wave: Vec<(Identity, Option<Identity>)> = frontier
            .drain(..)
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();
        debug!(wave = wave_no, lookups = wave.len(), "resolving wave");
        wave_no += 1;

        let results = join_all(wave.iter().map(|(id, _)| host.lookup_definition(id))).await;

        for ((identity, referrer), result) in wave.into_iter().zip(results) {
            let closure = result.map_err(|source| UnresolvedReferenceError {
                missing: identity.clone(),
                referrer: referrer.clone(),
                source,
            })?;
            for next in closure.referenced_identities() {
                if !seen.contains(next) {
                    frontier.push((next.clone(), Some(identity.clone())));
                }
            }
            program.push(identity, closure);
        }
    }

    debug!(definitions = program.len(), "resolved program");
    Ok(program)
}
