use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;

use crate::expression::Closure;
use crate::host::{DefinitionNotFoundError, Host, NotFoundReason, StdStreams};
use crate::identity::Identity;
use crate::value::StreamHandle;

/// Streams that capture writes and replay seeded input.
#[derive(Debug, Default)]
pub struct SimulatedStreams {
    stdin: RefCell<String>,
    stdout: RefCell<Vec<u8>>,
    stderr: RefCell<Vec<u8>>,
}

impl SimulatedStreams {
    pub fn with_stdin(input: impl Into<String>) -> Self {
        Self {
            stdin: RefCell::new(input.into()),
            ..Self::default()
        }
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.borrow()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.borrow()).into_owned()
    }
}

impl StdStreams for SimulatedStreams {
    fn read_to_string(&self, stream: StreamHandle) -> io::Result<String> {
        match stream {
            StreamHandle::Stdin => Ok(std::mem::take(&mut *self.stdin.borrow_mut())),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot read from {}", other.as_str()),
            )),
        }
    }

    fn write_all(&self, stream: StreamHandle, bytes: &[u8]) -> io::Result<()> {
        match stream {
            StreamHandle::Stdout => self.stdout.borrow_mut().extend_from_slice(bytes),
            StreamHandle::Stderr => self.stderr.borrow_mut().extend_from_slice(bytes),
            StreamHandle::Stdin => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot write to stdin",
                ))
            }
        }
        Ok(())
    }
}

/// Test-scoped host backed by an explicit registry.
///
/// Definitions are added through the setup methods before a run; lookups and
/// execution only read them. Build a fresh host per run.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    definitions: BTreeMap<Identity, Closure>,
    streams: SimulatedStreams,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(input: impl Into<String>) -> Self {
        Self {
            definitions: BTreeMap::new(),
            streams: SimulatedStreams::with_stdin(input),
        }
    }

    /// Adds or replaces one definition.
    pub fn define(&mut self, identity: Identity, closure: Closure) -> &mut Self {
        self.definitions.insert(identity, closure);
        self
    }

    pub fn with_definition(mut self, identity: Identity, closure: Closure) -> Self {
        self.define(identity, closure);
        self
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn stdout(&self) -> String {
        self.streams.stdout()
    }

    pub fn stderr(&self) -> String {
        self.streams.stderr()
    }
}

impl Host for InMemoryHost {
    async fn lookup_definition(
        &self,
        identity: &Identity,
    ) -> Result<Closure, DefinitionNotFoundError> {
        if let Some(closure) = self.definitions.get(identity) {
            return Ok(closure.clone());
        }
        let available: Vec<String> = self
            .definitions
            .keys()
            .filter(|id| id.location == identity.location)
            .map(|id| id.name.clone())
            .collect();
        let reason = if available.is_empty() {
            NotFoundReason::UnknownLocation
        } else {
            NotFoundReason::MissingExport { available }
        };
        Err(DefinitionNotFoundError::new(identity, reason))
    }

    fn streams(&self) -> &dyn StdStreams {
        &self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::string_literal;
    use futures::executor::block_on;

    #[test]
    fn lookup_returns_registered_closure() {
        let id = Identity::new("/a", "default");
        let host = InMemoryHost::new().with_definition(id.clone(), Closure::leaf(string_literal("x")));
        let closure = block_on(host.lookup_definition(&id)).unwrap();
        assert_eq!(closure.expression, string_literal("x"));
    }

    #[test]
    fn lookup_of_unknown_identity_fails() {
        let host = InMemoryHost::new()
            .with_definition(Identity::new("/a", "one"), Closure::leaf(string_literal("1")));

        let err = block_on(host.lookup_definition(&Identity::new("/a", "two"))).unwrap_err();
        assert_eq!(
            err.reason,
            NotFoundReason::MissingExport {
                available: vec!["one".to_string()]
            }
        );

        let err = block_on(host.lookup_definition(&Identity::new("/z", "two"))).unwrap_err();
        assert_eq!(err.reason, NotFoundReason::UnknownLocation);
    }

    #[test]
    fn streams_capture_output_and_drain_input() {
        let host = InMemoryHost::with_stdin("seeded");
        let streams = host.streams();
        assert_eq!(streams.read_to_string(StreamHandle::Stdin).unwrap(), "seeded");
        assert_eq!(streams.read_to_string(StreamHandle::Stdin).unwrap(), "");
        streams.write_all(StreamHandle::Stdout, b"out").unwrap();
        streams.write_all(StreamHandle::Stderr, b"err").unwrap();
        assert!(streams.write_all(StreamHandle::Stdin, b"x").is_err());
        assert_eq!(host.stdout(), "out");
        assert_eq!(host.stderr(), "err");
    }
}
