use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use once_cell::unsync::OnceCell;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;

use crate::expression::Closure;
use crate::host::{DefinitionModule, DefinitionNotFoundError, Host, NotFoundReason, StdStreams};
use crate::identity::Identity;
use crate::value::StreamHandle;

/// The operating system's standard streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessStreams;

impl StdStreams for ProcessStreams {
    fn read_to_string(&self, stream: StreamHandle) -> io::Result<String> {
        match stream {
            StreamHandle::Stdin => {
                let mut buf = String::new();
                io::stdin().lock().read_to_string(&mut buf)?;
                Ok(buf)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot read from {}", other.as_str()),
            )),
        }
    }

    fn write_all(&self, stream: StreamHandle, bytes: &[u8]) -> io::Result<()> {
        match stream {
            StreamHandle::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            StreamHandle::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(bytes)?;
                err.flush()
            }
            StreamHandle::Stdin => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to stdin",
            )),
        }
    }
}

/// Process-scoped host reading definition modules from disk or HTTP.
///
/// Each location is read at most once per host; the store is never written.
pub struct FsHost {
    base_dir: PathBuf,
    http_timeout: Duration,
    http: OnceCell<Client>,
    modules: RefCell<BTreeMap<String, Rc<DefinitionModule>>>,
    streams: ProcessStreams,
}

impl FsHost {
    /// `base_dir` anchors locations that are neither absolute nor URIs.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            http_timeout: Duration::from_secs(30),
            http: OnceCell::new(),
            modules: RefCell::new(BTreeMap::new()),
            streams: ProcessStreams,
        }
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    fn module(&self, identity: &Identity) -> Result<Rc<DefinitionModule>, DefinitionNotFoundError> {
        let location = identity.location.as_str();
        if let Some(module) = self.modules.borrow().get(location) {
            return Ok(Rc::clone(module));
        }

        let text = self.read_location(identity)?;
        let mut module = DefinitionModule::parse(location, &text)
            .map_err(|msg| DefinitionNotFoundError::new(identity, NotFoundReason::Malformed(msg)))?;
        module.anchor_relative_references(location);
        debug!(location, exports = module.exports.len(), "loaded definition module");

        let module = Rc::new(module);
        self.modules
            .borrow_mut()
            .insert(location.to_string(), Rc::clone(&module));
        Ok(module)
    }

    fn read_location(&self, identity: &Identity) -> Result<String, DefinitionNotFoundError> {
        let location = identity.location.as_str();
        if location.starts_with("http://") || location.starts_with("https://") {
            return self.fetch(identity);
        }

        let path = self.local_path(location);
        std::fs::read_to_string(&path).map_err(|err| {
            let reason = if err.kind() == io::ErrorKind::NotFound {
                NotFoundReason::UnknownLocation
            } else {
                NotFoundReason::Unreadable(format!("{}: {err}", path.display()))
            };
            DefinitionNotFoundError::new(identity, reason)
        })
    }

    fn local_path(&self, location: &str) -> PathBuf {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn fetch(&self, identity: &Identity) -> Result<String, DefinitionNotFoundError> {
        let unreadable =
            |msg: String| DefinitionNotFoundError::new(identity, NotFoundReason::Unreadable(msg));

        let client = self
            .http
            .get_or_try_init(|| Client::builder().timeout(self.http_timeout).build())
            .map_err(|err| unreadable(format!("failed to build HTTP client: {err}")))?;

        let response = client
            .get(&identity.location)
            .send()
            .map_err(|err| unreadable(err.to_string()))?;
        match response.status() {
            StatusCode::OK => response.text().map_err(|err| unreadable(err.to_string())),
            StatusCode::NOT_FOUND => Err(DefinitionNotFoundError::new(
                identity,
                NotFoundReason::UnknownLocation,
            )),
            other => Err(unreadable(format!("HTTP status {other}"))),
        }
    }
}

impl Host for FsHost {
    async fn lookup_definition(
        &self,
        identity: &Identity,
    ) -> Result<Closure, DefinitionNotFoundError> {
        let module = self.module(identity)?;
        module.exports.get(&identity.name).cloned().ok_or_else(|| {
            DefinitionNotFoundError::new(
                identity,
                NotFoundReason::MissingExport {
                    available: module.exports.keys().cloned().collect(),
                },
            )
        })
    }

    fn streams(&self) -> &dyn StdStreams {
        &self.streams
    }
}
