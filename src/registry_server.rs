//! Read-only HTTP registry serving a directory of definition modules, so
//! `http://` identities resolve through [`crate::fs_host::FsHost`].

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

pub fn run_server(bind_addr: &str, root: &Path) -> Result<()> {
    let server = Server::http(bind_addr)
        .map_err(|err| anyhow!("failed to bind registry server at {bind_addr}: {err}"))?;
    info!(addr = bind_addr, root = %root.display(), "serving definition modules");
    for request in server.incoming_requests() {
        if let Err(err) = handle(request, root) {
            warn!(error = %err, "failed to answer registry request");
        }
    }
    Ok(())
}

fn handle(request: Request, root: &Path) -> Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!(method = %method, url = %url, "registry request");

    if method != Method::Get {
        request.respond(Response::from_string("method not allowed").with_status_code(405))?;
        return Ok(());
    }
    if url == "/health" {
        request.respond(with_content_type(
            Response::from_string(r#"{"ok":true}"#),
            "application/json",
        ))?;
        return Ok(());
    }

    let Some(path) = module_path(root, &url) else {
        request.respond(Response::from_string("invalid module path").with_status_code(400))?;
        return Ok(());
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            let content_type = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => "application/yaml",
                _ => "application/json",
            };
            request.respond(with_content_type(Response::from_data(bytes), content_type))?;
        }
        Err(_) => {
            request.respond(Response::empty(404))?;
        }
    }
    Ok(())
}

/// Maps a request path onto a file under `root`, rejecting anything that
/// could escape it.
fn module_path(root: &Path, url: &str) -> Option<PathBuf> {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return None;
    }
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn with_content_type<R: std::io::Read>(response: Response<R>, value: &str) -> Response<R> {
    match Header::from_bytes("Content-Type", value) {
        Ok(header) => response.with_header(header),
        Err(_) => response,
    }
}
