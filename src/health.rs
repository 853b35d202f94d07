//! Minimal `tiny_http`-based `/health` listener (SPEC_FULL.md §4.H).
//!
//! Grounded on the teacher crate's `preview::standalone` server: a
//! `tiny_http::Server` driven from a background thread, no routing beyond
//! the one path, no framework. The consumer orchestrator runs on the tokio
//! runtime; this listener intentionally runs on its own OS thread so a
//! wedged async task doesn't also take down the health check.

use std::io;
use std::thread;

use tiny_http::{Method, Response, Server, StatusCode};

/// Bind `port` on all interfaces and answer `GET /health` with `200 OK`
/// until the process exits. Any other path or method gets `404`.
pub fn serve(port: u16) -> io::Result<()> {
    let server = Server::http(("0.0.0.0", port)).map_err(io::Error::other)?;
    run(server)
}

/// Spawn [`serve`] on a background thread. Fire-and-forget: the listener
/// runs for the lifetime of the process, matching the teacher's
/// `PreviewServer::spawn` pattern.
pub fn spawn(port: u16) {
    thread::spawn(move || match Server::http(("0.0.0.0", port)) {
        Ok(server) => {
            if let Err(e) = run(server) {
                tracing::error!(error = %e, "health listener exited");
            }
        }
        Err(e) => tracing::error!(port, error = %e, "failed to bind health listener"),
    });
}

fn run(server: Server) -> io::Result<()> {
    loop {
        let request = match server.recv() {
            Ok(req) => req,
            Err(e) => return Err(e),
        };

        let response = match (request.method(), request.url()) {
            (Method::Get, "/health") => Response::from_string("ok").with_status_code(StatusCode(200)),
            _ => Response::from_string("not found").with_status_code(StatusCode(404)),
        };

        let _ = request.respond(response);
    }
}
