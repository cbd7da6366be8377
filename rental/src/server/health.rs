//! Liveness endpoint shared by the three services.

use axum::Json;
use serde::Serialize;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct Health {
    /// Always `"ok"` while the process serves requests
    pub status: &'static str,
    /// Which service answered
    pub service: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// Liveness only; the database and the broker are not probed.
///
/// ```bash
/// curl http://localhost:8080/health
/// # {"status":"ok","service":"payment","version":"0.1.0"}
/// ```
pub fn health(service: &'static str) -> Json<Health> {
    Json(Health {
        status: "ok",
        service,
        version: env!("CARGO_PKG_VERSION"),
    })
}
