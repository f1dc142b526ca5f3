//! Upstream base URLs and paths.

/// Production host; authoritative for project discovery.
pub const PROD_BASE: &str = "https://cloudcode-pa.googleapis.com";
/// Daily sandbox; preferred for generation traffic.
pub const DAILY_BASE: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
/// Autopush sandbox.
pub const AUTOPUSH_BASE: &str = "https://autopush-cloudcode-pa.sandbox.googleapis.com";

/// Discovery candidates, authoritative first.
pub fn discovery_bases() -> [&'static str; 3] {
    [PROD_BASE, DAILY_BASE, AUTOPUSH_BASE]
}

/// Generation candidates, sandbox first.
pub fn generation_bases() -> [&'static str; 3] {
    [DAILY_BASE, AUTOPUSH_BASE, PROD_BASE]
}

pub fn internal_path(action: &str) -> String {
    format!("/v1internal:{action}")
}
