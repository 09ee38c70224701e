//! Public hostname of an endpoint

use std::sync::OnceLock;

use regex::Regex;

fn endpoint_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<scheme>[a-z][a-z0-9+.-]*)://(?:[^@/]*@)?(?P<host>\[[^\]]+\]|[^:/]+)")
            .expect("endpoint URL pattern is valid")
    })
}

/// Hostname players should connect to for containers on `url`.
///
/// Local sockets have no public name of their own, so they (and anything
/// unparsable) fall back to `default`.
pub fn display_hostname(url: &str, default: &str) -> String {
    let Some(caps) = endpoint_url().captures(url) else {
        return default.to_string();
    };

    match &caps["scheme"] {
        "unix" | "npipe" => default.to_string(),
        _ => caps["host"].to_string(),
    }
}
