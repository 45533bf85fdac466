use std::convert::Infallible;
use std::str::FromStr;

use url::Url;

use crate::message::Request;

/// Which browser origins may open a session.
///
/// Entries are `scheme://host:port`, `scheme://host`, `scheme://host:*` or
/// `*:port`. `*:*` admits everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OriginPolicy {
    #[default]
    Any,
    Allow(Vec<String>),
}

impl FromStr for OriginPolicy {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let entries: Vec<String> = value.split_whitespace().map(str::to_string).collect();
        if entries.is_empty() || entries.iter().any(|entry| entry == "*:*") {
            Ok(OriginPolicy::Any)
        } else {
            Ok(OriginPolicy::Allow(entries))
        }
    }
}

impl OriginPolicy {
    /// Checks the request's `Origin`, falling back to `Referer`.
    pub fn check(&self, request: &Request) -> bool {
        let origin = request.header("origin").or_else(|| request.header("referer"));
        self.permits(origin)
    }

    pub fn permits(&self, origin: Option<&str>) -> bool {
        let OriginPolicy::Allow(allowed) = self else {
            return true;
        };
        let origin = match origin {
            None | Some("null") => return true,
            Some(origin) => origin,
        };
        let Ok(url) = Url::parse(origin) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let scheme = url.scheme();
        let port = url
            .port_or_known_default()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let candidates = [
            format!("{scheme}://{host}:{port}"),
            format!("{scheme}://{host}"),
            format!("{scheme}://{host}:*"),
            format!("*:{port}"),
        ];
        allowed
            .iter()
            .any(|entry| candidates.iter().any(|candidate| candidate == entry))
    }
}
