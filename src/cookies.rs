use std::collections::{BTreeMap, HashMap};

use log::debug;
use parking_lot::Mutex;

/// Cookies received from the server, replayed on every later request to the same host.
///
/// Only name and value are kept. A cookie with `Max-Age=0` removes a stored one.
#[derive(Debug, Default)]
pub struct CookieJar {
    hosts: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one `Set-Cookie` header value received from `host`.
    pub fn save(&self, host: &str, set_cookie: &str) {
        let mut attributes = set_cookie.split(';').map(str::trim);

        let (name, value) = match attributes.next().and_then(|pair| pair.split_once('=')) {
            Some((name, value)) if !name.trim().is_empty() => (name.trim(), value.trim()),
            _ => {
                debug!("Ignoring malformed cookie from {}: {:?}", host, set_cookie);
                return;
            }
        };

        let expired = attributes.any(|attr| {
            attr.split_once('=')
                .map(|(k, v)| k.trim().eq_ignore_ascii_case("max-age") && v.trim() == "0")
                .unwrap_or(false)
        });

        let mut hosts = self.hosts.lock();
        let cookies = hosts.entry(host.to_ascii_lowercase()).or_default();

        if expired {
            cookies.remove(name);
        } else {
            cookies.insert(name.to_string(), value.to_string());
        }
    }

    /// Value for the `Cookie` header of a request to `host`, if any cookie is stored.
    pub fn header(&self, host: &str) -> Option<String> {
        let hosts = self.hosts.lock();
        let cookies = hosts.get(&host.to_ascii_lowercase())?;

        if cookies.is_empty() {
            return None;
        }

        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_replay() {
        let jar = CookieJar::new();
        jar.save(
            "push.example.com",
            "AWSALB=abc123; Path=/; Expires=Thu, 01 Jan 2099 00:00:00 GMT",
        );
        jar.save("push.example.com", "lb=node2; HttpOnly");

        assert_eq!(
            jar.header("PUSH.example.com").as_deref(),
            Some("AWSALB=abc123; lb=node2")
        );
        assert_eq!(jar.header("other.example.com"), None);
    }

    #[test]
    fn test_replace_and_expire() {
        let jar = CookieJar::new();
        jar.save("h", "lb=node1");
        jar.save("h", "lb=node3");
        assert_eq!(jar.header("h").as_deref(), Some("lb=node3"));

        jar.save("h", "lb=; Max-Age=0");
        assert_eq!(jar.header("h"), None);
    }

    #[test]
    fn test_malformed_is_ignored() {
        let jar = CookieJar::new();
        jar.save("h", "novalue");
        jar.save("h", "=x");

        assert_eq!(jar.header("h"), None);
    }
}
