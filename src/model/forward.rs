//! Port forward definitions and their string grammar.
//!
//! Forwards are written in the manifest as `"<local>:<remote>"`,
//! `"<local>:<service>"` or `"<local>:<service>:<port>"`. A service name
//! is a DNS label containing at least one non-digit, so the two- and
//! three-part forms are unambiguous.

use serde::{Deserialize, Serialize};

/// A local to remote port forwarding definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Forward {
    /// Local port to bind on 127.0.0.1.
    pub local: u16,
    /// Remote port in the pod (or in the service when `service_name` is
    /// set; 0 means "same as local").
    pub remote: u16,
    /// Target service name for service forwards.
    pub service_name: Option<String>,
}

/// A reverse forward: the remote port opens in the pod and tunnels back
/// to a local port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteForward {
    /// Port opened in the pod.
    pub remote: u16,
    /// Local port the tunnel lands on.
    pub local: u16,
}

impl Forward {
    /// Creates a pod forward.
    #[must_use]
    pub const fn new(local: u16, remote: u16) -> Self {
        Self {
            local,
            remote,
            service_name: None,
        }
    }

    /// Returns true if this forward targets a service instead of the dev
    /// pod.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        self.service_name.is_some()
    }

    /// Parses a forward from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string does not match the forward grammar.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(':').collect();

        let err = || format!("Invalid forward '{s}'. Expected LOCAL:REMOTE, LOCAL:SERVICE or LOCAL:SERVICE:PORT");

        if parts.len() < 2 || parts.len() > 3 {
            return Err(err());
        }

        let local = parts[0].parse::<u16>().map_err(|_| err())?;

        if parts.len() == 2 {
            if let Ok(remote) = parts[1].parse::<u16>() {
                return Ok(Self::new(local, remote));
            }
            if is_service_name(parts[1]) {
                return Ok(Self {
                    local,
                    remote: 0,
                    service_name: Some(parts[1].to_string()),
                });
            }
            return Err(err());
        }

        // Three parts: the middle segment must be a service name, never a
        // port ("8080:8081:8082" and "8080:8081:svc" are both rejected).
        if !is_service_name(parts[1]) {
            return Err(err());
        }
        let remote = parts[2].parse::<u16>().map_err(|_| err())?;

        Ok(Self {
            local,
            remote,
            service_name: Some(parts[1].to_string()),
        })
    }
}

/// Returns true if the segment is a valid service name: a DNS label with
/// at least one non-digit character.
fn is_service_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().any(|c| !c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

impl TryFrom<String> for Forward {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Forward> for String {
    fn from(f: Forward) -> Self {
        match &f.service_name {
            Some(service) if f.remote == 0 => format!("{}:{service}", f.local),
            Some(service) => format!("{}:{service}:{}", f.local, f.remote),
            None => format!("{}:{}", f.local, f.remote),
        }
    }
}

impl std::fmt::Display for Forward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let f = Forward::parse("8080:9090").expect("should parse");
        assert_eq!(f, Forward::new(8080, 9090));
    }

    #[test]
    fn test_parse_equal_ports() {
        let f = Forward::parse("8080:8080").expect("should parse");
        assert_eq!(f, Forward::new(8080, 8080));
    }

    #[test]
    fn test_parse_service() {
        let f = Forward::parse("8080:svc").expect("should parse");
        assert_eq!(f.local, 8080);
        assert_eq!(f.remote, 0);
        assert_eq!(f.service_name.as_deref(), Some("svc"));
    }

    #[test]
    fn test_parse_service_with_port() {
        let f = Forward::parse("8080:svc:5214").expect("should parse");
        assert_eq!(f.local, 8080);
        assert_eq!(f.remote, 5214);
        assert_eq!(f.service_name.as_deref(), Some("svc"));
    }

    #[test]
    fn test_parse_rejects_bad_forms() {
        assert!(Forward::parse("8080:svc:bar").is_err());
        assert!(Forward::parse("8080:8081:8082").is_err());
        assert!(Forward::parse("8080:8081:svc").is_err());
        assert!(Forward::parse("8080").is_err());
        assert!(Forward::parse("svc:8080").is_err());
    }

    #[test]
    fn test_roundtrip() {
        for s in ["8080:9090", "8080:svc", "8080:svc:5214"] {
            let f = Forward::parse(s).expect("should parse");
            assert_eq!(String::from(f), s);
        }
    }
}
