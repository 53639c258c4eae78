use std::{collections::HashSet, fmt, str::FromStr};

use aetherport_identity::Label;

use crate::Error;

/// One forwarded endpoint: where the egress listens and where the ingress
/// dials, plus optional labels.
///
/// The textual form is `localhost:localport:remotehost:remoteport`, optionally
/// followed by `;key=value` labels. The only label currently understood is
/// `proto`. The string doubles as the data channel label, which is how the
/// ingress learns where to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub local: String,
    pub remote: String,
    pub proto: Option<String>,
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let address = parts.next().unwrap_or_default();

        let tokens: Vec<&str> = address.split(':').collect();
        if tokens.len() != 4 {
            return Err(Error::ConfigInvalid(format!("invalid endpoint: {s}")));
        }

        let mut endpoint = Endpoint {
            local: format!("{}:{}", tokens[0], tokens[1]),
            remote: format!("{}:{}", tokens[2], tokens[3]),
            proto: None,
        };

        for part in parts {
            let label: Label = part
                .parse()
                .map_err(|error| Error::ConfigInvalid(format!("cannot parse label ({part}): {error}")))?;

            match label.key() {
                "proto" => endpoint.proto = Some(label.value().to_string()),
                _ => return Err(Error::ConfigInvalid(format!("invalid label: {part}"))),
            }
        }

        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)?;
        if let Some(proto) = &self.proto {
            write!(f, ";{}", Label::new("proto", proto.clone()))?;
        }
        Ok(())
    }
}

/// Decides which remote addresses an ingress will dial on behalf of a peer.
///
/// A list containing `"*"` admits everything. Otherwise only exact
/// `host:port` string matches are admitted; there is no CIDR or wildcard
/// matching.
#[derive(Debug, Clone)]
pub struct EndpointAuthorizer {
    allow_all: bool,
    allowed: HashSet<String>,
}

impl EndpointAuthorizer {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allow_all = false;
        let mut allowed = HashSet::new();

        for pattern in patterns {
            let pattern = pattern.into();
            match pattern.as_str() {
                "*" => allow_all = true,
                _ => {
                    allowed.insert(pattern);
                }
            }
        }

        Self { allow_all, allowed }
    }

    pub fn allows(&self, endpoint: &Endpoint) -> bool {
        self.allow_all || self.allowed.contains(&endpoint.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, EndpointAuthorizer};

    #[test]
    fn parses_the_four_token_form_with_labels() {
        let ep: Endpoint = "127.0.0.1:8080:10.0.0.1:22;proto=tcp".parse().unwrap();
        assert_eq!(ep.local, "127.0.0.1:8080");
        assert_eq!(ep.remote, "10.0.0.1:22");
        assert_eq!(ep.proto.as_deref(), Some("tcp"));
    }

    #[test]
    fn parses_without_labels() {
        let ep: Endpoint = "localhost:9000:localhost:22".parse().unwrap();
        assert_eq!(ep.local, "localhost:9000");
        assert_eq!(ep.remote, "localhost:22");
        assert_eq!(ep.proto, None);
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!("a:b:c".parse::<Endpoint>().is_err());
        assert!("a:b:c:d:e".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
        assert!("a:1:b:2;color=red".parse::<Endpoint>().is_err());
        assert!("a:1:b:2;junk".parse::<Endpoint>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["127.0.0.1:8080:10.0.0.1:22;proto=tcp", "localhost:9000:localhost:22"] {
            let ep: Endpoint = s.parse().unwrap();
            assert_eq!(ep.to_string(), s);
        }
    }

    #[test]
    fn star_admits_everything() {
        let auth = EndpointAuthorizer::new(["10.0.0.1:22", "*"]);
        let ep: Endpoint = "a:1:198.51.100.7:9999".parse().unwrap();
        assert!(auth.allows(&ep));
    }

    #[test]
    fn matching_is_exact() {
        let auth = EndpointAuthorizer::new(["10.0.0.1:22"]);

        let allowed: Endpoint = "a:1:10.0.0.1:22".parse().unwrap();
        assert!(auth.allows(&allowed));

        // No CIDR, no wildcard, no port-less prefix: anything but the exact
        // string is refused.
        for remote in ["10.0.0.1:2222", "10.0.0.2:22", "10.0.0.1:2"] {
            let ep: Endpoint = format!("a:1:{remote}").parse().unwrap();
            assert!(!auth.allows(&ep), "{remote} should not be admitted");
        }
    }

    #[test]
    fn empty_list_admits_nothing() {
        let auth = EndpointAuthorizer::new(Vec::<String>::new());
        let ep: Endpoint = "a:1:10.0.0.1:22".parse().unwrap();
        assert!(!auth.allows(&ep));
    }
}
