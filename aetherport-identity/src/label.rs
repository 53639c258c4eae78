use std::{fmt, str::FromStr};

use crate::Error;

/// An ordered `key=value` pair carried on certificates and endpoint strings.
///
/// The key is everything up to the first `'='`; the value may itself contain
/// `'='` characters and may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    key: String,
    value: String,
}

impl Label {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let i = match s.find('=') {
            Some(i) if i >= 1 => i,
            _ => return Err(Error::Label(s.to_string())),
        };

        Ok(Self {
            key: s[..i].to_string(),
            value: s[(i + 1)..].to_string(),
        })
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key.is_empty() {
            true => Ok(()),
            false => write!(f, "{}={}", self.key, self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Label;

    #[test]
    fn parse_keeps_the_whole_key() {
        let label: Label = "proto=tcp".parse().unwrap();
        assert_eq!(label.key(), "proto");
        assert_eq!(label.value(), "tcp");
    }

    #[test]
    fn parse_allows_empty_value_and_equals_in_value() {
        let label: Label = "flag=".parse().unwrap();
        assert_eq!(label.key(), "flag");
        assert_eq!(label.value(), "");

        let label: Label = "expr=a=b".parse().unwrap();
        assert_eq!(label.key(), "expr");
        assert_eq!(label.value(), "a=b");
    }

    #[test]
    fn parse_rejects_missing_or_leading_equals() {
        assert!("".parse::<Label>().is_err());
        assert!("novalue".parse::<Label>().is_err());
        assert!("=value".parse::<Label>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let label = Label::new("env", "prod");
        let parsed: Label = label.to_string().parse().unwrap();
        assert_eq!(label, parsed);
    }
}
