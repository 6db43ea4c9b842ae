//! Capability table built from the EHLO reply.

use std::collections::BTreeMap;

use super::Reply;

/// Extensions advertised by the server.
///
/// Keys are uppercased keywords; values are the whitespace-separated
/// arguments. The table is replaced wholesale on every EHLO and is empty
/// until the first one succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    entries: BTreeMap<String, Vec<String>>,
}

impl Capabilities {
    /// Builds the table from an EHLO reply.
    ///
    /// The first line is the server's greeting and carries no extension.
    /// Duplicate keywords accumulate their arguments.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in reply.lines().iter().skip(1) {
            let mut words = line.text.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            entries
                .entry(keyword.to_uppercase())
                .or_default()
                .extend(words.map(ToString::to_string));
        }
        Self { entries }
    }

    /// Returns true if `name` (case-insensitive) was advertised.
    #[must_use]
    pub fn have(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_uppercase())
    }

    /// Returns the arguments of `name`, if advertised.
    #[must_use]
    pub fn arguments(&self, name: &str) -> Option<&[String]> {
        self.entries.get(&name.to_uppercase()).map(Vec::as_slice)
    }

    /// SASL mechanisms from `AUTH` and legacy `AUTH=` lines, de-duplicated
    /// in order of appearance.
    #[must_use]
    pub fn sasl_mechanisms(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |mech: &str| {
            if !mech.is_empty() && !out.iter().any(|m| m.eq_ignore_ascii_case(mech)) {
                out.push(mech.to_string());
            }
        };

        if let Some(args) = self.entries.get("AUTH") {
            args.iter().for_each(|m| push(m));
        }
        for (key, args) in &self.entries {
            if let Some(first) = key.strip_prefix("AUTH=") {
                push(first);
                args.iter().for_each(|m| push(m));
            }
        }
        out
    }

    /// Maximum message size from `SIZE`, if advertised with a non-zero value.
    #[must_use]
    pub fn max_size(&self) -> Option<u64> {
        self.arguments("SIZE")?
            .first()?
            .parse()
            .ok()
            .filter(|&n| n > 0)
    }

    /// Returns true if no extension was advertised (e.g. after HELO).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(keyword, arguments)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    fn ehlo(lines: &[&str]) -> Capabilities {
        let mut reply = Reply::new();
        let last = lines.len() - 1;
        for (i, text) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            reply.parse_line(format!("250{sep}{text}\r\n").as_bytes());
        }
        assert!(reply.is_complete());
        Capabilities::from_ehlo(&reply)
    }

    #[test]
    fn skips_greeting_line() {
        let caps = ehlo(&["mx.example.com greets you", "PIPELINING"]);
        assert!(caps.have("pipelining"));
        assert!(!caps.have("MX.EXAMPLE.COM"));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let caps = ehlo(&["hi", "starttls", "8bitmime"]);
        assert!(caps.have("STARTTLS"));
        assert!(caps.have("8BITMIME"));
    }

    #[test]
    fn auth_mechanisms() {
        let caps = ehlo(&["hi", "AUTH PLAIN LOGIN CRAM-MD5"]);
        assert_eq!(caps.sasl_mechanisms(), vec!["PLAIN", "LOGIN", "CRAM-MD5"]);
    }

    #[test]
    fn legacy_auth_equals_merged() {
        let caps = ehlo(&["hi", "AUTH PLAIN LOGIN", "AUTH=LOGIN PLAIN XOAUTH2"]);
        assert_eq!(caps.sasl_mechanisms(), vec!["PLAIN", "LOGIN", "XOAUTH2"]);
    }

    #[test]
    fn duplicate_keywords_accumulate() {
        let caps = ehlo(&["hi", "AUTH PLAIN", "AUTH LOGIN"]);
        assert_eq!(caps.arguments("auth").unwrap(), ["PLAIN", "LOGIN"]);
    }

    #[test]
    fn size_limit() {
        assert_eq!(ehlo(&["hi", "SIZE 35882577"]).max_size(), Some(35_882_577));
        assert_eq!(ehlo(&["hi", "SIZE"]).max_size(), None);
        assert_eq!(ehlo(&["hi", "SIZE 0"]).max_size(), None);
    }

    #[test]
    fn single_line_ehlo_is_empty() {
        let caps = ehlo(&["mx.example.com"]);
        assert!(caps.is_empty());
        assert!(caps.sasl_mechanisms().is_empty());
    }
}
