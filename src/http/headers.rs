//! Ordered header multimap with case-insensitive lookup.

use std::fmt;

#[derive(Clone, PartialEq, Eq)]
struct Entry {
    /// Lower-cased lookup key
    key: String,
    /// Name as received or inserted, used for serialization
    name: String,
    value: String,
}

/// HTTP header fields in arrival order.
///
/// Names are matched case-insensitively; duplicates are kept, so a name may
/// carry several values. [`get`](Self::get) returns the last one.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Entry>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a value, keeping existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.push(Entry {
            key: name.to_ascii_lowercase(),
            name,
            value: value.into(),
        });
    }

    /// Replaces every value for `name` with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.append(name, value);
    }

    /// The most recent value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.entries.iter().rev().find(|e| e.key == key).map(|e| e.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = name.to_ascii_lowercase();
        self.entries.iter().filter(move |e| e.key == key).map(|e| e.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any comma-separated element of any `name` value equals
    /// `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Removes every value for `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let key = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// Serializes as `Name: value\r\n` lines.
    pub(crate) fn write_to(&self, out: &mut String) {
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn test_duplicates_keep_order() {
        let mut headers = Headers::new();
        headers.append("X-Multi", "aaa");
        headers.append("Host", "example.com");
        headers.append("x-multi", "bbb");

        assert_eq!(headers.get("X-Multi"), Some("bbb"));
        assert_eq!(headers.get_all("x-MULTI").collect::<Vec<_>>(), vec!["aaa", "bbb"]);

        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Multi", "Host", "x-multi"]);
    }

    #[test]
    fn test_insert_replaces_all() {
        let mut headers = Headers::new();
        headers.append("Via", "a");
        headers.append("via", "b");
        headers.insert("VIA", "c");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("via"), Some("c"));
    }

    #[test]
    fn test_has_token() {
        let mut headers = Headers::new();
        headers.append("Connection", "Upgrade, Keep-Alive");

        assert!(headers.has_token("connection", "keep-alive"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn test_write_to_preserves_original_names() {
        let mut headers = Headers::new();
        headers.append("Content-Length", "5");
        headers.append("X-Test", "yes");

        let mut out = String::new();
        headers.write_to(&mut out);
        assert_eq!(out, "Content-Length: 5\r\nX-Test: yes\r\n");
    }
}
