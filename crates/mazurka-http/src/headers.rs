//! An ordered, case-insensitive header multimap shared by Rx and Tx.
//!
//! Insertion order is preserved so responses render deterministically.
//! Duplicate keys merge with `", "` per the header-combining rule,
//! except `Set-Cookie`, which keeps one entry per cookie name.

#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace any existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Merge with an existing value using `", "`. `Set-Cookie` keeps
    /// multiple entries but replaces one with the same cookie name.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key.eq_ignore_ascii_case("set-cookie") {
            let name = cookie_name(&value).to_string();
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|(k, v)| k.eq_ignore_ascii_case("set-cookie") && cookie_name(v) == name)
            {
                entry.1 = value;
            } else {
                self.entries.push((key, value));
            }
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            entry.1.push_str(", ");
            entry.1.push_str(&value);
        } else {
            self.entries.push((key, value));
        }
    }

    /// Append to an existing value with `", "` only if not already present
    /// as a list member.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.get(&key) {
            Some(existing) if existing.split(',').any(|v| v.trim() == value) => {}
            Some(_) => self.add(key, value),
            None => self.set(key, value),
        }
    }

    /// Set only when absent.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.contains(&key) {
            self.entries.push((key, value.into()));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn cookie_name(value: &str) -> &str {
    value.split('=').next().unwrap_or(value).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_headers_merge_with_comma() {
        let mut map = HeaderMap::new();
        map.add("Accept", "text/html");
        map.add("accept", "text/plain");
        assert_eq!(map.get("ACCEPT"), Some("text/html, text/plain"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn set_cookie_keeps_entries_but_replaces_same_name() {
        let mut map = HeaderMap::new();
        map.add("Set-Cookie", "a=1; Path=/");
        map.add("Set-Cookie", "b=2; Path=/");
        map.add("Set-Cookie", "a=3; Path=/");
        let cookies: Vec<_> = map.iter().filter(|(k, _)| *k == "Set-Cookie").collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].1, "a=3; Path=/");
    }

    #[test]
    fn append_is_idempotent() {
        let mut map = HeaderMap::new();
        map.append("Vary", "Accept-Encoding");
        map.append("Vary", "Accept-Encoding");
        map.append("Vary", "Origin");
        assert_eq!(map.get("Vary"), Some("Accept-Encoding, Origin"));
    }
}
