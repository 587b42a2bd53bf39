//! Order-preserving header list with case-insensitive lookup.

/// Request headers as parsed, or response headers as a servlet set them.
///
/// Request headers keep every entry in arrival order ([`insert`](Self::insert));
/// response headers are written with [`set`](Self::set), where setting a
/// name again replaces the earlier value.
///
/// # Examples
///
/// ```
/// use rservlet::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.set("Content-Type", "text/html");
/// headers.set("X-Trace", "1");
/// headers.set("content-type", "text/plain");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` (case-insensitive) with a single
    /// `name: value` entry.
    ///
    /// The replacement keeps the position of the first existing entry so the
    /// emitted header order stays stable; a new name is appended at the end.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let Some(first) = self
            .inner
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        else {
            self.inner.push((name, value));
            return;
        };

        let mut index = 0;
        self.inner.retain(|(k, _)| {
            let keep = index <= first || !k.eq_ignore_ascii_case(&name);
            index += 1;
            keep
        });
        self.inner[first] = (name, value);
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the total number of header entries (not unique names).
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
