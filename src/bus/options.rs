//! # Per-message delivery options and headers.
//!
//! [`DeliveryOptions`] travel with a single send/publish/request call:
//! reply timeout, an explicit codec name overriding type-based resolution,
//! and application headers. [`Headers`] is a multimap; adding a header never
//! clobbers earlier values for the same name.

use std::collections::HashMap;
use std::time::Duration;

/// Default reply timeout for `request`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Case-sensitive string multimap carried on every message.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    map: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// Appends a value, keeping any existing values for `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Replaces all values for `name` with the single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(name.into(), vec![value.into()]);
        self
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for `name`, oldest first.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.map.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Removes all values for `name`. Returns whether the name was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over `(name, value)` pairs, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

/// Options applied to one delivery.
#[derive(Clone, Debug)]
pub struct DeliveryOptions {
    timeout: Duration,
    codec_name: Option<String>,
    headers: Headers,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            timeout: DEFAULT_TIMEOUT,
            codec_name: None,
            headers: Headers::new(),
        }
    }
}

impl DeliveryOptions {
    pub fn new() -> DeliveryOptions {
        DeliveryOptions::default()
    }

    /// Reply timeout for `request`. Defaults to 30 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forces the named codec instead of resolving one from the body type.
    pub fn with_codec_name(mut self, name: impl Into<String>) -> Self {
        self.codec_name = Some(name.into());
        self
    }

    /// Adds one application header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Replaces the full header set.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn codec_name(&self) -> Option<&str> {
        self.codec_name.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub(crate) fn into_headers(self) -> Headers {
        self.headers
    }
}
