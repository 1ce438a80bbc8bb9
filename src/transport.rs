//! Single-fetch transport
//!
//! The engine never speaks HTTP itself. It asks a [`Transport`] for a byte
//! stream per URL; dropping the stream closes the connection.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::debug;

use crate::error::{ContentError, Result};

pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// Blocking HTTP(S) transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mapcontent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ContentError::Network(e.to_string()))?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        debug!(url, "Opening remote stream");

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| ContentError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ContentError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        Ok(Box::new(response))
    }
}

/// Transport serving fixed bodies from memory; unknown URLs fail with a
/// network error.
#[derive(Default)]
pub struct MemoryTransport {
    bodies: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.write().insert(url.to_string(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.bodies.write().remove(url);
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        match self.bodies.read().get(url) {
            Some(body) => Ok(Box::new(Cursor::new(body.clone()))),
            None => Err(ContentError::Network(format!("unreachable: {url}"))),
        }
    }
}
