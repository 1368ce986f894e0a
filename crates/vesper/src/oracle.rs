//! Module resolution collaborators.
//!
//! The orchestrator never touches the disk or the network itself: it asks
//! an [`Oracle`] which files provide a distinct path, and a
//! [`SourceLoader`] for their contents. The process hosts pick the
//! implementations — the CLI wires a TCP oracle and the filesystem, tests
//! wire in-memory maps.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ExposeError;

/// Maps a dotted distinct path to the files providing it.
pub trait Oracle {
    /// The ordered list of filenames whose source declares a matching
    /// distinct. An empty list means "not found"; the orchestrator turns
    /// that into an [`ExposeError`].
    fn files_for(&mut self, distinct: &str) -> Result<Vec<String>, ExposeError>;
}

/// Fetches unit sources by filename.
pub trait SourceLoader {
    fn load(&mut self, filename: &str) -> Result<String, ExposeError>;
}

/// An oracle for processes with no module resolution configured.
#[derive(Debug, Default)]
pub struct NullOracle;

impl Oracle for NullOracle {
    fn files_for(&mut self, distinct: &str) -> Result<Vec<String>, ExposeError> {
        Err(ExposeError::new("no oracle is configured to resolve exposes").with_distinct(distinct))
    }
}

/// An in-memory oracle. For tests and embedders.
#[derive(Debug, Default)]
pub struct MapOracle {
    pub routes: AHashMap<String, Vec<String>>,
}

impl MapOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the files providing a distinct path.
    pub fn route(&mut self, distinct: impl Into<String>, files: impl IntoIterator<Item = String>) {
        self.routes.insert(distinct.into(), files.into_iter().collect());
    }
}

impl Oracle for MapOracle {
    fn files_for(&mut self, distinct: &str) -> Result<Vec<String>, ExposeError> {
        Ok(self.routes.get(distinct).cloned().unwrap_or_default())
    }
}

/// Loads sources from the filesystem.
#[derive(Debug, Default)]
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn load(&mut self, filename: &str) -> Result<String, ExposeError> {
        std::fs::read_to_string(filename)
            .map_err(|e| ExposeError::new(format!("cannot load {filename}: {e}")))
    }
}

/// An in-memory source store. For tests and embedders.
#[derive(Debug, Default)]
pub struct MapLoader {
    pub sources: AHashMap<String, String>,
}

impl MapLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filename: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(filename.into(), source.into());
    }
}

impl SourceLoader for MapLoader {
    fn load(&mut self, filename: &str) -> Result<String, ExposeError> {
        self.sources
            .get(filename)
            .cloned()
            .ok_or_else(|| ExposeError::new(format!("no source for {filename}")))
    }
}

/// The wire request of the oracle protocol.
#[derive(Serialize)]
struct FilesForRequest<'a> {
    #[serde(rename = "Command")]
    command: &'static str,
    #[serde(rename = "Arg")]
    arg: &'a str,
}

/// The wire response: a filename list, or null for "not found".
#[derive(Deserialize)]
struct FilesForResponse {
    result: Option<Vec<String>>,
}

/// A JSON-line oracle client over TCP.
///
/// One request per connection: send `{"Command": "FilesFor", "Arg": …}` on
/// one line, read one response line. Transport failures and timeouts
/// surface as [`ExposeError`]s.
#[derive(Debug, Clone)]
pub struct TcpOracle {
    address: String,
    timeout: Duration,
}

impl TcpOracle {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn transport_error(&self, distinct: &str, message: impl std::fmt::Display) -> ExposeError {
        ExposeError::new(format!("oracle at {} failed: {message}", self.address)).with_distinct(distinct)
    }
}

impl Oracle for TcpOracle {
    fn files_for(&mut self, distinct: &str) -> Result<Vec<String>, ExposeError> {
        let address = self
            .address
            .to_socket_addrs()
            .map_err(|e| self.transport_error(distinct, e))?
            .next()
            .ok_or_else(|| self.transport_error(distinct, "address did not resolve"))?;
        let mut stream = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|e| self.transport_error(distinct, e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| self.transport_error(distinct, e))?;

        let request = FilesForRequest {
            command: "FilesFor",
            arg: distinct,
        };
        let mut line = serde_json::to_string(&request).map_err(|e| self.transport_error(distinct, e))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(|e| self.transport_error(distinct, e))?;

        let mut response = String::new();
        BufReader::new(stream)
            .read_line(&mut response)
            .map_err(|e| self.transport_error(distinct, e))?;
        let response: FilesForResponse =
            serde_json::from_str(response.trim()).map_err(|e| self.transport_error(distinct, e))?;
        Ok(response.result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_to_the_protocol_shape() {
        let request = FilesForRequest {
            command: "FilesFor",
            arg: "a.b.c",
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"Command":"FilesFor","Arg":"a.b.c"}"#
        );
    }

    #[test]
    fn null_result_reads_as_not_found() {
        let response: FilesForResponse = serde_json::from_str(r#"{"result":null}"#).unwrap();
        assert!(response.result.is_none());
    }

    #[test]
    fn null_oracle_always_errors() {
        assert!(NullOracle.files_for("a").is_err());
    }
}
