//! Usage extractors.
//!
//! An extractor measures billable units of one route's request and response
//! bodies. The registry maps the configured allow-list of routes to the
//! extractor of the deployment's service type; anything not on the list is
//! never metered.

mod chat;
mod image;

pub use chat::ChatCompletions;
pub use image::ImageGeneration;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};

/// Read buffer of the brotli decoder.
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Errors raised while measuring a body.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The body is not what the route expects.
    #[error("malformed body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    /// The response uses a content encoding we cannot decode.
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    /// The body claims an encoding but does not decode.
    #[error("failed to decode body: {0}")]
    Decode(#[from] std::io::Error),
}

/// Measures billable usage of one route.
pub trait ReqRespExtractor: Send + Sync {
    /// Billable input units of a request body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed.
    fn input_count(&self, body: &[u8]) -> Result<u64, ExtractError>;

    /// Billable output units across one or more decoded response fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if a fragment is malformed.
    fn output_count(&self, chunks: &[&[u8]]) -> Result<u64, ExtractError>;

    /// Whether a streamed fragment carries the end-of-stream marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the fragment is malformed.
    fn stream_completed(&self, chunk: &[u8]) -> Result<bool, ExtractError>;

    /// Normalize a raw response body before it is measured.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoding is unsupported or does not decode.
    fn response_content(&self, body: &[u8], encoding: Option<&str>)
        -> Result<Vec<u8>, ExtractError>;
}

/// Decode a body according to its `Content-Encoding`.
///
/// # Errors
///
/// Returns `UnsupportedEncoding` for anything but gzip, deflate, br and
/// identity.
pub fn decode_body(body: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, ExtractError> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("" | "identity") => Ok(body.to_vec()),
        Some("gzip" | "x-gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            ZlibDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some("br") => {
            let mut out = Vec::new();
            Decompressor::new(body, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            Ok(out)
        }
        Some(other) => Err(ExtractError::UnsupportedEncoding(other.to_string())),
    }
}

/// Kind of model a deployment serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// Chat completion models.
    Chatbot,
    /// Image generation models.
    ImageGeneration,
}

impl ServiceType {
    /// Get the service type name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chatbot => "chatbot",
            Self::ImageGeneration => "image-generation",
        }
    }

    fn extractor(self) -> Arc<dyn ReqRespExtractor> {
        match self {
            Self::Chatbot => Arc::new(ChatCompletions),
            Self::ImageGeneration => Arc::new(ImageGeneration),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chatbot" => Ok(Self::Chatbot),
            "image-generation" => Ok(Self::ImageGeneration),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Maps billable routes to their extractor.
///
/// Built once at startup and never mutated.
#[derive(Clone)]
pub struct ExtractorRegistry {
    prefix: String,
    routes: BTreeMap<String, Arc<dyn ReqRespExtractor>>,
}

impl ExtractorRegistry {
    /// Build a registry for `routes` under `prefix`, all served by the
    /// extractor of `kind`.
    #[must_use]
    pub fn new(prefix: &str, routes: &[String], kind: ServiceType) -> Self {
        let extractor = kind.extractor();
        let routes = routes
            .iter()
            .map(|route| (route.clone(), Arc::clone(&extractor)))
            .collect();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            routes,
        }
    }

    /// Find the extractor for a full request path.
    ///
    /// Returns the route (without prefix) and its extractor, or `None` when
    /// the path is outside the prefix or not an allow-listed route.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<(&str, &dyn ReqRespExtractor)> {
        let route = path.strip_prefix(&self.prefix)?;
        self.routes
            .get_key_value(route)
            .map(|(route, extractor)| (route.as_str(), &**extractor))
    }

    /// The prefix billable routes are served under.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("prefix", &self.prefix)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn registry() -> ExtractorRegistry {
        ExtractorRegistry::new(
            "/v1/proxy",
            &["/chat/completions".to_string()],
            ServiceType::Chatbot,
        )
    }

    #[test]
    fn lookup_requires_exact_route() {
        let registry = registry();
        let (route, _) = registry.lookup("/v1/proxy/chat/completions").unwrap();
        assert_eq!(route, "/chat/completions");

        assert!(registry.lookup("/v1/proxy/chat/completions/extra").is_none());
        assert!(registry.lookup("/v1/proxy/models").is_none());
        assert!(registry.lookup("/chat/completions").is_none());
    }

    #[test]
    fn trailing_slash_on_prefix_is_ignored() {
        let registry = ExtractorRegistry::new(
            "/v1/proxy/",
            &["/chat/completions".to_string()],
            ServiceType::Chatbot,
        );
        assert!(registry.lookup("/v1/proxy/chat/completions").is_some());
    }

    #[test]
    fn decodes_gzip_and_deflate() {
        let plain = b"hello world";

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(plain).unwrap();
        let gz = gz.finish().unwrap();
        assert_eq!(decode_body(&gz, Some("gzip")).unwrap(), plain);

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(plain).unwrap();
        let zlib = zlib.finish().unwrap();
        assert_eq!(decode_body(&zlib, Some("deflate")).unwrap(), plain);

        assert_eq!(decode_body(plain, None).unwrap(), plain);
        assert_eq!(decode_body(plain, Some("identity")).unwrap(), plain);
    }

    #[test]
    fn decodes_brotli() {
        let plain = b"hello brotli world";

        let mut br = brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER_SIZE, 5, 22);
        br.write_all(plain).unwrap();
        let br = br.into_inner();

        assert_eq!(decode_body(&br, Some("br")).unwrap(), plain);
        assert_eq!(decode_body(&br, Some(" BR ")).unwrap(), plain);
    }

    #[test]
    fn unknown_encoding_is_unsupported() {
        assert!(matches!(
            decode_body(b"x", Some("zstd")),
            Err(ExtractError::UnsupportedEncoding(e)) if e == "zstd"
        ));
    }

    #[test]
    fn corrupt_gzip_fails() {
        assert!(matches!(
            decode_body(b"not gzip", Some("gzip")),
            Err(ExtractError::Decode(_))
        ));
    }

    #[test]
    fn service_type_parses() {
        assert_eq!(
            "image-generation".parse::<ServiceType>().unwrap(),
            ServiceType::ImageGeneration
        );
        assert!("speech".parse::<ServiceType>().is_err());
    }
}
