//! Image generation extractor. Every request bills one unit of input.

use super::{ExtractError, ReqRespExtractor};

/// Extractor for image generation routes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageGeneration;

impl ReqRespExtractor for ImageGeneration {
    fn input_count(&self, _body: &[u8]) -> Result<u64, ExtractError> {
        Ok(1)
    }

    fn output_count(&self, _chunks: &[&[u8]]) -> Result<u64, ExtractError> {
        Ok(0)
    }

    fn stream_completed(&self, _chunk: &[u8]) -> Result<bool, ExtractError> {
        Ok(false)
    }

    fn response_content(
        &self,
        body: &[u8],
        _encoding: Option<&str>,
    ) -> Result<Vec<u8>, ExtractError> {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_fixed_for_any_body() {
        for body in [&b""[..], &b"{}"[..], &b"not even json"[..]] {
            assert_eq!(ImageGeneration.input_count(body).unwrap(), 1);
            assert_eq!(ImageGeneration.output_count(&[body]).unwrap(), 0);
            assert!(!ImageGeneration.stream_completed(body).unwrap());
            assert_eq!(
                ImageGeneration.response_content(body, Some("gzip")).unwrap(),
                body
            );
        }
    }
}
