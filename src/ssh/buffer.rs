//! Accumulated subprocess output for one attempt.

use url::Url;

use super::types::UrlPattern;

/// Text read from the ssh process so far.
///
/// Chunks may split a multi-byte character; the incomplete tail is held back
/// until the rest of it arrives.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and append a chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending);
        let mut input = bytes.as_slice();

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    self.text.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            // Truncated sequence at the end of the chunk
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.pending.is_empty()
    }

    /// Match `pattern` against everything buffered, not just the last chunk.
    pub fn find_url(&self, pattern: &UrlPattern) -> Option<Url> {
        let candidate = pattern.find(&self.text)?;
        match Url::parse(candidate) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::debug!("Ignoring unparsable tunnel URL {}: {}", candidate, e);
                None
            }
        }
    }

    pub fn into_string(mut self) -> String {
        if !self.pending.is_empty() {
            self.text.push_str(&String::from_utf8_lossy(&self.pending));
        }
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lhr_pattern() -> UrlPattern {
        UrlPattern::new(r"https://[a-z0-9-]+\.lhr\.life").unwrap()
    }

    #[test]
    fn test_url_straddling_chunks() {
        let mut buffer = OutputBuffer::new();
        buffer.push(b"Connect to https://ab");
        assert!(buffer.find_url(&lhr_pattern()).is_none());
        buffer.push(b"c123.lh");
        assert!(buffer.find_url(&lhr_pattern()).is_none());
        buffer.push(b"r.life tunneled with tls termination\n");

        let url = buffer.find_url(&lhr_pattern()).unwrap();
        assert_eq!(url.as_str(), "https://abc123.lhr.life/");
        assert_eq!(url.host_str(), Some("abc123.lhr.life"));
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "tünnel ready";
        let bytes = text.as_bytes();
        // 'ü' is two bytes starting at index 1
        let mut buffer = OutputBuffer::new();
        buffer.push(&bytes[..2]);
        assert_eq!(buffer.as_str(), "t");
        buffer.push(&bytes[2..]);
        assert_eq!(buffer.as_str(), text);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut buffer = OutputBuffer::new();
        buffer.push(b"ok \xff done");
        assert_eq!(buffer.as_str(), "ok \u{FFFD} done");
    }

    #[test]
    fn test_into_string_flushes_pending() {
        let mut buffer = OutputBuffer::new();
        buffer.push(b"abc\xc3");
        assert_eq!(buffer.as_str(), "abc");
        assert!(!buffer.is_empty());
        assert_eq!(buffer.into_string(), "abc\u{FFFD}");
    }
}
