use tokenizers::Tokenizer;

use crate::error::ServiceError;

/// Anything that can turn token ids back into text.
pub trait Detokenize {
    fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError>;
}

impl Detokenize for Tokenizer {
    fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError> {
        // special tokens stay in the text so the end-of-turn marker reaches the parser
        self.decode(ids, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

/// Turns a growing sequence of generated ids into text fragments.
///
/// Byte-level tokenizers can split a multi-byte character across tokens, in
/// which case the partial decode ends in U+FFFD. Such tails are held back until
/// the next token completes them.
#[derive(Debug, Default)]
pub struct TokenTextStream {
    ids: Vec<u32>,
    emitted: usize,
}

impl TokenTextStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<D: Detokenize + ?Sized>(
        &mut self,
        decoder: &D,
        id: u32,
    ) -> Result<Option<String>, ServiceError> {
        self.ids.push(id);
        let text = decoder.detokenize(&self.ids)?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_new(text))
    }

    /// Emits whatever is still pending once generation stops.
    pub fn flush<D: Detokenize + ?Sized>(
        &mut self,
        decoder: &D,
    ) -> Result<Option<String>, ServiceError> {
        if self.ids.is_empty() {
            return Ok(None);
        }
        let text = decoder.detokenize(&self.ids)?;
        Ok(self.take_new(text))
    }

    fn take_new(&mut self, text: String) -> Option<String> {
        if text.len() <= self.emitted || !text.is_char_boundary(self.emitted) {
            return None;
        }
        let fragment = text[self.emitted..].to_string();
        self.emitted = text.len();
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decodes ids as raw bytes, lossily, like a byte-level BPE would.
    struct ByteDecoder;

    impl Detokenize for ByteDecoder {
        fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[test]
    fn ascii_tokens_are_emitted_one_by_one() {
        let mut stream = TokenTextStream::new();
        let mut out = Vec::new();
        for byte in b"{\"a\"" {
            if let Some(fragment) = stream.push(&ByteDecoder, *byte as u32).unwrap() {
                out.push(fragment);
            }
        }
        assert_eq!(out, vec!["{", "\"", "a", "\""]);
        assert_eq!(stream.flush(&ByteDecoder).unwrap(), None);
    }

    #[test]
    fn split_multibyte_characters_are_held_back() {
        let mut stream = TokenTextStream::new();
        // "đ" is 0xC4 0x91
        assert_eq!(stream.push(&ByteDecoder, 0xC4).unwrap(), None);
        assert_eq!(
            stream.push(&ByteDecoder, 0x91).unwrap().as_deref(),
            Some("đ")
        );
    }

    #[test]
    fn flush_releases_a_dangling_tail() {
        let mut stream = TokenTextStream::new();
        stream.push(&ByteDecoder, b'x' as u32).unwrap();
        assert_eq!(stream.push(&ByteDecoder, 0xC4).unwrap(), None);
        assert_eq!(
            stream.flush(&ByteDecoder).unwrap().as_deref(),
            Some("\u{FFFD}")
        );
    }
}
