use snafu::ensure;

use super::source::{DecodeSnafu, SourceError, SourceResult};

/// Incremental UTF-8 decoder for a chunked body.
///
/// Network chunks can split a multi-byte sequence; the incomplete tail is held back until
/// the next chunk completes it.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    consumed: usize,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `bytes` (plus any held-back tail) as forms complete characters.
    pub fn decode(&mut self, bytes: &[u8]) -> SourceResult<String> {
        self.pending.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) => {
                ensure!(
                    error.error_len().is_none(),
                    DecodeSnafu {
                        stage: "decode-chunk",
                        offset: self.consumed + error.valid_up_to(),
                    }
                );
                error.valid_up_to()
            }
        };

        let tail = self.pending.split_off(valid_up_to);
        let head = std::mem::replace(&mut self.pending, tail);
        let offset = self.consumed;
        self.consumed += head.len();

        String::from_utf8(head).map_err(|_| SourceError::Decode {
            stage: "decode-chunk-head",
            offset,
        })
    }

    /// Fails if the body ended in the middle of a character.
    pub fn finish(self) -> SourceResult<()> {
        ensure!(
            self.pending.is_empty(),
            DecodeSnafu {
                stage: "decode-finish",
                offset: self.consumed,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_split_multibyte_sequence_to_next_chunk() {
        let bytes = "¿Qué?".as_bytes();
        let mut decoder = Utf8StreamDecoder::new();

        // "¿" is two bytes; split it down the middle.
        assert_eq!(decoder.decode(&bytes[..1]).unwrap(), "");
        assert_eq!(decoder.decode(&bytes[1..4]).unwrap(), "¿Qu");
        assert_eq!(decoder.decode(&bytes[4..]).unwrap(), "é?");
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn invalid_byte_is_a_decode_error() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(b"ok").unwrap(), "ok");

        let error = decoder.decode(&[b'!', 0xFF, b'x']).unwrap_err();
        assert!(matches!(error, SourceError::Decode { offset: 3, .. }));
    }

    #[test]
    fn truncated_tail_fails_on_finish() {
        let mut decoder = Utf8StreamDecoder::new();
        let euro = "€".as_bytes();
        assert_eq!(decoder.decode(&euro[..2]).unwrap(), "");
        assert!(matches!(
            decoder.finish(),
            Err(SourceError::Decode { offset: 0, .. })
        ));
    }
}
