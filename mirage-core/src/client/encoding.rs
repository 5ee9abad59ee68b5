//! Percent encoding as performed by the emulated client

use serde::{Deserialize, Serialize};

use super::TemplateError;

/// Case of the hex digits in `%XX` escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HexCase {
    Lower,
    Upper,
}

/// Percent-encodes bytes, leaving characters matched by the exclusion
/// pattern untouched.
///
/// The exclusion pattern is a single-character regex such as
/// `[A-Za-z0-9-]`; it is evaluated once per byte value when the encoder is
/// built. Characters up to U+00FF are treated as single Latin-1 bytes so
/// raw info hashes and binary peer ids survive the trip through `String`.
#[derive(Debug, Clone)]
pub struct UrlEncoder {
    pattern: String,
    hex_case: HexCase,
    excluded: [bool; 256],
}

impl UrlEncoder {
    /// Builds the encoder.
    ///
    /// # Errors
    /// - `TemplateError::InvalidEncoderPattern` - The pattern is not a valid regex
    pub fn new(exclusion_pattern: &str, hex_case: HexCase) -> Result<Self, TemplateError> {
        let anchored = format!("^(?:{exclusion_pattern})$");
        let regex =
            regex::Regex::new(&anchored).map_err(|e| TemplateError::InvalidEncoderPattern {
                pattern: exclusion_pattern.to_string(),
                reason: e.to_string(),
            })?;

        let mut excluded = [false; 256];
        for (byte, slot) in excluded.iter_mut().enumerate() {
            let mut buffer = [0u8; 4];
            let character = char::from(byte as u8).encode_utf8(&mut buffer);
            *slot = regex.is_match(character);
        }

        Ok(Self {
            pattern: exclusion_pattern.to_string(),
            hex_case,
            excluded,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Encodes raw bytes.
    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        let mut encoded = String::with_capacity(bytes.len() * 3);
        for &byte in bytes {
            self.push_byte(&mut encoded, byte);
        }
        encoded
    }

    /// Encodes a string, mapping Latin-1 characters to single bytes.
    pub fn encode_str(&self, value: &str) -> String {
        let mut encoded = String::with_capacity(value.len() * 3);
        for character in value.chars() {
            match u8::try_from(u32::from(character)) {
                Ok(byte) => self.push_byte(&mut encoded, byte),
                Err(_) => {
                    let mut buffer = [0u8; 4];
                    for &byte in character.encode_utf8(&mut buffer).as_bytes() {
                        self.push_escape(&mut encoded, byte);
                    }
                }
            }
        }
        encoded
    }

    fn push_byte(&self, out: &mut String, byte: u8) {
        if self.excluded[usize::from(byte)] {
            out.push(char::from(byte));
        } else {
            self.push_escape(out, byte);
        }
    }

    fn push_escape(&self, out: &mut String, byte: u8) {
        let escape = match self.hex_case {
            HexCase::Lower => format!("%{byte:02x}"),
            HexCase::Upper => format!("%{byte:02X}"),
        };
        out.push_str(&escape);
    }
}
