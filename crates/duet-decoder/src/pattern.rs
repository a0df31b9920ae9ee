use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern has {found} characters, expected {expected}")]
    Length { expected: usize, found: usize },
    #[error("invalid character {found:?} at position {position}; expected '0', '1' or 'x'")]
    Character { position: usize, found: char },
}

/// A fixed-width bit pattern over a decoder index, written most significant bit first.
///
/// `0` and `1` are fixed bits, `x` is a don't-care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub mask: u32,
    pub value: u32,
}

impl Pattern {
    pub const fn try_parse(text: &str, width: usize) -> Result<Self, PatternError> {
        let bytes = text.as_bytes();
        if bytes.len() != width {
            return Err(PatternError::Length {
                expected: width,
                found: bytes.len(),
            });
        }

        let mut mask = 0;
        let mut value = 0;
        let mut i = 0;
        while i < width {
            let bit = 1 << (width - 1 - i);
            match bytes[i] {
                b'0' => mask |= bit,
                b'1' => {
                    mask |= bit;
                    value |= bit;
                }
                b'x' => {}
                other => {
                    return Err(PatternError::Character {
                        position: i,
                        found: other as char,
                    })
                }
            }
            i += 1;
        }
        Ok(Self { mask, value })
    }

    /// Parses a pattern known at compile time; a malformed pattern fails const evaluation.
    pub const fn parse(text: &str, width: usize) -> Self {
        match Self::try_parse(text, width) {
            Ok(pattern) => pattern,
            Err(_) => panic!("malformed decoder pattern"),
        }
    }

    #[inline]
    pub const fn matches(&self, index: u32) -> bool {
        index & self.mask == self.value
    }

    #[inline]
    pub const fn specificity(&self) -> u32 {
        self.mask.count_ones()
    }
}
