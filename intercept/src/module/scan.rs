//! Byte-signature matching with wildcards.

use crate::types::HookError;

/// A byte pattern such as `"FF FF 00 A9 ?? 00 00 F9"`. `??` (or `?`) matches any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<Option<u8>>,
}

impl Signature {
    pub fn parse(pattern: &str) -> Result<Self, HookError> {
        let bytes = pattern
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(None),
                hex if hex.len() == 2 => u8::from_str_radix(hex, 16)
                    .map(Some)
                    .map_err(|_| HookError::InvalidPattern(pattern.to_string())),
                _ => Err(HookError::InvalidPattern(pattern.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if bytes.is_empty() || bytes.iter().all(Option::is_none) {
            return Err(HookError::InvalidPattern(pattern.to_string()));
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(window)
            .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
    }

    /// Offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.bytes.len() {
            return None;
        }
        haystack
            .windows(self.bytes.len())
            .position(|window| self.matches_at(window))
    }

    /// Scan `len` bytes of live memory at `start`.
    ///
    /// # Safety
    /// The whole range must be mapped readable for the duration of the call.
    pub unsafe fn find_in_memory(&self, start: usize, len: usize) -> Option<usize> {
        let haystack = core::slice::from_raw_parts(start as *const u8, len);
        self.find(haystack).map(|offset| start + offset)
    }
}

impl std::str::FromStr for Signature {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
