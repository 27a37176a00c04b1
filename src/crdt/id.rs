//! Identifiers and the dense-order generation algorithm.
//!
//! An identifier is a byte string of big-endian 16-bit digits: zero or
//! more position digits, then the originating site, then an intra-block
//! offset. Identifiers are compared as plain unsigned byte strings,
//! which yields a total order dense enough to place a new character
//! strictly between any two neighbors.
//!
//! Two identifiers share a *base* when they are equal everywhere except
//! the trailing offset digit. A block is a run of characters whose
//! identifiers share a base and carry consecutive offsets; the store
//! only materializes the base, deriving each character's identifier
//! from its distance into the run.

use std::fmt;

use rand::Rng;

/// A participant's replica identity. The server is site 0.
pub type SiteId = u16;

/// Largest offset a block can address.
pub const OFFSET_MAX: u16 = u16::MAX;

/// Number of characters a single block can hold.
pub const BLOCK_CAPACITY: usize = 1 << 16;

/// Padding digit for an exhausted high neighbor. One past the largest
/// real digit, so a fresh digit can always be drawn below it.
const PAD_HIGH: u32 = 1 << 16;

/// A character identifier.
///
/// The empty identifier is a sentinel: a missing neighbor during
/// generation, or "end of document" in cursor messages. All non-empty
/// identifiers have even length and at least three digits.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(Vec<u8>);

impl Id {
    /// The empty sentinel identifier.
    pub fn empty() -> Id {
        return Id(Vec::new());
    }

    /// Reconstruct an identifier from raw bytes, validating its shape.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Id> {
        if !bytes.is_empty() && (bytes.len() % 2 != 0 || bytes.len() < 6) {
            return None;
        }
        return Some(Id(bytes));
    }

    /// The raw byte string.
    pub fn as_bytes(&self) -> &[u8] {
        return &self.0;
    }

    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    /// The trailing offset digit.
    ///
    /// Panics if the identifier is empty.
    pub fn offset(&self) -> u16 {
        let n = self.0.len();
        return u16::from_be_bytes([self.0[n - 2], self.0[n - 1]]);
    }

    /// The originating site digit.
    ///
    /// Panics if the identifier is empty.
    pub fn site(&self) -> SiteId {
        let n = self.0.len();
        return u16::from_be_bytes([self.0[n - 4], self.0[n - 3]]);
    }

    /// Whether two identifiers share a base: equal length, equal bytes
    /// everywhere except the trailing offset digit.
    pub fn base_eq(&self, other: &Id) -> bool {
        if self.0.len() != other.0.len() || self.0.len() < 2 {
            return false;
        }
        let n = self.0.len() - 2;
        return self.0[..n] == other.0[..n];
    }

    /// Copy of this identifier with a different offset digit.
    ///
    /// Panics if the identifier is empty.
    pub fn with_offset(&self, offset: u16) -> Id {
        let mut bytes = self.0.clone();
        let n = bytes.len();
        bytes[n - 2..].copy_from_slice(&offset.to_be_bytes());
        return Id(bytes);
    }

    /// Read the digit at `index`, with the offset slot overridden by
    /// `offset` and positions past the end filled with `default`.
    fn digit(&self, index: usize, offset: u16, default: u32) -> u32 {
        let byte = index * 2;
        let len = self.0.len();
        if len >= 2 && byte == len - 2 {
            return offset as u32;
        }
        if byte + 2 <= len {
            return u16::from_be_bytes([self.0[byte], self.0[byte + 1]]) as u32;
        }
        return default;
    }

    /// Generate an identifier strictly between `low` at `low_offset`
    /// and `high` at `high_offset`.
    ///
    /// Walks the paired digit sequences (low side padded with 0, high
    /// side padded with one past the digit maximum, offset slots
    /// overridden by the supplied offsets), copying the low digit while
    /// the gap is too narrow, then drawing a uniform random digit from
    /// the first open gap. The site digit and a zero offset are
    /// appended, so the result's base is fresh to this call.
    pub fn generate_between<R: Rng>(
        low: &Id,
        low_offset: u16,
        high: &Id,
        high_offset: u16,
        site: SiteId,
        rng: &mut R,
    ) -> Id {
        let mut digits: Vec<u16> = Vec::new();
        let mut index = 0;
        let mut l = low.digit(index, low_offset, 0);
        let mut h = high.digit(index, high_offset, PAD_HIGH);
        while (h as i64) - (l as i64) < 2 {
            digits.push(l as u16);
            index += 1;
            l = low.digit(index, low_offset, 0);
            h = high.digit(index, high_offset, PAD_HIGH);
        }
        let middle = rng.gen_range(l + 1..h);
        digits.push(middle as u16);
        digits.push(site);
        digits.push(0);

        let mut bytes = Vec::with_capacity(digits.len() * 2);
        for digit in digits {
            bytes.extend_from_slice(&digit.to_be_bytes());
        }
        return Id(bytes);
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", u16::from_be_bytes([pair[0], pair[1]]))?;
        }
        return write!(f, ")");
    }
}
