//! Option negotiation
//!
//! Only `blksize` (RFC 2348) is recognized. Any other option a client sends is
//! accepted as present in the request but neither applied nor echoed back.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Option name for block size negotiation
pub const BLKSIZE: &str = "blksize";

/// Rejection of a recognized option's value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("invalid block size '{0}': not an unsigned integer")]
    MalformedBlockSize(String),

    #[error("invalid block size: {0} not in {min} <= blksize <= {max}", min = BlockSize::MIN, max = BlockSize::MAX)]
    BlockSizeOutOfRange(u64),
}

/// Negotiated DATA payload size
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockSize(u16);

impl BlockSize {
    /// RFC 1350 block size, used unless the client negotiates another
    pub const DEFAULT: u16 = 512;

    pub const MIN: u16 = 8;

    /// Largest payload that fits a maximum-size UDP datagram over IPv4
    pub const MAX: u16 = 65464;

    /// Validate a numeric block size
    ///
    /// # Examples
    /// ```
    /// use tftp::BlockSize;
    ///
    /// assert_eq!(BlockSize::new(1024).unwrap().get(), 1024);
    /// assert!(BlockSize::new(4).is_err());
    /// assert!(BlockSize::new(65465).is_err());
    /// ```
    pub fn new(size: u64) -> Result<Self, OptionError> {
        if size < u64::from(Self::MIN) || size > u64::from(Self::MAX) {
            return Err(OptionError::BlockSizeOutOfRange(size));
        }
        // Range check above keeps this within u16
        Ok(Self(size as u16))
    }

    /// Parse a `blksize` option value
    pub fn from_option(value: &str) -> Result<Self, OptionError> {
        let size = value
            .parse::<u64>()
            .map_err(|_| OptionError::MalformedBlockSize(value.to_string()))?;
        Self::new(size)
    }

    pub fn get(self) -> usize {
        usize::from(self.0)
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of applying a request's options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: BlockSize,
    /// Recognized options with their negotiated values, as advertised in the OACK
    pub accepted: BTreeMap<String, String>,
}

impl TransferOptions {
    /// Apply every recognized option from a request.
    ///
    /// Option names match case-insensitively. Unrecognized names are skipped.
    pub fn negotiate(requested: &BTreeMap<String, String>) -> Result<Self, OptionError> {
        let mut options = Self::default();

        for (name, value) in requested {
            if name.eq_ignore_ascii_case(BLKSIZE) {
                let block_size = BlockSize::from_option(value)?;
                options.block_size = block_size;
                options.accepted.insert(BLKSIZE.to_string(), block_size.to_string());
            } else {
                tracing::debug!("Ignoring unsupported option {}={}", name, value);
            }
        }

        Ok(options)
    }

    /// Whether an OACK exchange has to precede the data transfer
    pub fn needs_oack(&self) -> bool {
        !self.accepted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_block_size_bounds() {
        assert_eq!(BlockSize::default().get(), 512);
        assert_eq!(BlockSize::new(8).unwrap().get(), 8);
        assert_eq!(BlockSize::new(65464).unwrap().get(), 65464);
        assert_eq!(BlockSize::new(7), Err(OptionError::BlockSizeOutOfRange(7)));
        assert_eq!(BlockSize::new(70000), Err(OptionError::BlockSizeOutOfRange(70000)));
    }

    #[test]
    fn test_block_size_from_option() {
        assert_eq!(BlockSize::from_option("1400").unwrap().get(), 1400);
        assert!(matches!(
            BlockSize::from_option("-1"),
            Err(OptionError::MalformedBlockSize(_))
        ));
        assert!(matches!(
            BlockSize::from_option("big"),
            Err(OptionError::MalformedBlockSize(_))
        ));
    }

    #[test]
    fn test_negotiate_without_options() {
        let options = TransferOptions::negotiate(&BTreeMap::new()).unwrap();
        assert_eq!(options.block_size.get(), 512);
        assert!(!options.needs_oack());
    }

    #[test]
    fn test_negotiate_blksize() {
        let options = TransferOptions::negotiate(&requested(&[("BLKSIZE", "01024")])).unwrap();
        assert_eq!(options.block_size.get(), 1024);
        assert_eq!(options.accepted, requested(&[("blksize", "1024")]));
        assert!(options.needs_oack());
    }

    #[test]
    fn test_negotiate_ignores_unknown_options() {
        let options = TransferOptions::negotiate(&requested(&[("tsize", "0"), ("windowsize", "4")])).unwrap();
        assert_eq!(options.block_size, BlockSize::default());
        assert!(!options.needs_oack());
    }

    #[test]
    fn test_negotiate_rejects_small_blksize() {
        let err = TransferOptions::negotiate(&requested(&[("blksize", "4")])).unwrap_err();
        assert_eq!(err, OptionError::BlockSizeOutOfRange(4));
        assert_eq!(err.to_string(), "invalid block size: 4 not in 8 <= blksize <= 65464");
    }
}
