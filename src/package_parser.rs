//! Contains parser used to parse packages
use bytes::Buf;
use thiserror::Error;

/// Error returned by the [PackageParser]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The package was shorter than expected
    #[error("End of package")]
    EndOfPackage,
    /// A string in a package was not utf-8 as expected
    #[error("Utf-8 error at {valid_up_to}")]
    Utf8Error {
        /// The string is valid utf-8 until this many bytes
        valid_up_to: u32,
        /// The length of the error
        error_len: Option<u8>,
    },
    /// We expected a non-null value, but found null
    #[error("Unexpected null value")]
    Null,
}

const _: () = {
    assert!(size_of::<DecodeError>() <= 8);
};

impl From<bytes::TryGetError> for DecodeError {
    fn from(_value: bytes::TryGetError) -> Self {
        DecodeError::EndOfPackage
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        DecodeError::Utf8Error {
            valid_up_to: value.valid_up_to().try_into().unwrap_or(u32::MAX),
            error_len: value.error_len().map(|v| v.try_into().unwrap_or(0xFF)),
        }
    }
}

/// Result returned by [PackageParser]
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Parse a Mysql/Mariadb package
#[derive(Clone, Copy)]
pub struct PackageParser<'a>(&'a [u8]);

impl<'a> PackageParser<'a> {
    /// Construct a new [PackageParser] for the given package
    pub fn new(package: &'a [u8]) -> Self {
        Self(package)
    }

    /// Number of bytes left in the package
    #[inline]
    pub fn remaining(&self) -> usize {
        self.0.len()
    }

    /// Return the next byte without consuming it
    #[inline]
    pub fn peek_u8(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Read a u8 from the package
    #[inline]
    pub fn get_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.0.try_get_u8()?)
    }

    /// Read a u16 from the package
    #[inline]
    pub fn get_u16(&mut self) -> DecodeResult<u16> {
        Ok(self.0.try_get_u16_le()?)
    }

    /// Read a u32 from the package
    #[inline]
    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(self.0.try_get_u32_le()?)
    }

    /// Read a u64 from the package
    #[inline]
    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        Ok(self.0.try_get_u64_le()?)
    }

    /// Read a 3-byte little-endian integer from the package
    #[inline]
    pub fn get_u24(&mut self) -> DecodeResult<u32> {
        let a: u32 = self.get_u8()?.into();
        let b: u32 = self.get_u8()?.into();
        let c: u32 = self.get_u8()?.into();
        Ok(a | (b << 8) | (c << 16))
    }

    /// Read a variable encoded length
    ///
    /// See <https://mariadb.com/docs/server/reference/clientserver-protocol/protocol-data-types#length-encoded-integers>
    #[inline]
    pub fn get_lenenc(&mut self) -> DecodeResult<u64> {
        let v = self.get_u8()?;
        Ok(match v {
            0xFC => self.get_u16()?.into(),
            0xFD => self.get_u24()?.into(),
            0xFE => self.get_u64()?,
            v => v.into(),
        })
    }

    /// Read a variable encoded length where 0xFB encodes NULL
    ///
    /// Used for row values in the text protocol, where NULL must stay
    /// distinct from a zero length
    #[inline]
    pub fn get_lenenc_opt(&mut self) -> DecodeResult<Option<u64>> {
        match self.peek_u8() {
            Some(0xFB) => {
                self.0.advance(1);
                Ok(None)
            }
            Some(_) => Ok(Some(self.get_lenenc()?)),
            None => Err(DecodeError::EndOfPackage),
        }
    }

    /// Read a variable encoded blob
    #[inline]
    pub fn get_lenenc_blob(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)
    }

    /// Read a variable encoded blob where 0xFB encodes NULL
    #[inline]
    pub fn get_lenenc_blob_opt(&mut self) -> DecodeResult<Option<&'a [u8]>> {
        match self.get_lenenc_opt()? {
            Some(len) => Ok(Some(self.get_bytes(len as usize)?)),
            None => Ok(None),
        }
    }

    /// Read a variable encoded utf8-string
    #[inline]
    pub fn get_lenenc_str(&mut self) -> DecodeResult<&'a str> {
        let len = self.get_lenenc()?;
        let v = self.get_bytes(len as usize)?;
        Ok(str::from_utf8(v)?)
    }

    /// Skip past a variable encoded string or blob
    #[inline]
    pub fn skip_lenenc_str(&mut self) -> DecodeResult<()> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)?;
        Ok(())
    }

    /// Read a null-terminated string
    #[inline]
    pub fn get_null_str(&mut self) -> DecodeResult<&'a str> {
        match std::ffi::CStr::from_bytes_until_nul(self.0) {
            Ok(v) => {
                let v = v.to_str()?;
                self.0.advance(v.len() + 1);
                Ok(v)
            }
            Err(_) => Err(DecodeError::EndOfPackage),
        }
    }

    /// Read the rest of the package as a utf-8 string
    #[inline]
    pub fn get_eof_str(&mut self) -> DecodeResult<&'a str> {
        let v = str::from_utf8(self.0)?;
        self.0.advance(v.len());
        Ok(v)
    }

    /// Read some bytes from the package
    #[inline]
    pub fn get_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        match self.0.get(..len) {
            Some(v) => {
                self.0.advance(len);
                Ok(v)
            }
            None => Err(DecodeError::EndOfPackage),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;

    #[test]
    fn lenenc_decoding() {
        let mut p = PackageParser::new(&[0x00]);
        assert_eq!(p.get_lenenc().unwrap(), 0);

        let mut p = PackageParser::new(&[0x01]);
        assert_eq!(p.get_lenenc().unwrap(), 1);

        let mut p = PackageParser::new(&[0xFA]);
        assert_eq!(p.get_lenenc().unwrap(), 250);

        let mut p = PackageParser::new(&[0xFC, 0xFF, 0xFF]);
        assert_eq!(p.get_lenenc().unwrap(), 65535);

        let mut p = PackageParser::new(&[0xFD, 0xFF, 0xFF, 0xFF]);
        assert_eq!(p.get_lenenc().unwrap(), 16777215);

        let mut p = PackageParser::new(&[0xFE, 1, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(p.get_lenenc().unwrap(), 1 | 1 << 32);
    }

    #[test]
    fn lenenc_null_is_not_zero() {
        let mut p = PackageParser::new(&[0xFB]);
        assert_eq!(p.get_lenenc_opt().unwrap(), None);
        assert_eq!(p.remaining(), 0);

        let mut p = PackageParser::new(&[0x00]);
        assert_eq!(p.get_lenenc_opt().unwrap(), Some(0));
    }

    #[test]
    fn lenenc_blob_null_and_empty_differ() {
        let mut p = PackageParser::new(&[0xFB, 0x00, 0x02, b'h', b'i']);
        assert_eq!(p.get_lenenc_blob_opt().unwrap(), None);
        assert_eq!(p.get_lenenc_blob_opt().unwrap(), Some(&b""[..]));
        assert_eq!(p.get_lenenc_blob_opt().unwrap(), Some(&b"hi"[..]));
        assert!(p.get_lenenc_blob_opt().is_err());
    }

    #[test]
    fn u24_little_endian() {
        let mut p = PackageParser::new(&[0x01, 0x02, 0x03]);
        assert_eq!(p.get_u24().unwrap(), 0x030201);
    }

    #[test]
    fn null_str_stops_at_nul() {
        let mut p = PackageParser::new(b"5.5.2-m2\0rest");
        assert_eq!(p.get_null_str().unwrap(), "5.5.2-m2");
        assert_eq!(p.get_eof_str().unwrap(), "rest");
    }

    #[test]
    fn truncated_reads_fail() {
        let mut p = PackageParser::new(&[0x01]);
        assert!(matches!(p.get_u16(), Err(DecodeError::EndOfPackage)));
        let mut p = PackageParser::new(&[0x05, b'a']);
        assert!(matches!(
            p.get_lenenc_str(),
            Err(DecodeError::EndOfPackage)
        ));
    }
}
