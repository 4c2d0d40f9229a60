use crate::RecorderError;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::borrow::Cow;
use std::io::Read;

/// Decodes an entity according to its `Content-Encoding`
///
/// `gzip`, `x-gzip` and `deflate` (zlib-wrapped or raw) are decoded.
/// `identity` and encodings this crate never asks for pass through as-is.
pub fn decode_content<'a>(
    encoding: &str,
    entity: &'a [u8],
) -> Result<Cow<'a, [u8]>, RecorderError> {
    let encoding = encoding.trim().to_ascii_lowercase();
    match encoding.as_str() {
        "gzip" | "x-gzip" => read_all(MultiGzDecoder::new(entity), &encoding).map(Cow::Owned),
        "deflate" => match read_all(ZlibDecoder::new(entity), &encoding) {
            Ok(decoded) => Ok(Cow::Owned(decoded)),
            Err(_) => read_all(DeflateDecoder::new(entity), &encoding).map(Cow::Owned),
        },
        _ => Ok(Cow::Borrowed(entity)),
    }
}

fn read_all(mut reader: impl Read, encoding: &str) -> Result<Vec<u8>, RecorderError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|source| RecorderError::Decode {
            encoding: encoding.to_string(),
            source,
        })?;
    Ok(decoded)
}
