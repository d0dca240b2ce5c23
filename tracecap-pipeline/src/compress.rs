//! zlib/deflate compression of a whole frame blob, via `flate2` (see
//! DESIGN.md for why this crate reaches for zlib rather than Snappy).

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// `level` is clamped into flate2's 0..=9 range; 0 means "store", which
/// callers should generally avoid by not calling this at all when the
/// bracket table assigns level 0.
pub fn compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .expect("writing to an in-memory ZlibEncoder cannot fail");
    encoder
        .finish()
        .expect("finishing an in-memory ZlibEncoder cannot fail")
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
