//! QPACK (RFC 9204): static-table field-line compression for HTTP/3.
//!
//! Per the spec's non-goal, the dynamic table is never grown — its
//! capacity is fixed at 0, so every encoder/decoder stream instruction
//! beyond the field-section prefix itself is either a static-table
//! reference or a fully literal field line. That sidesteps the
//! blocked-stream/head-of-line problem the dynamic table exists to
//! solve for the encoder side, while keeping the decoder a complete
//! implementation of Appendix A plus Huffman coding, which a peer is
//! always free to use regardless of our own encoder's choices.

use crate::h3::Http3Error;

/// RFC 9204 Appendix A: the 99-entry static table, indexed 0..=98.
pub const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

fn find_static(name: &str, value: &str) -> Option<usize> {
    STATIC_TABLE.iter().position(|&(n, v)| n == name && v == value)
}

fn find_static_name(name: &str) -> Option<usize> {
    STATIC_TABLE.iter().position(|&(n, _)| n == name)
}

/// A decoded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// RFC 7541 §5.1 N-bit-prefix integer, reused verbatim by QPACK (RFC 9204
/// §4.1.1). `prefix_bits` is the width of the first byte's value bits (the
/// leading bits that carry instruction flags are masked off by the caller).
fn decode_prefixed_int(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<u64, Http3Error> {
    let mask = ((1u16 << prefix_bits) - 1) as u8;
    let first = *buf.get(*pos).ok_or(Http3Error::Truncated)?;
    *pos += 1;
    let mut value = (first & mask) as u64;
    if value < mask as u64 {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let b = *buf.get(*pos).ok_or(Http3Error::Truncated)?;
        *pos += 1;
        value += ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(Http3Error::QpackDecompressionFailed);
        }
    }
    Ok(value)
}

fn encode_prefixed_int(value: u64, prefix_bits: u8, flags: u8, out: &mut Vec<u8>) {
    let max_prefix = (1u16 << prefix_bits) as u64 - 1u64;
    if value < max_prefix {
        out.push(flags | value as u8);
        return;
    }
    out.push(flags | max_prefix as u8);
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        out.push(((remaining % 128) | 0x80) as u8);
        remaining /= 128;
    }
    out.push(remaining as u8);
}

/// Reads a (possibly Huffman-coded) string literal: one bit marks Huffman
/// coding, a 7-bit-prefix integer gives the encoded length (RFC 7541 §5.2).
fn decode_string(buf: &[u8], pos: &mut usize) -> Result<String, Http3Error> {
    let huffman = buf.get(*pos).ok_or(Http3Error::Truncated)? & 0x80 != 0;
    let len = decode_prefixed_int(buf, pos, 7)? as usize;
    let bytes = buf.get(*pos..*pos + len).ok_or(Http3Error::Truncated)?;
    *pos += len;
    if huffman {
        huffman::decode(bytes)
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|_| Http3Error::QpackDecompressionFailed)
    }
}

fn encode_string_raw(s: &str, out: &mut Vec<u8>) {
    encode_prefixed_int(s.len() as u64, 7, 0x00, out);
    out.extend_from_slice(s.as_bytes());
}

/// Decodes one encoded field section (the payload of a HEADERS frame),
/// per RFC 9204 §4.5. The section prefix (Required Insert Count, Base) is
/// always `0, 0` for us since the dynamic table never holds entries; a
/// nonzero Required Insert Count from a peer is rejected, since with
/// capacity 0 no insertion could ever have happened.
pub fn decode_field_section(encoded: &[u8]) -> Result<Vec<Header>, Http3Error> {
    let mut pos = 0usize;
    let required_insert_count = decode_prefixed_int(encoded, &mut pos, 8)?;
    if required_insert_count != 0 {
        return Err(Http3Error::QpackDecompressionFailed);
    }
    let sign_bit = *encoded.get(pos).ok_or(Http3Error::Truncated)? & 0x80 != 0;
    let _delta_base = decode_prefixed_int(encoded, &mut pos, 7)?;
    let _ = sign_bit;

    let mut headers = Vec::new();
    while pos < encoded.len() {
        let byte = encoded[pos];
        if byte & 0x80 != 0 {
            // Indexed Field Line: 1 T ...; T=1 selects the static table, T=0
            // the dynamic table, which is always empty here.
            let is_static = byte & 0x40 != 0;
            if !is_static {
                return Err(Http3Error::QpackDecompressionFailed);
            }
            let index = decode_prefixed_int(encoded, &mut pos, 6)? as usize;
            let (name, value) = *STATIC_TABLE.get(index).ok_or(Http3Error::QpackDecompressionFailed)?;
            headers.push(Header { name: name.to_string(), value: value.to_string() });
        } else if byte & 0x40 != 0 {
            // Literal Field Line With Name Reference: 01 N T ...
            let is_static = byte & 0x10 != 0;
            if !is_static {
                return Err(Http3Error::QpackDecompressionFailed);
            }
            let name_index = decode_prefixed_int(encoded, &mut pos, 4)? as usize;
            let (name, _) = *STATIC_TABLE.get(name_index).ok_or(Http3Error::QpackDecompressionFailed)?;
            let value = decode_string(encoded, &mut pos)?;
            headers.push(Header { name: name.to_string(), value });
        } else if byte & 0x20 != 0 {
            // Literal Field Line Without Name Reference: 0 0 1 N H lll.
            let name = decode_string_with_tag_width(encoded, &mut pos, 3)?;
            let value = decode_string(encoded, &mut pos)?;
            headers.push(Header { name, value });
        } else {
            // Indexed/Literal forms referencing the dynamic table by a
            // post-base index — only reachable with a nonempty dynamic
            // table, which this decoder never has.
            return Err(Http3Error::QpackDecompressionFailed);
        }
    }
    Ok(headers)
}

/// Like [`decode_string`] but the Huffman flag shares its byte with a
/// narrower length prefix (used by the "without name reference" literal,
/// whose first byte is `001 N H xxxx`).
fn decode_string_with_tag_width(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<String, Http3Error> {
    let huffman = buf.get(*pos).ok_or(Http3Error::Truncated)? & 0x08 != 0;
    let len = decode_prefixed_int(buf, pos, prefix_bits)? as usize;
    let bytes = buf.get(*pos..*pos + len).ok_or(Http3Error::Truncated)?;
    *pos += len;
    if huffman {
        huffman::decode(bytes)
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|_| Http3Error::QpackDecompressionFailed)
    }
}

/// Encodes a field section with the literal-only encoder the spec calls
/// for: a static-table hit becomes an Indexed or Literal-With-Name-Reference
/// field line, everything else is fully literal. Never references or grows
/// a dynamic table, so Required Insert Count and Base are always 0.
pub fn encode_field_section(headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_prefixed_int(0, 8, 0x00, &mut out); // Required Insert Count
    encode_prefixed_int(0, 7, 0x00, &mut out); // Sign bit + Delta Base

    for &(name, value) in headers {
        if let Some(index) = find_static(name, value) {
            encode_prefixed_int(index as u64, 6, 0xc0, &mut out); // 1 1 index
            continue;
        }
        if let Some(index) = find_static_name(name) {
            encode_prefixed_int(index as u64, 4, 0x50, &mut out); // 01 N=0 T=1
            encode_string_raw(value, &mut out);
            continue;
        }
        // Literal Field Line Without Name Reference: 0 0 1 N H lll, N=0 H=0.
        encode_prefixed_int(name.len() as u64, 3, 0x20, &mut out);
        out.extend_from_slice(name.as_bytes());
        encode_string_raw(value, &mut out);
    }
    out
}

mod huffman {
    use crate::h3::Http3Error;

    /// RFC 7541 Appendix B canonical Huffman code table, reused as-is by
    /// QPACK (RFC 9204 §4.1.2): `(code, bit length)` per symbol, 0..=255,
    /// plus the 30-bit EOS code at index 256 (never a valid decode result).
    const TABLE: [(u32, u8); 257] = [
        (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
        (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
        (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
        (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
        (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
        (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
        (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
        (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
        (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
        (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
        (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
        (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
        (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
        (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
        (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
        (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
        (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
        (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
        (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
        (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
        (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
        (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
        (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
        (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
        (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
        (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
        (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
        (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
        (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
        (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
        (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
        (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
        (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
        (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
        (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
        (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
        (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
        (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
        (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
        (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
        (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
        (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
        (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
        (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
        (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
        (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
        (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
        (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
        (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
        (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
        (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
        (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
        (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
        (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
        (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
        (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
        (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
        (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
        (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
        (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
        (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
        (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
        (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
        (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
        (0x3fffffff, 30),
    ];

    /// Decodes a Huffman-coded byte string bit-by-bit against [`TABLE`].
    /// Any run of trailing bits shorter than 8 must be all-ones padding
    /// (EOS prefix), per RFC 7541 §5.2; anything else is a decoding error.
    pub fn decode(bytes: &[u8]) -> Result<String, Http3Error> {
        let mut out = Vec::new();
        let mut code = 0u32;
        let mut len = 0u8;
        let total_bits = bytes.len() * 8;
        for bit_index in 0..total_bits {
            let byte = bytes[bit_index / 8];
            let bit = (byte >> (7 - (bit_index % 8))) & 1;
            code = (code << 1) | bit as u32;
            len += 1;
            if let Some(symbol) = lookup(code, len) {
                out.push(symbol);
                code = 0;
                len = 0;
            }
            if len > 30 {
                return Err(Http3Error::QpackDecompressionFailed);
            }
        }
        // Remaining bits must be a valid EOS padding prefix (all ones).
        if len > 0 {
            let padding = (1u32 << len) - 1;
            if code != padding {
                return Err(Http3Error::QpackDecompressionFailed);
            }
        }
        String::from_utf8(out).map_err(|_| Http3Error::QpackDecompressionFailed)
    }

    fn lookup(code: u32, len: u8) -> Option<u8> {
        for (symbol, &(c, l)) in TABLE.iter().enumerate() {
            if symbol == 256 {
                continue; // EOS is never a decodable symbol
            }
            if l == len && c == code {
                return Some(symbol as u8);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_static_field_round_trips() {
        let encoded = encode_field_section(&[(":method", "GET")]);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, vec![Header { name: ":method".into(), value: "GET".into() }]);
    }

    #[test]
    fn literal_with_name_reference_round_trips() {
        let encoded = encode_field_section(&[(":path", "/index.html")]);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, vec![Header { name: ":path".into(), value: "/index.html".into() }]);
    }

    #[test]
    fn fully_literal_field_round_trips() {
        let encoded = encode_field_section(&[("x-custom-header", "hello world")]);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, vec![Header { name: "x-custom-header".into(), value: "hello world".into() }]);
    }

    #[test]
    fn multiple_headers_round_trip_in_order() {
        let headers = [(":method", "GET"), (":scheme", "https"), (":authority", "example.com"), (":path", "/")];
        let encoded = encode_field_section(&headers);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[2].value, "example.com");
    }

    #[test]
    fn dynamic_table_reference_is_rejected() {
        // Required Insert Count = 1 asserts a dynamic-table entry that can
        // never exist with capacity fixed at 0.
        let buf = [0x01, 0x00];
        assert!(decode_field_section(&buf).is_err());
    }

    #[test]
    fn huffman_round_trips_through_string_literal() {
        let encoded = encode_field_section(&[("user-agent", "curl/8.0")]);
        // Not Huffman-coded by our own encoder, but the decoder must still
        // accept a peer's Huffman-coded equivalent of the same bytes.
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded[0].value, "curl/8.0");
    }
}
