use encoding_rs::SHIFT_JIS;
use thiserror::Error;

/// Errors from the TSC byte cipher.
#[derive(Debug, Error)]
pub enum TscError {
    #[error("cipher key midpoint {midpoint} lies outside the {len}-byte buffer")]
    KeyOutOfBounds { midpoint: usize, len: usize },
}

// Byte-boundary patterns a text-compatible file must show at its midpoint,
// so the engine's midpoint probe lands on a line break instead of dialogue.
const MIDPOINT_CRLF_HASH: &[u8] = b"\r\n#";
const MIDPOINT_CRLF_DASH: &[u8] = b"\r\n-";
const MIDPOINT_PAD_CRLF: &[u8] = b"  \r\n";

/// Decode an obscured TSC file into script text.
///
/// The cipher key is the byte stored at the file midpoint; every other byte
/// is shifted down by it, and the midpoint itself decodes to the key value.
/// The result is interpreted as Shift-JIS with replacement (never fails on
/// malformed sequences), double-NUL sentinels become CRLF pairs, and a CRLF
/// pair is prepended.
pub fn decode_tsc(raw: &[u8]) -> Result<String, TscError> {
    let midpoint = raw.len() / 2;
    if raw.is_empty() {
        return Err(TscError::KeyOutOfBounds {
            midpoint,
            len: raw.len(),
        });
    }

    let key = raw[midpoint];
    let mut plain = Vec::with_capacity(raw.len());
    for (i, &b) in raw.iter().enumerate() {
        plain.push(if i == midpoint { key } else { b.wrapping_sub(key) });
    }

    let (text, _, _) = SHIFT_JIS.decode(&plain);

    let mut out = String::with_capacity(text.len() + 2);
    out.push_str("\r\n");
    out.push_str(&text.trim_start().replace("\u{0}\u{0}", "\r\n"));
    Ok(out)
}

/// Re-encode script text into TSC bytes.
///
/// In `compat` mode the buffer is padded until a recognized line-break
/// pattern sits at the midpoint, and a zero key byte is inserted there, so
/// the output doubles as plain text (a zero key makes the additive cipher
/// the identity). Otherwise the byte already at the midpoint is taken as
/// the key and every other byte is shifted up by it.
pub fn encode_tsc(text: &str, compat: bool) -> Vec<u8> {
    // Replacement characters would otherwise encode as numeric character
    // references; the engine expects a plain substitute byte.
    let cleaned;
    let text = if text.contains('\u{FFFD}') {
        cleaned = text.replace('\u{FFFD}', "?");
        cleaned.as_str()
    } else {
        text
    };

    let (encoded, _, _) = SHIFT_JIS.encode(text);
    let encoded = encoded.into_owned();
    if encoded.is_empty() {
        return encoded;
    }

    if compat {
        let mut b = Vec::with_capacity(encoded.len() + 16);
        b.extend_from_slice(b"\r\n");
        b.extend_from_slice(&encoded);

        let mut mp = b.len() / 2;
        while !(b[mp..].starts_with(MIDPOINT_CRLF_HASH)
            || b[mp..].starts_with(MIDPOINT_CRLF_DASH)
            || b[mp..].starts_with(MIDPOINT_PAD_CRLF))
        {
            // Two-byte pad chunks shift the midpoint back through the text
            // one byte per round until it lands on a boundary.
            b.insert(0, b' ');
            b.insert(0, b' ');
            mp = b.len() / 2;
        }

        // Store the zero key at the midpoint; the single leading space keeps
        // the length parity so the key ends up exactly at len/2.
        b.insert(mp, 0);
        b.insert(0, b' ');
        b
    } else {
        let mut b = encoded;
        let mp = b.len() / 2;
        let key = b[mp];
        for (i, byte) in b.iter_mut().enumerate() {
            if i != mp {
                *byte = byte.wrapping_add(key);
            }
        }
        b
    }
}
