use std::sync::atomic::{AtomicU64, Ordering};

static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";

/// Synthesize a tool call id for vendors that do not send one.
#[inline]
pub(crate) fn next_call_id() -> String {
    let id = CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(21);
    out.push_str("call_");
    push_u64_hex_16(&mut out, id);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `needle`.
///
/// Streaming scanners hold this many trailing bytes back because the next
/// chunk may complete the needle.
#[inline]
pub(crate) fn partial_suffix_len(text: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&len| text[text.len() - len..] == needle[..len])
        .unwrap_or(0)
}

/// Split `bytes` into the longest valid UTF-8 prefix and an incomplete tail.
///
/// Invalid sequences that cannot be completed by more input are replaced
/// lossily so a corrupt byte never stalls the stream.
pub(crate) fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let out = text.to_owned();
            pending.clear();
            out
        }
        Err(err) => {
            let valid = err.valid_up_to();
            if err.error_len().is_some() {
                let out = String::from_utf8_lossy(pending).into_owned();
                pending.clear();
                return out;
            }
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
    }
}
