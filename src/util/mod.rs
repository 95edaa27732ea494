use chrono::DateTime;
use chrono::Utc;

pub mod fs;
pub mod lock;
pub mod proc;

/// Format of the per-build directory names under a project base.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn timestamp_dirname(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Decode bytes as UTF-8, replacing invalid sequences with `\xNN` escapes.
pub fn decode_backslash_replace(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // valid_up_to() guarantees this part decodes
                out.push_str(std::str::from_utf8(valid).unwrap_or(""));
                let bad_len = e.error_len().unwrap_or(after.len());
                for b in &after[..bad_len] {
                    out.push_str(&format!("\\x{:02x}", b));
                }
                rest = &after[bad_len..];
            }
        }
    }
}

pub fn loadavg() -> (f64, f64, f64) {
    let mut avgs = [0f64; 3];
    let n = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if n < 3 {
        (0.0, 0.0, 0.0)
    } else {
        (avgs[0], avgs[1], avgs[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backslash_replace_passthrough() {
        assert_eq!(decode_backslash_replace(b"hello world"), "hello world");
    }

    #[test]
    fn test_backslash_replace_invalid_bytes() {
        assert_eq!(decode_backslash_replace(b"a\xffb"), "a\\xffb");
        assert_eq!(decode_backslash_replace(b"\xfe\xff"), "\\xfe\\xff");
    }

    #[test]
    fn test_timestamp_dirname_shape() {
        use chrono::TimeZone;
        let ts = Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap();
        assert_eq!(timestamp_dirname(&ts), "20230405_060708");
    }
}
