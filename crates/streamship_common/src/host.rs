//! Local hostname lookup, used to populate the `host` static label on
//! records from both the file tailer and the container log source.

use std::sync::OnceLock;

static HOSTNAME: OnceLock<String> = OnceLock::new();

pub fn hostname() -> &'static str {
    HOSTNAME.get_or_init(|| {
        let mut buf = vec![0u8; 256];
        // SAFETY: `buf` is a valid, writable buffer of `buf.len()` bytes;
        // `gethostname` writes at most that many bytes and nul-terminates.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc != 0 {
            return "unknown".to_string();
        }
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..nul]).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty_and_stable() {
        let first = hostname();
        let second = hostname();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
