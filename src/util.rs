use std::{ascii, env, fs};

/// Renders wire bytes for logs, escaping anything non-printable.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}

/// Best-effort name of this machine, as reported to the server in HELLO.
pub(crate) fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
