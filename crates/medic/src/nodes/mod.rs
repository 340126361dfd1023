//! The repair graph nodes: analysis → planning → execution →
//! verification, looping under the iteration budget until `finish`.
//!
//! Each node takes `(&GraphContext, &mut GraphState)`, mutates the
//! state, records history, and sets `current_node`. Unrecoverable
//! errors bubble to the graph driver, which turns them into a failed
//! terminal state.

pub mod analysis;
pub mod execution;
pub mod finish;
pub mod planning;
pub mod verification;

use sha1::{Digest, Sha1};

/// Stable fingerprint of a failure output: the first error-looking line
/// (or the first non-empty line), hashed.
#[must_use]
pub fn error_fingerprint(output: &str) -> String {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| {
            let lowered = l.to_lowercase();
            lowered.contains("error")
                || lowered.contains("fail")
                || lowered.contains("panic")
                || lowered.contains("exception")
        })
        .or_else(|| output.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("");

    let mut hasher = Sha1::new();
    hasher.update(line.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_keys_on_error_line() {
        let a = error_fingerprint("compiling...\nError: boom\nmore output");
        let b = error_fingerprint("different preamble\nError: boom");
        assert_eq!(a, b);

        let c = error_fingerprint("Error: other boom");
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_of_empty_output() {
        assert_eq!(error_fingerprint(""), error_fingerprint("\n\n"));
    }
}
