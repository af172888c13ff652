//! Header-description accumulator.
//!
//! Every decoded layer appends one token, producing trails such as
//! `eth:vlan:mpls:ipv4:gre:ipv4:tcp`. The buffer is bounded; once it
//! overflows, further tokens are dropped and the overrun is reported so the
//! flow can be tagged.

use std::fmt;

/// Maximum rendered length of a header description.
pub const HDR_DESC_LEN: usize = 128;

#[derive(Debug, Default, Clone)]
pub struct HdrDesc {
    buf: String,
    /// Number of recorded headers.
    count: u16,
    overrun: bool,
}

impl HdrDesc {
    pub fn new() -> Self {
        HdrDesc {
            buf: String::with_capacity(HDR_DESC_LEN),
            count: 0,
            overrun: false,
        }
    }

    /// Appends one layer token; returns `false` on overrun.
    pub fn push(&mut self, token: &str) -> bool {
        self.push_repeated(token, 1)
    }

    /// Appends a token repeated `reps` times, rendered as `token{reps}`
    /// (VLAN and MPLS stacks).
    pub fn push_repeated(&mut self, token: &str, reps: usize) -> bool {
        if self.overrun {
            return false;
        }
        let sep = usize::from(!self.buf.is_empty());
        let suffix_len = if reps > 1 { 2 + reps.to_string().len() } else { 0 };
        if self.buf.len() + sep + token.len() + suffix_len > HDR_DESC_LEN {
            self.overrun = true;
            return false;
        }
        if sep == 1 {
            self.buf.push(':');
        }
        self.buf.push_str(token);
        if reps > 1 {
            self.buf.push_str(&format!("{{{}}}", reps));
        }
        self.count += reps as u16;
        true
    }

    /// Number of decoded headers.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Returns `true` once a token did not fit.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

impl fmt::Display for HdrDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_colon_separated() {
        let mut desc = HdrDesc::new();
        desc.push("eth");
        desc.push("ipv4");
        desc.push("tcp");
        assert_eq!(desc.as_str(), "eth:ipv4:tcp");
        assert_eq!(desc.count(), 3);
    }

    #[test]
    fn repeated_tokens_render_once_with_count() {
        let mut desc = HdrDesc::new();
        desc.push("eth");
        desc.push_repeated("vlan", 3);
        assert_eq!(desc.as_str(), "eth:vlan{3}");
        assert_eq!(desc.count(), 4);
    }

    #[test]
    fn overrun_is_sticky() {
        let mut desc = HdrDesc::new();
        let long = "x".repeat(HDR_DESC_LEN - 2);
        assert!(desc.push(&long));
        assert!(!desc.push("ipv4"));
        assert!(desc.overrun());
        assert!(!desc.push("y"));
        assert_eq!(desc.as_str(), long);
    }
}
