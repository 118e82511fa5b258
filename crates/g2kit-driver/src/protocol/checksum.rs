//! Send-side line checksums
//!
//! Newer g2core firmware accepts an optional `;*<xor>` trailer on G-code
//! lines. Integrity is send-only: the device validates what we append, but
//! inbound frames carry no checksum to verify.

/// XOR checksum over the line's bytes, as the device computes it.
pub fn xor_checksum(line: &str) -> u8 {
    line.bytes().fold(0, |acc, b| acc ^ b)
}

/// Append the checksum trailer to a line (no trailing newline expected).
pub fn frame_with_checksum(line: &str) -> String {
    format!("{};*{}", line, xor_checksum(line))
}
