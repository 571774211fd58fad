//! Terminal-control sanitisation of model output.
//!
//! Replies are rendered verbatim by a terminal client, so ANSI escape
//! sequences and stray control characters must never reach it. CSI
//! sequences are removed first; the remaining pass drops every C0 control
//! except `\n`, `\t` and `\r`, and every C1 control. Because the second
//! pass removes all ESC bytes, no new CSI sequence can surface and the
//! whole transform is idempotent.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ANSI_CSI: Regex =
        Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("CSI pattern is valid");
}

/// Strip ANSI CSI sequences and control characters from `input`.
pub fn sanitize(input: &str) -> String {
    let without_csi = ANSI_CSI.replace_all(input, "");
    without_csi.chars().filter(|&c| is_allowed(c)).collect()
}

fn is_allowed(c: char) -> bool {
    match c {
        '\n' | '\t' | '\r' => true,
        c if (c as u32) < 0x20 => false,
        c if (0x80..=0x9f).contains(&(c as u32)) => false,
        _ => true,
    }
}
