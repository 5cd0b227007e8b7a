//! Confirmation and numbered-selection reply parsing.
//!
//! While `waiting_for` is a confirmation tag the next reply is strictly
//! yes/no/unclear. Numbered lists are 1-based; out-of-range or non-numeric
//! replies are unclear, never a silent default.

/// Strict three-way reading of a confirmation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmReply {
    Yes,
    No,
    Unclear,
}

impl ConfirmReply {
    pub fn parse(text: &str) -> ConfirmReply {
        match text.trim().to_lowercase().as_str() {
            "yes" | "y" | "yep" | "yeah" | "confirm" | "send" | "send it" | "ok" | "okay"
            | "sure" | "go" | "do it" => Self::Yes,
            "no" | "n" | "nope" | "cancel" | "stop" | "nevermind" | "never mind" | "don't"
            | "dont" => Self::No,
            _ => Self::Unclear,
        }
    }
}

/// Parse a 1-based pick from a numbered list of `len` entries.
/// Returns the 0-based index, or `None` for anything out of range.
pub fn parse_selection(text: &str, len: usize) -> Option<usize> {
    let n: usize = text.trim().parse().ok()?;
    if n >= 1 && n <= len { Some(n - 1) } else { None }
}

/// Parse a multi-pick reply like "1 3" or "1,3" against `len` options.
/// "none" (or "0") means no option works. Any out-of-range number makes
/// the whole reply unclear.
pub fn parse_multi_selection(text: &str, len: usize) -> Option<Vec<u32>> {
    let trimmed = text.trim().to_lowercase();
    if trimmed == "none" || trimmed == "0" || trimmed.starts_with("none ") {
        return Some(Vec::new());
    }
    let mut picks = Vec::new();
    for part in trimmed.split([' ', ',']).filter(|p| !p.is_empty()) {
        let n: usize = part.parse().ok()?;
        if n < 1 || n > len {
            return None;
        }
        let idx = (n - 1) as u32;
        if !picks.contains(&idx) {
            picks.push(idx);
        }
    }
    if picks.is_empty() { None } else { Some(picks) }
}
