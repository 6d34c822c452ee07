//! Small shared helpers used by the rendering and collaborator modules.

/// Browser-style agent string; bgp.tools rejects obvious bot agents.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Text field helpers for the line-oriented output.
pub mod format {
    /// Left-justifies `text` in a field at least `width` columns wide.
    pub fn pad_right(text: &str, width: usize) -> String {
        format!("{text:<width$}")
    }

    /// Centers `text` in a `width`-column field; odd padding goes right.
    pub fn center(text: &str, width: usize) -> String {
        let len = text.chars().count();
        if len >= width {
            return text.to_string();
        }
        let left = (width - len) / 2;
        let right = width - len - left;
        format!("{}{}{}", " ".repeat(left), text, " ".repeat(right))
    }
}
