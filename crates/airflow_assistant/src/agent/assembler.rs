/// Answer returned when a run finished without the model emitting any text.
pub const NO_TEXT_SENTINEL: &str = "No textual content was produced.";

const SEPARATOR: &str = "\n";

/// Collects the model's text output across all turns of a run.
#[derive(Debug, Default, Clone)]
pub struct ResponseAssembler {
    segments: Vec<String>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one text block. Blank segments are dropped.
    pub fn push(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.segments.push(text);
        }
    }

    pub fn has_text(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Joins all segments in emission order, or the sentinel if none.
    pub fn join(&self) -> String {
        if self.segments.is_empty() {
            NO_TEXT_SENTINEL.to_string()
        } else {
            self.segments.join(SEPARATOR)
        }
    }
}
