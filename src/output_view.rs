use serde_json::Value;
use tracing::debug;

/// Scrollable text buffer for run output.
///
/// Scroll position is the index of the first visible line. When the view is
/// pinned to the bottom before new content arrives it stays pinned; otherwise
/// the position is kept (clamped to the new content).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputView {
  text: String,
  line_count: usize,
  offset: usize,
  viewport: usize,
}

impl OutputView {
  pub fn new(viewport: usize) -> Self {
    Self { viewport: viewport.max(1), ..Self::default() }
  }

  pub fn text(&self) -> &str {
    &self.text
  }

  pub fn offset(&self) -> usize {
    self.offset
  }

  pub fn viewport(&self) -> usize {
    self.viewport
  }

  pub fn line_count(&self) -> usize {
    self.line_count
  }

  fn max_offset(&self) -> usize {
    self.line_count.saturating_sub(self.viewport)
  }

  pub fn is_at_bottom(&self) -> bool {
    self.offset >= self.max_offset()
  }

  pub fn set_content(&mut self, text: &str) {
    if text == self.text {
      return;
    }
    let pinned = self.is_at_bottom();
    self.text = text.to_owned();
    self.line_count = self.text.lines().count();
    self.offset = if pinned { self.max_offset() } else { self.offset.min(self.max_offset()) };
  }

  pub fn set_viewport(&mut self, viewport: usize) {
    let pinned = self.is_at_bottom();
    self.viewport = viewport.max(1);
    self.offset = if pinned { self.max_offset() } else { self.offset.min(self.max_offset()) };
  }

  pub fn scroll_up(&mut self, lines: usize) {
    self.offset = self.offset.saturating_sub(lines);
  }

  pub fn scroll_down(&mut self, lines: usize) {
    self.offset = self.offset.saturating_add(lines).min(self.max_offset());
  }

  pub fn scroll_to_bottom(&mut self) {
    self.offset = self.max_offset();
  }

  pub fn clear(&mut self) {
    self.text.clear();
    self.line_count = 0;
    self.offset = 0;
  }

  pub fn visible_lines(&self) -> impl Iterator<Item = &str> {
    self.text.lines().skip(self.offset).take(self.viewport)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedPayload {
  Json(String),
  Raw(String),
}

impl RenderedPayload {
  pub fn into_text(self) -> String {
    match self {
      RenderedPayload::Json(text) | RenderedPayload::Raw(text) => text,
    }
  }
}

/// Pretty-prints payloads that are JSON documents and leaves everything else
/// as raw text, including JSON-looking text that fails to parse.
pub fn render_payload(raw: &str) -> RenderedPayload {
  let trimmed = raw.trim();
  if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
    return RenderedPayload::Raw(raw.to_owned());
  }
  match serde_json::from_str::<Value>(trimmed).and_then(|v| serde_json::to_string_pretty(&v)) {
    Ok(pretty) => RenderedPayload::Json(pretty),
    Err(e) => {
      debug!("payload is not valid JSON, rendering raw: {}", e);
      RenderedPayload::Raw(raw.to_owned())
    }
  }
}
