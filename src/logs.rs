//! Structured log storage for supervised tools.
//!
//! Decoded output lines live in a per-tool `LogBuffer`, a fixed-capacity
//! ring that counts evictions so consumers holding global line numbers can
//! translate them into the live window or detect that they fell off.

use std::collections::VecDeque;

use bitflags::bitflags;

bitflags! {
    /// Text attributes carried by a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextAttrs: u8 {
        const BOLD = 1 << 0;
        const DIM = 1 << 1;
        const ITALIC = 1 << 2;
        const UNDERLINE = 1 << 3;
        const BLINK = 1 << 4;
        const INVERSE = 1 << 5;
        const STRIKETHROUGH = 1 << 6;
    }
}

/// Foreground or background color of a segment.
///
/// The 16 base colors stay symbolic so the UI can map them through its
/// theme; everything wider (256-color cube, grayscale ramp, 24-bit) is
/// resolved to absolute RGB at ingestion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentColor {
    /// Index into the 16-color theme palette (0-7 normal, 8-15 bright).
    Palette(u8),
    /// Absolute 24-bit color.
    Rgb(u8, u8, u8),
}

/// A run of text with uniform styling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub fg: Option<SegmentColor>,
    pub bg: Option<SegmentColor>,
    pub attrs: TextAttrs,
}

impl TextSegment {
    /// A segment with default styling.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fg: None,
            bg: None,
            attrs: TextAttrs::empty(),
        }
    }
}

/// A single line of output from a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Styled runs, in display order.
    pub segments: Vec<TextSegment>,
    /// Whether the line arrived on stderr.
    pub is_stderr: bool,
}

impl LogLine {
    pub fn plain(text: impl Into<String>, is_stderr: bool) -> Self {
        Self {
            segments: vec![TextSegment::plain(text)],
            is_stderr,
        }
    }

    /// The line's text with styling dropped.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

/// A fixed-capacity ring buffer of `LogLine`s with eviction accounting.
///
/// `trim_count() + len()` always equals the total number of lines ever
/// appended, so `trim_count() + i` is the stable global number of the line
/// at buffer offset `i`.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
    trim_count: u64,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            trim_count: 0,
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if old lines were evicted to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut trimmed = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.trim_count += 1;
            trimmed = true;
        }
        trimmed
    }

    /// Removes every line. The removed lines count as trimmed so global
    /// line numbering keeps advancing monotonically.
    pub fn clear(&mut self) {
        self.trim_count += self.lines.len() as u64;
        self.lines.clear();
    }

    /// Lines evicted (or cleared) since creation.
    pub fn trim_count(&self) -> u64 {
        self.trim_count
    }

    /// Global number the next appended line will get.
    pub fn next_line_number(&self) -> u64 {
        self.trim_count + self.lines.len() as u64
    }

    /// Looks a line up by its global number; `None` once it was trimmed
    /// away or if it has not been appended yet.
    pub fn get_global(&self, number: u64) -> Option<&LogLine> {
        let offset = number.checked_sub(self.trim_count)?;
        self.lines.get(usize::try_from(offset).ok()?)
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns an iterator over the lines in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}
