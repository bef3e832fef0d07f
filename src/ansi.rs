//! ANSI escape sequence decoding for log ingestion.
//!
//! This module converts ANSI-colored process output into structured
//! [`TextSegment`]s so downstream renderers never see raw control bytes.
//! The 16 base colors stay palette indices for theme-aware rendering;
//! 256-color and 24-bit codes are resolved to absolute RGB here.

use crate::logs::{SegmentColor, TextAttrs, TextSegment};

/// Decoder state carried across lines of one stream, so a color that was
/// opened on an earlier line keeps applying until the program resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnsiState {
    fg: Option<SegmentColor>,
    bg: Option<SegmentColor>,
    attrs: TextAttrs,
}

impl Default for AnsiState {
    fn default() -> Self {
        Self {
            fg: None,
            bg: None,
            attrs: TextAttrs::empty(),
        }
    }
}

/// Decodes one line of output into styled segments.
///
/// SGR sequences update `state`; OSC and other non-SGR escapes are
/// stripped. A carriage return discards everything before it on the line,
/// which collapses progress-bar style output to its final frame.
pub fn ansi_segments(text: &str, state: &mut AnsiState) -> Vec<TextSegment> {
    let mut segments: Vec<TextSegment> = Vec::new();
    let mut buffer = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if matches!(chars.peek(), Some('[')) {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                while let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        final_byte = Some(c);
                        chars.next();
                        break;
                    }
                    params.push(c);
                    chars.next();
                }
                if final_byte == Some('m') {
                    flush_segment(&mut segments, &mut buffer, state);
                    apply_sgr(state, &params);
                }
                continue;
            }
            if matches!(chars.peek(), Some(']')) {
                // OSC sequence: skip until BEL or ESC \
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && matches!(chars.peek(), Some('\\')) {
                        chars.next();
                        break;
                    }
                }
                continue;
            }
            // Unknown escape: drop the ESC byte to avoid leaking control bytes.
            continue;
        }
        if ch == '\r' {
            // Carriage return: overwrite line from start. Keep only what follows.
            flush_segment(&mut segments, &mut buffer, state);
            segments.clear();
            continue;
        }
        buffer.push(ch);
    }
    flush_segment(&mut segments, &mut buffer, state);
    segments
}

fn flush_segment(segments: &mut Vec<TextSegment>, buffer: &mut String, state: &AnsiState) {
    if buffer.is_empty() {
        return;
    }
    segments.push(TextSegment {
        text: std::mem::take(buffer),
        fg: state.fg,
        bg: state.bg,
        attrs: state.attrs,
    });
}

fn apply_sgr(state: &mut AnsiState, params: &str) {
    let values = parse_params(params);
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            0 => {
                *state = AnsiState::default();
                i += 1;
            }
            1 => {
                state.attrs.insert(TextAttrs::BOLD);
                i += 1;
            }
            2 => {
                state.attrs.insert(TextAttrs::DIM);
                i += 1;
            }
            3 => {
                state.attrs.insert(TextAttrs::ITALIC);
                i += 1;
            }
            4 => {
                state.attrs.insert(TextAttrs::UNDERLINE);
                i += 1;
            }
            5 | 6 => {
                state.attrs.insert(TextAttrs::BLINK);
                i += 1;
            }
            7 => {
                state.attrs.insert(TextAttrs::INVERSE);
                i += 1;
            }
            9 => {
                state.attrs.insert(TextAttrs::STRIKETHROUGH);
                i += 1;
            }
            22 => {
                state.attrs.remove(TextAttrs::BOLD | TextAttrs::DIM);
                i += 1;
            }
            23 => {
                state.attrs.remove(TextAttrs::ITALIC);
                i += 1;
            }
            24 => {
                state.attrs.remove(TextAttrs::UNDERLINE);
                i += 1;
            }
            25 => {
                state.attrs.remove(TextAttrs::BLINK);
                i += 1;
            }
            27 => {
                state.attrs.remove(TextAttrs::INVERSE);
                i += 1;
            }
            29 => {
                state.attrs.remove(TextAttrs::STRIKETHROUGH);
                i += 1;
            }
            30..=37 => {
                state.fg = basic_color(values[i] - 30, false);
                i += 1;
            }
            90..=97 => {
                state.fg = basic_color(values[i] - 90, true);
                i += 1;
            }
            40..=47 => {
                state.bg = basic_color(values[i] - 40, false);
                i += 1;
            }
            100..=107 => {
                state.bg = basic_color(values[i] - 100, true);
                i += 1;
            }
            39 => {
                state.fg = None;
                i += 1;
            }
            49 => {
                state.bg = None;
                i += 1;
            }
            38 | 48 => {
                let is_fg = values[i] == 38;
                if let Some((advance, color)) = parse_extended_color(&values[i + 1..]) {
                    if is_fg {
                        state.fg = Some(color);
                    } else {
                        state.bg = Some(color);
                    }
                    i += 1 + advance;
                } else {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }
    }
}

fn parse_params(params: &str) -> Vec<i32> {
    if params.is_empty() {
        return vec![0];
    }
    let mut values = Vec::new();
    for part in params.split(';') {
        if part.is_empty() {
            values.push(0);
        } else if let Ok(value) = part.parse::<i32>() {
            values.push(value);
        }
    }
    if values.is_empty() {
        values.push(0);
    }
    values
}

fn parse_extended_color(values: &[i32]) -> Option<(usize, SegmentColor)> {
    if values.is_empty() {
        return None;
    }
    match values[0] {
        5 => {
            let index = u8::try_from(*values.get(1)?).ok()?;
            Some((2, indexed_color(index)))
        }
        2 => {
            let r = u8::try_from(*values.get(1)?).ok()?;
            let g = u8::try_from(*values.get(2)?).ok()?;
            let b = u8::try_from(*values.get(3)?).ok()?;
            Some((4, SegmentColor::Rgb(r, g, b)))
        }
        _ => None,
    }
}

/// Resolves an 8-bit color index: 0-15 stay palette entries, 16-231 is the
/// 6x6x6 cube, 232-255 the grayscale ramp.
fn indexed_color(index: u8) -> SegmentColor {
    match index {
        0..=15 => SegmentColor::Palette(index),
        16..=231 => {
            let value = index - 16;
            let r = cube_channel(value / 36);
            let g = cube_channel((value % 36) / 6);
            let b = cube_channel(value % 6);
            SegmentColor::Rgb(r, g, b)
        }
        232..=255 => {
            let gray = 8 + (index - 232) * 10;
            SegmentColor::Rgb(gray, gray, gray)
        }
    }
}

fn cube_channel(step: u8) -> u8 {
    if step == 0 {
        0
    } else {
        55 + step * 40
    }
}

fn basic_color(index: i32, bright: bool) -> Option<SegmentColor> {
    let index = u8::try_from(index).ok()?;
    if index > 7 {
        return None;
    }
    Some(SegmentColor::Palette(if bright { index + 8 } else { index }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Vec<TextSegment> {
        let mut state = AnsiState::default();
        ansi_segments(text, &mut state)
    }

    #[test]
    fn plain_text_is_one_unstyled_segment() {
        let segments = decode("hello");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello");
        assert_eq!(segments[0].fg, None);
        assert!(segments[0].attrs.is_empty());
    }

    #[test]
    fn basic_colors_stay_palette_indices() {
        let segments = decode("\u{1b}[31mred\u{1b}[0m plain");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "red");
        assert_eq!(segments[0].fg, Some(SegmentColor::Palette(1)));
        assert_eq!(segments[1].fg, None);
    }

    #[test]
    fn bright_and_background_colors_map_to_upper_palette() {
        let segments = decode("\u{1b}[92;104mx");
        assert_eq!(segments[0].fg, Some(SegmentColor::Palette(10)));
        assert_eq!(segments[0].bg, Some(SegmentColor::Palette(12)));
    }

    #[test]
    fn extended_index_below_sixteen_stays_symbolic() {
        let segments = decode("\u{1b}[38;5;9mx");
        assert_eq!(segments[0].fg, Some(SegmentColor::Palette(9)));
    }

    #[test]
    fn color_cube_resolves_to_rgb() {
        // 196 = 16 + 36*5 -> pure red in the 6x6x6 cube
        let segments = decode("\u{1b}[38;5;196mx");
        assert_eq!(segments[0].fg, Some(SegmentColor::Rgb(255, 0, 0)));
    }

    #[test]
    fn grayscale_ramp_resolves_to_rgb() {
        let segments = decode("\u{1b}[48;5;240mx");
        assert_eq!(segments[0].bg, Some(SegmentColor::Rgb(88, 88, 88)));
    }

    #[test]
    fn truecolor_passes_through() {
        let segments = decode("\u{1b}[38;2;1;2;3mx");
        assert_eq!(segments[0].fg, Some(SegmentColor::Rgb(1, 2, 3)));
    }

    #[test]
    fn attributes_accumulate_and_reset_individually() {
        let segments = decode("\u{1b}[1;3mboth\u{1b}[23mbold only\u{1b}[22mnone");
        assert_eq!(
            segments[0].attrs,
            TextAttrs::BOLD | TextAttrs::ITALIC
        );
        assert_eq!(segments[1].attrs, TextAttrs::BOLD);
        assert!(segments[2].attrs.is_empty());
    }

    #[test]
    fn default_color_codes_reset_only_their_side() {
        let segments = decode("\u{1b}[31;41mx\u{1b}[39my\u{1b}[49mz");
        assert_eq!(segments[0].fg, Some(SegmentColor::Palette(1)));
        assert_eq!(segments[1].fg, None);
        assert_eq!(segments[1].bg, Some(SegmentColor::Palette(1)));
        assert_eq!(segments[2].bg, None);
    }

    #[test]
    fn state_carries_across_lines() {
        let mut state = AnsiState::default();
        let first = ansi_segments("\u{1b}[32mgreen starts", &mut state);
        assert_eq!(first[0].fg, Some(SegmentColor::Palette(2)));
        let second = ansi_segments("still green\u{1b}[0m done", &mut state);
        assert_eq!(second[0].fg, Some(SegmentColor::Palette(2)));
        assert_eq!(second[1].fg, None);
    }

    #[test]
    fn osc_sequences_are_skipped() {
        let segments = decode("hi\u{1b}]0;title\u{7}there");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hithere");
    }

    #[test]
    fn carriage_return_keeps_final_frame() {
        let segments = decode("12%\r100%");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "100%");
    }

    #[test]
    fn parse_params_defaults_to_reset() {
        assert_eq!(parse_params(""), vec![0]);
        assert_eq!(parse_params(";"), vec![0, 0]);
        assert_eq!(parse_params("1;"), vec![1, 0]);
    }

    #[test]
    fn malformed_extended_color_is_ignored() {
        let segments = decode("\u{1b}[38;9mx");
        assert_eq!(segments[0].fg, None);
        assert!(parse_extended_color(&[9]).is_none());
    }
}
