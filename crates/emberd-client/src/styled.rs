//! Styled line model and ANSI handling for the renderer.
//!
//! Layout composes frames out of [`Line`] values (runs of text with a
//! `crossterm` style). Log lines arriving from the daemon may already
//! carry ANSI escapes, so the module includes an SGR parser that turns
//! raw bytes back into spans; width math is display-column aware (CJK
//! and emoji count as two columns, escapes as zero).

use std::fmt::Write as _;

use crossterm::style::{Attribute, Color, ContentStyle};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Style with only a foreground color.
#[must_use]
pub fn fg(color: Color) -> ContentStyle {
    let mut style = ContentStyle::default();
    style.foreground_color = Some(color);
    style
}

/// Bold style with a foreground color.
#[must_use]
pub fn bold_fg(color: Color) -> ContentStyle {
    let mut style = fg(color);
    style.attributes.set(Attribute::Bold);
    style
}

/// Bold style with the default color.
#[must_use]
pub fn bold() -> ContentStyle {
    let mut style = ContentStyle::default();
    style.attributes.set(Attribute::Bold);
    style
}

/// A run of text rendered with one style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Text content, free of escape sequences.
    pub text: String,
    /// Rendering style.
    pub style: ContentStyle,
}

/// One display row: a sequence of styled spans.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
    spans: Vec<Span>,
}

impl Line {
    /// An empty line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A line of unstyled text.
    pub fn plain(text: impl Into<String>) -> Self {
        let mut line = Self::new();
        line.push(text, ContentStyle::default());
        line
    }

    /// A line of uniformly styled text.
    pub fn styled(text: impl Into<String>, style: ContentStyle) -> Self {
        let mut line = Self::new();
        line.push(text, style);
        line
    }

    /// Append a styled run, merging with the previous span when the style
    /// matches.
    pub fn push(&mut self, text: impl Into<String>, style: ContentStyle) -> &mut Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        if let Some(last) = self.spans.last_mut() {
            if last.style == style {
                last.text.push_str(&text);
                return self;
            }
        }
        self.spans.push(Span { text, style });
        self
    }

    /// The spans of this line.
    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Concatenated text without styling.
    #[must_use]
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    /// Display-column width of the line.
    #[must_use]
    pub fn width(&self) -> usize {
        self.spans.iter().map(|s| s.text.width()).sum()
    }

    /// Copy of the line cut to at most `cols` display columns.
    ///
    /// A wide character straddling the limit is dropped entirely.
    #[must_use]
    pub fn truncate(&self, cols: usize) -> Self {
        let mut out = Self::new();
        let mut used = 0;
        for span in &self.spans {
            if used >= cols {
                break;
            }
            let mut kept = String::new();
            for ch in span.text.chars() {
                let w = ch.width().unwrap_or(0);
                if used + w > cols {
                    break;
                }
                used += w;
                kept.push(ch);
            }
            let complete = kept.len() == span.text.len();
            out.push(kept, span.style);
            if !complete {
                break;
            }
        }
        out
    }

    /// Split into rows of at most `width` columns, also breaking at
    /// embedded newlines. `width == 0` disables column splitting.
    #[must_use]
    pub fn split_columns(&self, width: usize) -> Vec<Self> {
        let mut rows = Vec::new();
        let mut row = Self::new();
        let mut used = 0;

        for span in &self.spans {
            let mut run = String::new();
            for ch in span.text.chars() {
                if ch == '\n' {
                    row.push(std::mem::take(&mut run), span.style);
                    rows.push(std::mem::take(&mut row));
                    used = 0;
                    continue;
                }
                let w = ch.width().unwrap_or(0);
                if width > 0 && used + w > width && used > 0 {
                    row.push(std::mem::take(&mut run), span.style);
                    rows.push(std::mem::take(&mut row));
                    used = 0;
                }
                used += w;
                run.push(ch);
            }
            row.push(run, span.style);
        }
        if !row.spans.is_empty() || rows.is_empty() {
            rows.push(row);
        }
        rows
    }

    /// Render the line as an ANSI byte string.
    #[must_use]
    pub fn to_ansi(&self) -> String {
        let mut out = String::new();
        for span in &self.spans {
            if span.style == ContentStyle::default() {
                out.push_str(&span.text);
            } else {
                // StyledContent's Display emits the SGR codes and reset
                let _ = write!(out, "{}", span.style.apply(&span.text));
            }
        }
        out
    }

    /// Parse a string that may carry SGR escapes into a styled line.
    ///
    /// Unknown escape sequences are dropped; their bytes never reach the
    /// output.
    #[must_use]
    pub fn from_ansi(text: &str) -> Self {
        let mut parser = AnsiParser::new();
        let mut line = Self::new();
        let mut run = String::new();
        let mut style = ContentStyle::default();

        for ch in text.chars() {
            match parser.advance(ch) {
                Some(current) => {
                    if current != style && !run.is_empty() {
                        line.push(std::mem::take(&mut run), style);
                    }
                    style = current;
                    run.push(ch);
                },
                None => {},
            }
        }
        line.push(run, style);
        line
    }
}

/// Incremental SGR escape-sequence parser.
///
/// Feeds one character at a time; printable characters come back with the
/// style accumulated so far, escape bytes are swallowed.
#[derive(Debug, Default)]
struct AnsiParser {
    style: ContentStyle,
    escape: String,
    in_escape: bool,
}

const STANDARD_COLORS: [Color; 8] = [
    Color::Black,
    Color::DarkRed,
    Color::DarkGreen,
    Color::DarkYellow,
    Color::DarkBlue,
    Color::DarkMagenta,
    Color::DarkCyan,
    Color::Grey,
];

const BRIGHT_COLORS: [Color; 8] = [
    Color::DarkGrey,
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::White,
];

impl AnsiParser {
    fn new() -> Self {
        Self::default()
    }

    /// Feed one character. `Some(style)` means the character is printable
    /// under that style; `None` means it belongs to an escape sequence.
    fn advance(&mut self, ch: char) -> Option<ContentStyle> {
        if self.in_escape {
            self.escape.push(ch);
            if self.escape_complete() {
                self.apply_escape();
                self.escape.clear();
                self.in_escape = false;
            }
            None
        } else if ch == '\x1b' {
            self.in_escape = true;
            self.escape.clear();
            self.escape.push(ch);
            None
        } else {
            Some(self.style)
        }
    }

    fn escape_complete(&self) -> bool {
        if self.escape.len() < 2 {
            return false;
        }
        if self.escape.starts_with("\x1b[") {
            return self
                .escape
                .chars()
                .last()
                .is_some_and(|c| c.is_ascii_alphabetic())
                || self.escape.len() > 32;
        }
        if self.escape.starts_with("\x1b]") {
            return self.escape.ends_with('\x07') || self.escape.ends_with("\x1b\\");
        }
        // two-character escapes (ESC + single char)
        true
    }

    fn apply_escape(&mut self) {
        // Only CSI SGR sequences alter the style
        if !self.escape.starts_with("\x1b[") || !self.escape.ends_with('m') {
            return;
        }
        let params = &self.escape[2..self.escape.len() - 1];
        if params.is_empty() {
            self.style = ContentStyle::default();
            return;
        }

        let params: Vec<u8> = params.split(';').filter_map(|p| p.parse().ok()).collect();
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.style = ContentStyle::default(),
                1 => self.style.attributes.set(Attribute::Bold),
                2 => self.style.attributes.set(Attribute::Dim),
                3 => self.style.attributes.set(Attribute::Italic),
                4 => self.style.attributes.set(Attribute::Underlined),
                7 => self.style.attributes.set(Attribute::Reverse),
                22 => {
                    self.style.attributes.unset(Attribute::Bold);
                    self.style.attributes.unset(Attribute::Dim);
                },
                23 => self.style.attributes.unset(Attribute::Italic),
                24 => self.style.attributes.unset(Attribute::Underlined),
                27 => self.style.attributes.unset(Attribute::Reverse),
                30..=37 => {
                    self.style.foreground_color =
                        Some(STANDARD_COLORS[usize::from(params[i] - 30)]);
                },
                38 => i += self.extended_color(&params[i..], true),
                39 => self.style.foreground_color = None,
                40..=47 => {
                    self.style.background_color =
                        Some(STANDARD_COLORS[usize::from(params[i] - 40)]);
                },
                48 => i += self.extended_color(&params[i..], false),
                49 => self.style.background_color = None,
                90..=97 => {
                    self.style.foreground_color = Some(BRIGHT_COLORS[usize::from(params[i] - 90)]);
                },
                100..=107 => {
                    self.style.background_color =
                        Some(BRIGHT_COLORS[usize::from(params[i] - 100)]);
                },
                _ => {},
            }
            i += 1;
        }
    }

    /// Parse `38;5;n` / `38;2;r;g;b` forms; returns extra params consumed.
    fn extended_color(&mut self, params: &[u8], foreground: bool) -> usize {
        let (color, consumed) = match params.get(1) {
            Some(5) if params.len() >= 3 => (Some(Color::AnsiValue(params[2])), 2),
            Some(2) if params.len() >= 5 => {
                (Some(Color::Rgb { r: params[2], g: params[3], b: params[4] }), 4)
            },
            _ => (None, 0),
        };
        if let Some(color) = color {
            if foreground {
                self.style.foreground_color = Some(color);
            } else {
                self.style.background_color = Some(color);
            }
        }
        consumed
    }
}
