//! Inline live-region display driver.
//!
//! The renderer hands over a complete frame on every update; this driver
//! owns the difference against what is already on screen. Unchanged rows
//! are skipped, changed rows are cleared and rewritten, leftover rows are
//! erased, and the cursor is parked on the first row below the region so
//! ordinary output can scroll past it with [`LiveDisplay::print_above`].
//!
//! On a dumb terminal the live region is disabled entirely and only
//! scroll-through printing remains.

use std::io::{self, Write};

use crossterm::{
    cursor::{MoveToNextLine, MoveToPreviousLine},
    queue,
    terminal::{Clear, ClearType},
};

use crate::styled::Line;

/// Minimal-diff driver for a live region at the bottom of the scrollback.
#[derive(Debug)]
pub struct LiveDisplay<W: Write> {
    out: W,
    /// ANSI-rendered rows currently on screen, top to bottom.
    drawn: Vec<String>,
    /// `false` degrades to append-only output (dumb terminal).
    enabled: bool,
}

impl<W: Write> LiveDisplay<W> {
    /// Create a driver writing to `out`.
    pub fn new(out: W, enabled: bool) -> Self {
        Self { out, drawn: Vec::new(), enabled }
    }

    /// Whether the live region is active.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Rows currently drawn (rendered form). Exposed for tests.
    #[must_use]
    pub fn drawn(&self) -> &[String] {
        &self.drawn
    }

    /// Replace the live region with `lines`.
    pub fn update(&mut self, lines: &[Line]) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let next: Vec<String> = lines.iter().map(Line::to_ansi).collect();
        if next == self.drawn {
            return Ok(());
        }

        if !self.drawn.is_empty() {
            queue!(self.out, MoveToPreviousLine(self.drawn.len() as u16))?;
        }

        for (row, text) in next.iter().enumerate() {
            if row < self.drawn.len() {
                // Existing screen row: rewrite only when it changed.
                if self.drawn[row] != *text {
                    queue!(self.out, Clear(ClearType::CurrentLine))?;
                    self.out.write_all(text.as_bytes())?;
                }
                queue!(self.out, MoveToNextLine(1))?;
            } else {
                // Fresh row: a hard newline allocates it by scrolling.
                queue!(self.out, Clear(ClearType::CurrentLine))?;
                self.out.write_all(text.as_bytes())?;
                self.out.write_all(b"\r\n")?;
            }
        }

        // Erase rows the new frame no longer covers, then park the cursor
        // just below the region again.
        if next.len() < self.drawn.len() {
            let stale = self.drawn.len() - next.len();
            for _ in 0..stale {
                queue!(self.out, Clear(ClearType::CurrentLine), MoveToNextLine(1))?;
            }
            queue!(self.out, MoveToPreviousLine(stale as u16))?;
        }

        self.drawn = next;
        self.out.flush()
    }

    /// Erase the live region.
    pub fn clear(&mut self) -> io::Result<()> {
        self.update(&[])
    }

    /// Write a line into the scrollback above the region.
    ///
    /// The region is erased first; the next [`LiveDisplay::update`]
    /// repaints it below the printed line.
    pub fn print_above(&mut self, line: &Line) -> io::Result<()> {
        self.clear()?;
        self.out.write_all(line.to_ansi().as_bytes())?;
        self.out.write_all(if self.enabled { b"\r\n" } else { b"\n" })?;
        self.out.flush()
    }

    /// Access the underlying writer (prompt echo, final flushes).
    pub fn writer(&mut self) -> &mut W {
        &mut self.out
    }

    /// Read-only view of the underlying writer. Exposed for tests.
    #[must_use]
    pub fn writer_ref(&self) -> &W {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styled::Line;

    fn lines(texts: &[&str]) -> Vec<Line> {
        texts.iter().map(|t| Line::plain(*t)).collect()
    }

    #[test]
    fn update_tracks_drawn_rows() {
        let mut display = LiveDisplay::new(Vec::new(), true);
        display.update(&lines(&["one", "two"])).unwrap();
        assert_eq!(display.drawn(), ["one", "two"]);

        display.update(&lines(&["one"])).unwrap();
        assert_eq!(display.drawn(), ["one"]);

        display.clear().unwrap();
        assert!(display.drawn().is_empty());
    }

    #[test]
    fn unchanged_frame_writes_nothing() {
        let mut display = LiveDisplay::new(Vec::new(), true);
        display.update(&lines(&["same"])).unwrap();
        let before = display.writer().len();
        display.update(&lines(&["same"])).unwrap();
        assert_eq!(display.writer().len(), before);
    }

    #[test]
    fn disabled_region_is_inert() {
        let mut display = LiveDisplay::new(Vec::new(), false);
        display.update(&lines(&["ignored"])).unwrap();
        assert!(display.drawn().is_empty());
        assert!(display.writer().is_empty());
    }

    #[test]
    fn print_above_scrolls_through() {
        let mut display = LiveDisplay::new(Vec::new(), true);
        display.update(&lines(&["region"])).unwrap();
        display.print_above(&Line::plain("scrolled")).unwrap();
        assert!(display.drawn().is_empty());
        let written = String::from_utf8(display.writer().clone()).unwrap();
        assert!(written.contains("scrolled"));
    }
}
