//! In-memory terminal emulation used to decide what to keep as history.
//!
//! The emulator renders the raw output stream into a [`Screen`] and, after
//! each chunk, asks whether the screen is worth recording as a
//! [`TerminalFrame`]. Full-screen redraws make logging every byte useless, so
//! capture is gated on:
//!
//! 1. near-duplicate suppression against the last frame,
//! 2. banner/logo redraw suppression,
//! 3. a minimum interval between captures,
//! 4. kind-specific significance from the [`FrameClassifier`].
//!
//! The first clean banner + prompt screen bypasses all of this once.

pub mod classifier;
pub mod parser;
pub mod screen;

pub use classifier::{CliHeuristics, FrameClassifier, HeuristicThresholds, ScreenView};
pub use parser::AnsiParser;
pub use screen::{Attributes, Cell, Color, Cursor, Screen};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// What a captured screen represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Input,
    Output,
    Prompt,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Input => "input",
            FrameKind::Output => "output",
            FrameKind::Prompt => "prompt",
        }
    }
}

/// A recorded screen snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalFrame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: FrameKind,
    pub lines: Vec<String>,
    pub cursor: Cursor,
}

impl TerminalFrame {
    pub fn view(&self) -> ScreenView<'_> {
        ScreenView::new(&self.lines, self.cursor)
    }

    /// Screen text with trailing blank rows dropped.
    pub fn text(&self) -> String {
        let end = self
            .lines
            .iter()
            .rposition(|l| !l.is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        self.lines[..end].join("\n")
    }
}

/// Generic capture gates, independent of any CLI dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturePolicy {
    pub min_interval: Duration,
    /// Share of identical non-blank lines at or above which a screen counts
    /// as a duplicate of the last frame.
    pub duplicate_ratio: f64,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            duplicate_ratio: 0.9,
        }
    }
}

/// Virtual terminal with significant-frame extraction.
pub struct TerminalEmulator {
    screen: Screen,
    parser: AnsiParser,
    classifier: Box<dyn FrameClassifier>,
    policy: CapturePolicy,
    last_frame: Option<TerminalFrame>,
    last_capture: Option<Instant>,
    anchored: bool,
    next_seq: u64,
}

impl TerminalEmulator {
    /// Emulator with the default CLI heuristics.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_classifier(
            cols,
            rows,
            Box::new(CliHeuristics::default()),
            CapturePolicy::default(),
        )
    }

    pub fn with_classifier(
        cols: u16,
        rows: u16,
        classifier: Box<dyn FrameClassifier>,
        policy: CapturePolicy,
    ) -> Self {
        Self {
            screen: Screen::new(cols, rows),
            parser: AnsiParser::new(),
            classifier,
            policy,
            last_frame: None,
            last_capture: None,
            anchored: false,
            next_seq: 1,
        }
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn last_frame(&self) -> Option<&TerminalFrame> {
        self.last_frame.as_ref()
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.screen.resize(cols, rows);
    }

    pub fn feed(&mut self, text: &str) -> Option<TerminalFrame> {
        self.feed_at(text, Instant::now())
    }

    /// Apply a chunk of output and return a frame if the resulting screen is
    /// significant. `now` drives the rate limit.
    pub fn feed_at(&mut self, text: &str, now: Instant) -> Option<TerminalFrame> {
        self.parser.feed_str(text, &mut self.screen);

        let lines = self.screen.lines();
        let cursor = self.screen.cursor();
        let view = ScreenView::new(&lines, cursor);
        let kind = self.classifier.classify(&view);

        if !self.anchored && self.classifier.is_anchor(&view) {
            self.anchored = true;
            return Some(self.capture(kind, lines, cursor, now));
        }

        if let Some(last) = &self.last_frame {
            if line_similarity(&last.lines, &lines) >= self.policy.duplicate_ratio {
                return None;
            }
        }
        if self.classifier.is_banner(&view) {
            return None;
        }
        if let Some(at) = self.last_capture {
            if now.saturating_duration_since(at) < self.policy.min_interval {
                return None;
            }
        }
        if !self
            .classifier
            .is_significant(kind, &view, self.last_frame.as_ref())
        {
            return None;
        }

        Some(self.capture(kind, lines, cursor, now))
    }

    fn capture(
        &mut self,
        kind: FrameKind,
        lines: Vec<String>,
        cursor: Cursor,
        now: Instant,
    ) -> TerminalFrame {
        let frame = TerminalFrame {
            seq: self.next_seq,
            timestamp: Utc::now(),
            kind,
            lines,
            cursor,
        };
        self.next_seq += 1;
        self.last_capture = Some(now);
        self.last_frame = Some(frame.clone());
        frame
    }
}

/// Share of identical lines among rows where either side has text.
/// Two blank screens are identical.
fn line_similarity(a: &[String], b: &[String]) -> f64 {
    let rows = a.len().max(b.len());
    let mut considered = 0usize;
    let mut same = 0usize;
    for i in 0..rows {
        let x = a.get(i).map(String::as_str).unwrap_or("");
        let y = b.get(i).map(String::as_str).unwrap_or("");
        if x.is_empty() && y.is_empty() {
            continue;
        }
        considered += 1;
        if x == y {
            same += 1;
        }
    }
    if considered == 0 {
        1.0
    } else {
        same as f64 / considered as f64
    }
}
