//! Frame classification and significance heuristics.
//!
//! The emulator core stays protocol-general; everything that depends on a
//! particular CLI's prompt, banner and output conventions lives behind
//! [`FrameClassifier`].

use super::screen::Cursor;
use super::{FrameKind, TerminalFrame};
use regex::Regex;
use std::sync::LazyLock;

/// Read-only view of a screen handed to a classifier.
#[derive(Debug, Clone, Copy)]
pub struct ScreenView<'a> {
    pub lines: &'a [String],
    pub cursor: Cursor,
}

impl<'a> ScreenView<'a> {
    pub fn new(lines: &'a [String], cursor: Cursor) -> Self {
        Self { lines, cursor }
    }

    /// Text of the row the cursor sits on.
    pub fn cursor_line(&self) -> &'a str {
        self.lines
            .get(self.cursor.row as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn non_blank(&self) -> impl Iterator<Item = &'a str> {
        self.lines.iter().map(String::as_str).filter(|l| !l.trim().is_empty())
    }
}

/// Strategy deciding what a screen state is and whether it is worth keeping.
pub trait FrameClassifier: Send + Sync {
    fn classify(&self, view: &ScreenView<'_>) -> FrameKind;

    /// A logo/banner redraw that should not be recorded.
    fn is_banner(&self, view: &ScreenView<'_>) -> bool;

    /// The clean banner + prompt screen used to anchor history once.
    fn is_anchor(&self, view: &ScreenView<'_>) -> bool;

    /// Kind-specific significance against the previous captured frame.
    fn is_significant(
        &self,
        kind: FrameKind,
        view: &ScreenView<'_>,
        previous: Option<&TerminalFrame>,
    ) -> bool;
}

/// Tunables for [`CliHeuristics`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicThresholds {
    /// Output frames need at least this many key/value or tabular lines.
    pub min_structured_lines: usize,
    /// Input frames need the command to grow by more than this many chars
    /// (unless it gained a space or slash).
    pub min_input_growth: usize,
    /// Banner detection: this many art lines make a banner.
    pub min_banner_lines: usize,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            min_structured_lines: 3,
            min_input_growth: 1,
            min_banner_lines: 3,
        }
    }
}

/// Heuristics tuned for network appliance CLIs (`host #`, `router>`,
/// `[admin@box] >`, `user@host:~$`).
pub struct CliHeuristics {
    thresholds: HeuristicThresholds,
}

static PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-@~:/\[\]]+(?: \([A-Za-z0-9_.\-]+\))? ?[>#$%])(?: (.*))?$")
        .expect("prompt pattern is valid")
});

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[A-Za-z][\w .\-/()]{0,40}?\s*[:=]\s*\S").expect("key/value pattern is valid")
});

static COLUMN_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S\s{2,}\S").expect("column pattern is valid"));

const ART_CHARS: &str = "_-=*#|/\\+.:'`~<>()[]{}^@%$&";

impl CliHeuristics {
    pub fn new(thresholds: HeuristicThresholds) -> Self {
        Self { thresholds }
    }

    /// Split a line into `(prompt, command)` if it looks like a prompt.
    pub fn split_prompt<'l>(&self, line: &'l str) -> Option<(&'l str, &'l str)> {
        let line = line.trim_end();
        let caps = PROMPT.captures(line)?;
        let prompt = caps.get(1)?.as_str();
        let command = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        Some((prompt, command))
    }

    fn command_of<'l>(&self, view: &ScreenView<'l>) -> &'l str {
        self.split_prompt(view.cursor_line())
            .map(|(_, cmd)| cmd)
            .unwrap_or("")
    }

    fn is_structured(&self, line: &str) -> bool {
        if KEY_VALUE.is_match(line) {
            return true;
        }
        // three or more columns separated by runs of spaces
        COLUMN_GAP.find_iter(line).count() >= 2
    }

    fn is_art_line(line: &str) -> bool {
        let glyphs: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
        if glyphs.len() < 4 {
            return false;
        }
        let art: Vec<char> = glyphs.iter().copied().filter(|c| ART_CHARS.contains(*c)).collect();
        let mut distinct = art.clone();
        distinct.sort_unstable();
        distinct.dedup();
        art.len() * 10 >= glyphs.len() * 6 && distinct.len() >= 2
    }
}

impl Default for CliHeuristics {
    fn default() -> Self {
        Self::new(HeuristicThresholds::default())
    }
}

impl FrameClassifier for CliHeuristics {
    fn classify(&self, view: &ScreenView<'_>) -> FrameKind {
        match self.split_prompt(view.cursor_line()) {
            Some((_, "")) => FrameKind::Prompt,
            Some(_) => FrameKind::Input,
            None => FrameKind::Output,
        }
    }

    fn is_banner(&self, view: &ScreenView<'_>) -> bool {
        view.non_blank().filter(|l| Self::is_art_line(l)).count()
            >= self.thresholds.min_banner_lines
    }

    fn is_anchor(&self, view: &ScreenView<'_>) -> bool {
        self.is_banner(view) && self.classify(view) == FrameKind::Prompt
    }

    fn is_significant(
        &self,
        kind: FrameKind,
        view: &ScreenView<'_>,
        previous: Option<&TerminalFrame>,
    ) -> bool {
        match kind {
            FrameKind::Input => {
                let current = self.command_of(view);
                let before = previous
                    .filter(|p| p.kind == FrameKind::Input)
                    .map(|p| self.command_of(&p.view()))
                    .unwrap_or("");
                let grown = current.chars().count()
                    > before.chars().count() + self.thresholds.min_input_growth;
                let separators = |s: &str| s.chars().filter(|c| *c == ' ' || *c == '/').count();
                grown || separators(current) > separators(before)
            }
            FrameKind::Output => {
                view.non_blank().filter(|l| self.is_structured(l)).count()
                    >= self.thresholds.min_structured_lines
            }
            FrameKind::Prompt => match previous {
                None => true,
                Some(prev) => prev.view().cursor_line().trim_end() != view.cursor_line().trim_end(),
            },
        }
    }
}
