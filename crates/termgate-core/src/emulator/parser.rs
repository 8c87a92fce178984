//! ANSI control sequence parser.
//!
//! Handles C0 controls, a CSI subset (cursor movement, erase, SGR,
//! save/restore) and skips everything else. Malformed input is dropped
//! and the parser returns to ground state; it never fails.

use super::screen::{Color, Screen};

/// A CSI sequence with no final byte after this many characters is abandoned.
pub const CSI_LOOKAHEAD_LIMIT: usize = 20;

/// OSC strings (window titles and the like) are skipped up to this length.
const OSC_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Ground,
    Escape,
    /// `ESC (` / `ESC )`: one designator char follows.
    Charset,
    Csi,
    Osc,
    /// ESC seen inside an OSC string, expecting `\`.
    OscEscape,
}

/// Byte-stream state machine driving a [`Screen`].
#[derive(Debug, Default)]
pub struct AnsiParser {
    state: State,
    buf: String,
    osc_len: usize,
}

impl AnsiParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_str(&mut self, text: &str, screen: &mut Screen) {
        for ch in text.chars() {
            self.feed(ch, screen);
        }
    }

    pub fn feed(&mut self, ch: char, screen: &mut Screen) {
        // C0 controls act immediately, even mid-sequence (not inside OSC).
        if (ch as u32) < 0x20 && !matches!(self.state, State::Osc | State::OscEscape) {
            self.control(ch, screen);
            return;
        }

        match self.state {
            State::Ground => {
                if ch != '\x7f' {
                    screen.put_char(ch);
                }
            }
            State::Escape => self.escape(ch, screen),
            State::Charset => self.state = State::Ground,
            State::Csi => self.csi(ch, screen),
            State::Osc => {
                self.osc_len += 1;
                if ch == '\x1b' {
                    self.state = State::OscEscape;
                } else if ch == '\x07' || self.osc_len > OSC_LIMIT {
                    self.state = State::Ground;
                }
            }
            State::OscEscape => {
                // ST ends the string; anything else restarts as a new escape.
                self.state = State::Ground;
                if ch != '\\' {
                    self.state = State::Escape;
                    self.escape(ch, screen);
                }
            }
        }
    }

    fn control(&mut self, ch: char, screen: &mut Screen) {
        match ch {
            '\x1b' => {
                self.state = State::Escape;
                self.buf.clear();
            }
            '\r' => screen.carriage_return(),
            '\n' | '\x0b' | '\x0c' => screen.linefeed(),
            '\x08' => screen.backspace(),
            '\t' => screen.horizontal_tab(),
            // BEL, SO/SI and the rest are ignored
            _ => {}
        }
    }

    fn escape(&mut self, ch: char, screen: &mut Screen) {
        self.state = State::Ground;
        match ch {
            '[' => {
                self.buf.clear();
                self.state = State::Csi;
            }
            ']' => {
                self.osc_len = 0;
                self.state = State::Osc;
            }
            '(' | ')' => self.state = State::Charset,
            '7' => screen.save_cursor(),
            '8' => screen.restore_cursor(),
            _ => {}
        }
    }

    fn csi(&mut self, ch: char, screen: &mut Screen) {
        match ch {
            '\x40'..='\x7e' => {
                self.state = State::Ground;
                let params = std::mem::take(&mut self.buf);
                dispatch_csi(&params, ch, screen);
            }
            '\x20'..='\x3f' => {
                self.buf.push(ch);
                if self.buf.len() > CSI_LOOKAHEAD_LIMIT {
                    self.buf.clear();
                    self.state = State::Ground;
                }
            }
            _ => {
                self.buf.clear();
                self.state = State::Ground;
            }
        }
    }
}

fn dispatch_csi(params: &str, final_byte: char, screen: &mut Screen) {
    // Private modes (`?25h`, `?1049h`, ...) and intermediates fail to parse
    // and are dropped here.
    let Some(args) = parse_params(params) else {
        return;
    };
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);

    match final_byte {
        'A' => screen.cursor_up(arg(0)),
        'B' => screen.cursor_down(arg(0)),
        'C' => screen.cursor_forward(arg(0)),
        'D' => screen.cursor_backward(arg(0)),
        'H' | 'f' => screen.cursor_position(arg(0), arg(1)),
        'J' => screen.erase_in_display(arg(0)),
        'K' => screen.erase_in_line(arg(0)),
        'm' => select_graphic_rendition(&args, screen),
        's' => screen.save_cursor(),
        'u' => screen.restore_cursor(),
        _ => {}
    }
}

/// Parse `;`-separated numeric params. Empty fields read as 0.
fn parse_params(params: &str) -> Option<Vec<u16>> {
    if params.is_empty() {
        return Some(Vec::new());
    }
    params
        .split(';')
        .map(|p| {
            if p.is_empty() {
                Some(0)
            } else {
                p.parse::<u16>().ok()
            }
        })
        .collect()
}

fn select_graphic_rendition(args: &[u16], screen: &mut Screen) {
    if args.is_empty() {
        *screen.attributes_mut() = Default::default();
        return;
    }
    let attrs = screen.attributes_mut();
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            0 => *attrs = Default::default(),
            1 => attrs.bold = true,
            3 => attrs.italic = true,
            4 => attrs.underline = true,
            22 => attrs.bold = false,
            23 => attrs.italic = false,
            24 => attrs.underline = false,
            n @ 30..=37 => attrs.fg = Color::Indexed((n - 30) as u8),
            39 => attrs.fg = Color::Default,
            n @ 40..=47 => attrs.bg = Color::Indexed((n - 40) as u8),
            49 => attrs.bg = Color::Default,
            n @ 90..=97 => attrs.fg = Color::Indexed((n - 90 + 8) as u8),
            n @ 100..=107 => attrs.bg = Color::Indexed((n - 100 + 8) as u8),
            // Extended colors: skip `5;n` or `2;r;g;b`.
            38 | 48 => {
                i += match args.get(i + 1) {
                    Some(5) => 2,
                    Some(2) => 4,
                    _ => 0,
                };
            }
            _ => {}
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> Screen {
        let mut screen = Screen::new(80, 24);
        let mut parser = AnsiParser::new();
        parser.feed_str(input, &mut screen);
        screen
    }

    #[test]
    fn clear_home_then_text() {
        let screen = run("garbage\r\nmore\x1b[2J\x1b[1;1HOK");
        let lines = screen.lines();
        assert_eq!(lines[0], "OK");
        assert!(lines[1..].iter().all(|l| l.is_empty()));
        for row in 0..24 {
            for col in 0..80 {
                let cell = screen.cell(row, col).unwrap();
                match (row, col) {
                    (0, 0) => assert_eq!(cell.ch, 'O'),
                    (0, 1) => assert_eq!(cell.ch, 'K'),
                    _ => assert!(cell.is_blank(), "cell {row},{col} not blank"),
                }
            }
        }
    }

    #[test]
    fn relative_movement() {
        let screen = run("\x1b[5;5H\x1b[2A\x1b[3C\x1b[B\x1b[DX");
        assert_eq!(screen.cell(3, 6).unwrap().ch, 'X');
    }

    #[test]
    fn sgr_sets_and_resets_attributes() {
        let screen = run("\x1b[1;4;31;42mA\x1b[0mB\x1b[3mC\x1b[mD");
        let a = screen.cell(0, 0).unwrap();
        assert!(a.bold && a.underline && !a.italic);
        assert_eq!(a.fg, Color::Indexed(1));
        assert_eq!(a.bg, Color::Indexed(2));
        let b = screen.cell(0, 1).unwrap();
        assert!(!b.bold && b.fg == Color::Default);
        assert!(screen.cell(0, 2).unwrap().italic);
        assert!(!screen.cell(0, 3).unwrap().italic);
    }

    #[test]
    fn extended_colors_do_not_leak_into_styles() {
        let screen = run("\x1b[38;5;4mA");
        let a = screen.cell(0, 0).unwrap();
        // the `4` is a palette index here, not underline
        assert!(!a.underline);
    }

    #[test]
    fn save_and_restore_cursor() {
        let screen = run("\x1b[3;3H\x1b[sabc\x1b[uZ");
        assert_eq!(screen.lines()[2], "  Zbc");
        let screen = run("\x1b[2;2H\x1b7xy\x1b8Q");
        assert_eq!(screen.lines()[1], " Qy");
    }

    #[test]
    fn private_modes_are_ignored() {
        let screen = run("\x1b[?25l\x1b[?1049hhi\x1b[?25h");
        assert_eq!(screen.lines()[0], "hi");
    }

    #[test]
    fn overlong_sequence_is_abandoned() {
        let screen = run("\x1b[111111111111111111111111111111Hok");
        // the tail after the abandon point prints as text; no panic, cursor sane
        assert!(screen.lines()[0].ends_with("ok"));
    }

    #[test]
    fn truncated_sequence_at_end_is_harmless() {
        let mut screen = Screen::new(10, 2);
        let mut parser = AnsiParser::new();
        parser.feed_str("ab\x1b[3", &mut screen);
        parser.feed_str("1mc", &mut screen);
        assert_eq!(screen.lines()[0], "abc");
        assert_eq!(screen.cell(0, 2).unwrap().fg, Color::Indexed(1));
    }

    #[test]
    fn osc_title_is_skipped() {
        let screen = run("\x1b]0;router: admin\x07prompt#");
        assert_eq!(screen.lines()[0], "prompt#");
        let screen = run("\x1b]2;title\x1b\\x");
        assert_eq!(screen.lines()[0], "x");
    }

    #[test]
    fn invalid_params_discard_sequence() {
        let screen = run("\x1b[9999999999Hz");
        assert_eq!(screen.lines()[0], "z");
    }
}
