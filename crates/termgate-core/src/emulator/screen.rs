//! Screen model: a fixed grid of styled cells plus cursor state.

use serde::{Deserialize, Serialize};

/// Tab stops every 8 columns.
const TAB_WIDTH: u16 = 8;

/// Cell color. Only the 16-color palette is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
}

/// Pen state applied to newly written cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

/// One character cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Cell {
    pub fn blank() -> Self {
        Self::styled(' ', &Attributes::default())
    }

    pub fn styled(ch: char, attrs: &Attributes) -> Self {
        Self {
            ch,
            fg: attrs.fg,
            bg: attrs.bg,
            bold: attrs.bold,
            italic: attrs.italic,
            underline: attrs.underline,
        }
    }

    pub fn is_blank(&self) -> bool {
        *self == Cell::blank()
    }
}

/// Zero-based cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
}

/// The visible screen of a virtual terminal.
#[derive(Debug, Clone)]
pub struct Screen {
    cols: u16,
    rows: u16,
    cells: Vec<Vec<Cell>>,
    cursor: Cursor,
    saved: Option<(Cursor, Attributes)>,
    attrs: Attributes,
    /// Set after writing the last column; the next printable wraps first.
    wrap_pending: bool,
}

impl Screen {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            cells: vec![blank_row(cols); rows as usize],
            cursor: Cursor::default(),
            saved: None,
            attrs: Attributes::default(),
            wrap_pending: false,
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn attributes(&self) -> Attributes {
        self.attrs
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attrs
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.cells
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
    }

    /// Visible text, one string per row, trailing spaces removed.
    pub fn lines(&self) -> Vec<String> {
        self.cells
            .iter()
            .map(|row| {
                let s: String = row.iter().map(|c| c.ch).collect();
                s.trim_end().to_string()
            })
            .collect()
    }

    /// Resize the grid, keeping content anchored at the top-left.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        for row in &mut self.cells {
            row.resize(cols as usize, Cell::blank());
        }
        self.cells.resize(rows as usize, blank_row(cols));
        self.cols = cols;
        self.rows = rows;
        self.cursor.row = self.cursor.row.min(rows - 1);
        self.cursor.col = self.cursor.col.min(cols - 1);
        self.wrap_pending = false;
    }

    pub fn put_char(&mut self, ch: char) {
        if self.wrap_pending {
            self.carriage_return();
            self.linefeed();
        }
        let Cursor { row, col } = self.cursor;
        self.cells[row as usize][col as usize] = Cell::styled(ch, &self.attrs);
        if col + 1 >= self.cols {
            self.wrap_pending = true;
        } else {
            self.cursor.col += 1;
        }
    }

    pub fn carriage_return(&mut self) {
        self.cursor.col = 0;
        self.wrap_pending = false;
    }

    pub fn linefeed(&mut self) {
        if self.cursor.row + 1 >= self.rows {
            self.scroll_up();
        } else {
            self.cursor.row += 1;
        }
        self.wrap_pending = false;
    }

    pub fn backspace(&mut self) {
        self.cursor.col = self.cursor.col.saturating_sub(1);
        self.wrap_pending = false;
    }

    pub fn horizontal_tab(&mut self) {
        let next = (self.cursor.col / TAB_WIDTH + 1) * TAB_WIDTH;
        self.cursor.col = next.min(self.cols - 1);
    }

    /// Drop the top row and open a blank one at the bottom.
    pub fn scroll_up(&mut self) {
        self.cells.remove(0);
        self.cells.push(blank_row(self.cols));
    }

    pub fn cursor_up(&mut self, n: u16) {
        self.cursor.row = self.cursor.row.saturating_sub(n.max(1));
        self.wrap_pending = false;
    }

    pub fn cursor_down(&mut self, n: u16) {
        self.cursor.row = (self.cursor.row.saturating_add(n.max(1))).min(self.rows - 1);
        self.wrap_pending = false;
    }

    pub fn cursor_forward(&mut self, n: u16) {
        self.cursor.col = (self.cursor.col.saturating_add(n.max(1))).min(self.cols - 1);
        self.wrap_pending = false;
    }

    pub fn cursor_backward(&mut self, n: u16) {
        self.cursor.col = self.cursor.col.saturating_sub(n.max(1));
        self.wrap_pending = false;
    }

    /// Move to a one-based `(row, col)`, clamped to the grid.
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        self.cursor.row = row.max(1).min(self.rows) - 1;
        self.cursor.col = col.max(1).min(self.cols) - 1;
        self.wrap_pending = false;
    }

    /// `ED`: 0 = cursor to end, 1 = start to cursor, 2 = whole screen.
    pub fn erase_in_display(&mut self, mode: u16) {
        let row = self.cursor.row as usize;
        match mode {
            0 => {
                self.erase_in_line(0);
                for r in &mut self.cells[row + 1..] {
                    r.fill(Cell::blank());
                }
            }
            1 => {
                for r in &mut self.cells[..row] {
                    r.fill(Cell::blank());
                }
                self.erase_in_line(1);
            }
            2 => {
                for r in &mut self.cells {
                    r.fill(Cell::blank());
                }
            }
            _ => {}
        }
    }

    /// `EL`: 0 = cursor to end of line, 1 = start to cursor, 2 = whole line.
    pub fn erase_in_line(&mut self, mode: u16) {
        let col = self.cursor.col as usize;
        let line = &mut self.cells[self.cursor.row as usize];
        match mode {
            0 => line[col..].fill(Cell::blank()),
            1 => line[..=col].fill(Cell::blank()),
            2 => line.fill(Cell::blank()),
            _ => {}
        }
    }

    pub fn save_cursor(&mut self) {
        self.saved = Some((self.cursor, self.attrs));
    }

    pub fn restore_cursor(&mut self) {
        if let Some((cursor, attrs)) = self.saved {
            self.cursor.row = cursor.row.min(self.rows - 1);
            self.cursor.col = cursor.col.min(self.cols - 1);
            self.attrs = attrs;
        }
        self.wrap_pending = false;
    }
}

fn blank_row(cols: u16) -> Vec<Cell> {
    vec![Cell::blank(); cols as usize]
}
