use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{Clear, ClearType},
};
use ocrd_browser_core::{PreviewImage, Tool};
use png::{BitDepth, ColorType, Encoder};
use thiserror::Error;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 4096;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, replacing the previous
    /// placement.
    pub fn draw(&mut self, image: &PreviewImage, params: DrawParams) -> Result<()> {
        let encoded = BASE64.encode(encode_png(image)?);
        let mut chunks = encoded.as_bytes().chunks(CHUNK_SIZE).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            self.writer.write_all(b";")?;
            self.writer.write_all(chunk)?;
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes every image this renderer placed.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn encode_png(image: &PreviewImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&image.pixels)?;
    writer.finish()?;
    Ok(buffer)
}

/// What the page list should do in response to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserCommand {
    GotoFirst,
    GoBack { count: usize },
    GoForward { count: usize },
    GotoLast,
    RefreshStale,
    LaunchTool { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Command(BrowserCommand),
    Redraw,
    Quit,
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortcutError {
    #[error("empty shortcut")]
    Empty,
    #[error("unknown modifier <{0}>")]
    UnknownModifier(String),
    #[error("unterminated modifier in {0:?}")]
    Unterminated(String),
    #[error("unknown key {0:?}")]
    UnknownKey(String),
}

/// A key chord in accelerator notation such as `<Ctrl>e`, `<Shift><Alt>x` or `F5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortcut {
    code: KeyCode,
    modifiers: KeyModifiers,
}

impl Shortcut {
    pub fn parse(text: &str) -> Result<Self, ShortcutError> {
        let mut rest = text.trim();
        if rest.is_empty() {
            return Err(ShortcutError::Empty);
        }
        let mut modifiers = KeyModifiers::NONE;
        while let Some(tail) = rest.strip_prefix('<') {
            let end = tail
                .find('>')
                .ok_or_else(|| ShortcutError::Unterminated(text.to_string()))?;
            modifiers |= match tail[..end].to_ascii_lowercase().as_str() {
                "ctrl" | "control" | "primary" => KeyModifiers::CONTROL,
                "shift" => KeyModifiers::SHIFT,
                "alt" | "mod1" => KeyModifiers::ALT,
                "super" => KeyModifiers::SUPER,
                other => return Err(ShortcutError::UnknownModifier(other.to_string())),
            };
            rest = &tail[end + 1..];
        }
        let code = parse_key(rest)?;
        let (code, modifiers) = normalize(code, modifiers);
        Ok(Self { code, modifiers })
    }

    pub fn matches(&self, code: KeyCode, modifiers: KeyModifiers) -> bool {
        (self.code, self.modifiers) == normalize(code, modifiers)
    }
}

fn parse_key(key: &str) -> Result<KeyCode, ShortcutError> {
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Ok(KeyCode::Char(c));
    }
    let code = match key.to_ascii_lowercase().as_str() {
        "return" | "enter" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "space" => KeyCode::Char(' '),
        "delete" => KeyCode::Delete,
        "backspace" => KeyCode::Backspace,
        "insert" => KeyCode::Insert,
        "home" => KeyCode::Home,
        "end" => KeyCode::End,
        "page_up" | "pageup" => KeyCode::PageUp,
        "page_down" | "pagedown" => KeyCode::PageDown,
        lower => match lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            Some(n) if (1..=24).contains(&n) => KeyCode::F(n),
            _ => return Err(ShortcutError::UnknownKey(key.to_string())),
        },
    };
    Ok(code)
}

/// Terminals report `<Shift>e` as `E` with or without the shift bit; fold both forms.
fn normalize(code: KeyCode, mut modifiers: KeyModifiers) -> (KeyCode, KeyModifiers) {
    match code {
        KeyCode::Char(c) if c.is_ascii_alphabetic() => {
            if c.is_ascii_uppercase() {
                modifiers |= KeyModifiers::SHIFT;
            }
            (KeyCode::Char(c.to_ascii_lowercase()), modifiers)
        }
        other => (other, modifiers),
    }
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    tool_shortcuts: Vec<(Shortcut, String)>,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the shortcut of every tool that has one. Unparsable shortcuts are
    /// logged and skipped.
    pub fn with_tools(tools: &[Tool]) -> Self {
        let mut mapper = Self::new();
        for tool in tools {
            let Some(text) = tool.shortcut.as_deref() else {
                continue;
            };
            match Shortcut::parse(text) {
                Ok(shortcut) => mapper.bind_tool(shortcut, &tool.name),
                Err(err) => warn!(tool = %tool.name, shortcut = text, %err, "ignoring shortcut"),
            }
        }
        mapper
    }

    pub fn bind_tool(&mut self, shortcut: Shortcut, tool_name: &str) {
        debug!(?shortcut, tool = tool_name, "binding tool shortcut");
        self.tool_shortcuts.retain(|(known, _)| *known != shortcut);
        self.tool_shortcuts.push((shortcut, tool_name.to_string()));
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code,
                modifiers,
                kind: KeyEventKind::Press | KeyEventKind::Repeat,
                ..
            }) => self.map_key(code, modifiers),
            Event::Resize(..) => UiEvent::Redraw,
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        if let Some((_, name)) = self
            .tool_shortcuts
            .iter()
            .find(|(shortcut, _)| shortcut.matches(code, modifiers))
        {
            let name = name.clone();
            self.reset_count();
            return UiEvent::Command(BrowserCommand::LaunchTool { name });
        }

        let plain = modifiers.is_empty() || modifiers == KeyModifiers::SHIFT;
        match code {
            KeyCode::Char(c) if plain && c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            KeyCode::Char('j') | KeyCode::Char('n') | KeyCode::Down if plain => {
                let count = self.take_count();
                UiEvent::Command(BrowserCommand::GoForward { count })
            }
            KeyCode::Char('k') | KeyCode::Char('p') | KeyCode::Up if plain => {
                let count = self.take_count();
                UiEvent::Command(BrowserCommand::GoBack { count })
            }
            KeyCode::Char('g') | KeyCode::Home if plain => {
                self.reset_count();
                UiEvent::Command(BrowserCommand::GotoFirst)
            }
            KeyCode::Char('G') | KeyCode::End if plain => {
                self.reset_count();
                UiEvent::Command(BrowserCommand::GotoLast)
            }
            KeyCode::Char('r') if plain => {
                self.reset_count();
                UiEvent::Command(BrowserCommand::RefreshStale)
            }
            KeyCode::Char('q') | KeyCode::Esc => {
                self.reset_count();
                UiEvent::Quit
            }
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

/// Shortens `text` to at most `width` characters by replacing its middle with `…`.
pub fn ellipsize_middle(text: &str, width: usize) -> String {
    let length = text.chars().count();
    if length <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let keep = width - 1;
    let head = keep - keep / 2;
    let tail = keep / 2;
    let mut out: String = text.chars().take(head).collect();
    out.push('…');
    out.extend(text.chars().skip(length - tail));
    out
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = PreviewImage::placeholder(1, [255, 0, 0, 255]);

        renderer.draw(&image, DrawParams::clamped(10, 5)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.starts_with("\u{1b}_Ga=T,f=100"));
        assert!(output.contains("c=10,r=5,s=1,v=1,m=0;"));
        assert!(output.ends_with("\u{1b}\\"));
    }

    #[test]
    fn kitty_draw_splits_large_payloads() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let mut image = PreviewImage::placeholder(64, [0, 0, 0, 255]);
        let mut state: u32 = 0x9e37_79b9;
        for byte in image.pixels.iter_mut() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *byte = state as u8;
        }

        renderer.draw(&image, DrawParams::clamped(0, 0)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.contains("c=1,r=1"));
        assert!(output.contains("m=1;"));
        assert!(output.contains("\u{1b}_Gm=0,q=2;"));
    }

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn event_mapper_uses_numeric_prefix_for_forward() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('1'))), UiEvent::None);
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('2'))), UiEvent::None);
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Command(BrowserCommand::GoForward { count: 12 })
        );
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_resets_prefix_after_use() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('3')));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('k'))),
            UiEvent::Command(BrowserCommand::GoBack { count: 3 })
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Up)),
            UiEvent::Command(BrowserCommand::GoBack { count: 1 })
        );
    }

    #[test]
    fn event_mapper_drops_prefix_on_other_command() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Home)),
            UiEvent::Command(BrowserCommand::GotoFirst)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('n'))),
            UiEvent::Command(BrowserCommand::GoForward { count: 1 })
        );
    }

    #[test]
    fn event_mapper_maps_ends_refresh_and_quit() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Command(BrowserCommand::GotoFirst)
        );
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(KeyCode::Char('G'), KeyModifiers::SHIFT)),
            UiEvent::Command(BrowserCommand::GotoLast)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::End)),
            UiEvent::Command(BrowserCommand::GotoLast)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('r'))),
            UiEvent::Command(BrowserCommand::RefreshStale)
        );
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('q'))), UiEvent::Quit);
        assert_eq!(mapper.map_event(Event::Resize(80, 24)), UiEvent::Redraw);
    }

    #[test]
    fn event_mapper_ignores_key_release() {
        let mut mapper = EventMapper::new();
        let release = Event::Key(KeyEvent {
            code: KeyCode::Char('j'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        });
        assert_eq!(mapper.map_event(release), UiEvent::None);
    }

    #[test]
    fn shortcut_parses_accelerator_notation() {
        let ctrl_e = Shortcut::parse("<Ctrl>e").unwrap();
        assert!(ctrl_e.matches(KeyCode::Char('e'), KeyModifiers::CONTROL));
        assert!(!ctrl_e.matches(KeyCode::Char('e'), KeyModifiers::NONE));

        let shift_x = Shortcut::parse("<Shift><Alt>x").unwrap();
        assert!(shift_x.matches(KeyCode::Char('X'), KeyModifiers::ALT));
        assert!(shift_x.matches(
            KeyCode::Char('X'),
            KeyModifiers::ALT | KeyModifiers::SHIFT
        ));

        assert!(Shortcut::parse("F5").unwrap().matches(KeyCode::F(5), KeyModifiers::NONE));
        assert!(Shortcut::parse("<Primary>Return")
            .unwrap()
            .matches(KeyCode::Enter, KeyModifiers::CONTROL));
    }

    #[test]
    fn shortcut_rejects_garbage() {
        assert_eq!(Shortcut::parse("  "), Err(ShortcutError::Empty));
        assert_eq!(
            Shortcut::parse("<Hyper>e"),
            Err(ShortcutError::UnknownModifier("hyper".into()))
        );
        assert!(matches!(
            Shortcut::parse("<Ctrl"),
            Err(ShortcutError::Unterminated(_))
        ));
        assert!(matches!(
            Shortcut::parse("<Ctrl>banana"),
            Err(ShortcutError::UnknownKey(_))
        ));
    }

    #[test]
    fn tool_shortcuts_take_precedence() {
        let tools = vec![
            Tool::new("Editor", "sh -c true", Some("<Ctrl>e".into())).unwrap(),
            Tool::new("Pager", "sh -c true", Some("j".into())).unwrap(),
            Tool::new("Broken", "sh -c true", Some("<Nope>x".into())).unwrap(),
            Tool::new("Plain", "sh -c true", None).unwrap(),
        ];
        let mut mapper = EventMapper::with_tools(&tools);

        assert_eq!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('e'),
                KeyModifiers::CONTROL
            )),
            UiEvent::Command(BrowserCommand::LaunchTool {
                name: "Editor".into()
            })
        );
        mapper.map_event(key_event(KeyCode::Char('5')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Command(BrowserCommand::LaunchTool {
                name: "Pager".into()
            })
        );
        assert!(mapper.pending_input().is_none());
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Down)),
            UiEvent::Command(BrowserCommand::GoForward { count: 1 })
        );
    }

    #[test]
    fn ellipsize_keeps_both_ends() {
        assert_eq!(ellipsize_middle("short", 10), "short");
        assert_eq!(ellipsize_middle("OCR-D-IMG/0001.tif", 9), "OCR-….tif");
        assert_eq!(ellipsize_middle("abcdef", 1), "…");
        assert_eq!(ellipsize_middle("abcdef", 0), "");
    }
}
