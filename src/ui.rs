use crate::client::BridgeClient;
use crate::config::SettingsStore;
use crate::protocol::{
    ChatEvent, ChatEventKind, ChatMessage, Command, FirstMessageItem, Reply, Role, ServerMessage,
};
use crate::repo_locator::find_url;
use crate::session::{Session, SessionRegistry};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;
const USER_QUERY_MARKER: &str = "[USER QUERY]\n\n";

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = io::stdout().flush();
    }
}

#[derive(Debug)]
enum UiEvent {
    Server(ServerMessage),
    CommandFailed {
        request_id: Option<String>,
        message: String,
    },
    Disconnected(String),
}

/// What the composer's text asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Message(String),
    Open(String),
    Model(String),
    Models,
    NewChat,
    Quit,
    Unknown(String),
}

fn parse_input(text: &str) -> Input {
    let trimmed = text.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(trimmed.to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match name {
        "open" if !arg.is_empty() => Input::Open(arg.to_string()),
        "model" if !arg.is_empty() => Input::Model(arg.to_string()),
        "models" => Input::Models,
        "new" => Input::NewChat,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(trimmed.to_string()),
    }
}

#[derive(Debug, Clone)]
struct StyledLine {
    text: String,
    style: Style,
}

impl StyledLine {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn header_style(color: Color) -> Style {
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn message_lines(message: &ChatMessage) -> Vec<StyledLine> {
    let (header, color) = match message.role {
        Role::User => ("You:", Color::Blue),
        Role::Assistant => ("Assistant:", Color::Yellow),
    };
    let body_style = Style::default().fg(color);
    let mut lines = vec![StyledLine::new(header, header_style(color))];
    for line in message.content.lines() {
        lines.push(StyledLine::new(format!("  {}", line), body_style));
    }
    lines
}

/// The user query embedded in a grounding message's instruction block.
fn grounding_query(items: &[FirstMessageItem]) -> Option<&str> {
    items.iter().rev().find_map(|item| match item {
        FirstMessageItem::Text { text } => text
            .find(USER_QUERY_MARKER)
            .map(|idx| &text[idx + USER_QUERY_MARKER.len()..]),
        FirstMessageItem::File { .. } => None,
    })
}

/// The grounding message, with its files collapsed to their paths.
fn grounding_lines(items: &[FirstMessageItem]) -> Vec<StyledLine> {
    let paths: Vec<&str> = items
        .iter()
        .filter_map(|item| match item {
            FirstMessageItem::File { file_path, .. } => Some(file_path.as_str()),
            FirstMessageItem::Text { .. } => None,
        })
        .collect();

    let file_style = Style::default()
        .fg(Color::Green)
        .add_modifier(Modifier::ITALIC);
    let mut lines = vec![
        StyledLine::new("You:", header_style(Color::Blue)),
        StyledLine::new(
            match paths.len() {
                0 => "  ▸ no files selected".to_string(),
                1 => "  ▸ 1 file".to_string(),
                n => format!("  ▸ {n} files"),
            },
            file_style,
        ),
    ];
    for path in paths {
        lines.push(StyledLine::new(format!("    {}", path), file_style));
    }
    if let Some(query) = grounding_query(items) {
        for line in query.lines() {
            lines.push(StyledLine::new(
                format!("  {}", line),
                Style::default().fg(Color::Blue),
            ));
        }
    }
    lines
}

fn session_lines(session: &Session) -> Vec<StyledLine> {
    let mut lines = Vec::new();
    for (idx, message) in session.history.iter().enumerate() {
        if idx == 0 && message.role == Role::User && !session.first_message.is_empty() {
            lines.extend(grounding_lines(&session.first_message));
        } else {
            lines.extend(message_lines(message));
        }
        lines.push(StyledLine::new("", Style::default()));
    }
    if !session.streaming.is_empty() {
        lines.extend(message_lines(&ChatMessage::assistant(
            session.streaming.clone(),
        )));
    }
    if let Some(error) = &session.last_error {
        lines.push(StyledLine::new(
            format!("Error: {}", error),
            Style::default().fg(Color::Red),
        ));
    }
    lines
}

fn rendered_height(lines: &[StyledLine], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .iter()
        .map(|line| line.text.chars().count().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

struct InputBuffer {
    lines: Vec<String>,
    /// In characters, not bytes.
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn set_text(&mut self, text: &str) {
        self.lines = text.split('\n').map(str::to_string).collect();
        self.cursor_y = self.lines.len() - 1;
        self.cursor_x = self.line_len(self.cursor_y);
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn byte_index(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let idx = self.byte_index();
        self.lines[self.cursor_y].insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let idx = self.byte_index();
            self.lines[self.cursor_y].remove(idx);
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let idx = self.byte_index();
        let remaining = self.lines[self.cursor_y].split_off(idx);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_home(&mut self) {
        self.cursor_x = 0;
    }

    fn move_end(&mut self) {
        self.cursor_x = self.line_len(self.cursor_y);
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask about a repository, or /open <url>",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

struct App {
    registry: SessionRegistry,
    input: InputBuffer,
    client: BridgeClient,
    settings: SettingsStore,
    models: Vec<String>,
    show_models: bool,
    notice: Option<String>,
    connected: bool,
    /// Lines scrolled up from the bottom of the conversation.
    scroll_back: u16,
    should_quit: bool,
    sender: mpsc::UnboundedSender<UiEvent>,
    receiver: mpsc::UnboundedReceiver<UiEvent>,
}

impl App {
    fn new(client: BridgeClient, settings: SettingsStore, initial_url: Option<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = SessionRegistry::new();
        if let Some(url) = initial_url {
            registry.set_active(url);
        }

        Self {
            registry,
            input: InputBuffer::new(),
            client,
            settings,
            models: Vec::new(),
            show_models: false,
            notice: None,
            connected: true,
            scroll_back: 0,
            should_quit: false,
            sender,
            receiver,
        }
    }

    fn start(&self) {
        let client = self.client.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let forward = sender.clone();
            let result = client
                .stream_events(|message| {
                    let _ = forward.send(UiEvent::Server(message));
                    async {}
                })
                .await;
            let reason = match result {
                Ok(()) => "event stream closed by the coordinator".to_string(),
                Err(err) => err.to_string(),
            };
            let _ = sender.send(UiEvent::Disconnected(reason));
        });
        self.dispatch(Command::ListModels);
    }

    fn dispatch(&self, command: Command) {
        let client = self.client.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            if let Err(err) = client.send_command(&command).await {
                let request_id = match &command {
                    Command::SendMessage { request, .. } => Some(request.request_id.clone()),
                    Command::Abort { .. } | Command::ListModels => None,
                };
                let _ = sender.send(UiEvent::CommandFailed {
                    request_id,
                    message: err.to_string(),
                });
            }
        });
    }

    fn handle_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::Server(ServerMessage::Chat(event)) => {
                self.registry.apply(event);
                self.restore_input();
            }
            UiEvent::Server(ServerMessage::Reply(Reply::AvailableModels { models })) => {
                info!(count = models.len(), "Received model list");
                if self.settings.get().selected_model.is_empty() {
                    if let Some(first) = models.first() {
                        self.select_model(first.clone());
                    }
                }
                if self.show_models {
                    self.show_models = false;
                    self.notice = Some(if models.is_empty() {
                        "No models available".to_string()
                    } else {
                        format!("Models: {}", models.join(", "))
                    });
                }
                self.models = models;
            }
            UiEvent::Server(ServerMessage::Reply(Reply::Error { error_message })) => {
                self.show_models = false;
                self.notice = Some(format!("Failed to list models: {}", error_message));
            }
            UiEvent::CommandFailed {
                request_id: Some(request_id),
                message,
            } => {
                self.registry.apply(ChatEvent::new(
                    request_id,
                    ChatEventKind::Error {
                        name: "TransportError".to_string(),
                        message,
                    },
                ));
                self.restore_input();
            }
            UiEvent::CommandFailed {
                request_id: None,
                message,
            } => {
                self.notice = Some(message);
            }
            UiEvent::Disconnected(reason) => {
                warn!(%reason, "Lost connection to coordinator");
                self.connected = false;
                self.registry
                    .fail_all_in_flight(&format!("Connection to coordinator lost: {}", reason));
                self.restore_input();
            }
        }
    }

    fn restore_input(&mut self) {
        if let Some(text) = self.registry.take_restored_input() {
            if self.input.is_empty() {
                self.input.set_text(&text);
            }
        }
    }

    fn select_model(&mut self, model: String) {
        let result = self
            .settings
            .update(|settings| settings.selected_model = model.clone());
        self.notice = Some(match result {
            Ok(()) => format!("Model: {}", model),
            Err(err) => format!("Failed to save model selection: {}", err),
        });
    }

    fn submit(&mut self) {
        let text = self.input.text();
        match parse_input(&text) {
            Input::Message(message) if message.is_empty() => {}
            Input::Message(message) => self.send(message),
            Input::Open(url) => {
                self.registry.set_active(url.clone());
                self.scroll_back = 0;
                self.input.clear();
                self.notice = Some(format!("Opened {}", url));
            }
            Input::Model(model) => {
                if !self.models.is_empty() && !self.models.contains(&model) {
                    self.notice = Some(format!("Unknown model: {}", model));
                    return;
                }
                self.select_model(model);
                self.input.clear();
            }
            Input::Models => {
                self.show_models = true;
                self.dispatch(Command::ListModels);
                self.input.clear();
            }
            Input::NewChat => {
                self.new_chat();
                self.input.clear();
            }
            Input::Quit => self.should_quit = true,
            Input::Unknown(command) => {
                self.notice = Some(format!(
                    "Unknown command {}; try /open, /model, /models, /new or /quit",
                    command
                ));
            }
        }
    }

    fn send(&mut self, message: String) {
        if self.registry.active_key().is_none() {
            match find_url(&message) {
                Some(url) => self.registry.set_active(url),
                None => {
                    self.notice =
                        Some("Open a repository first: /open <url>, or include its URL".to_string());
                    return;
                }
            }
        }

        let model = self.settings.get().selected_model;
        if model.is_empty() {
            self.notice = Some("No model selected; use /models and /model <name>".to_string());
            return;
        }

        match self.registry.begin_send(&message, &model) {
            Some(command) => {
                self.input.clear();
                self.notice = None;
                self.scroll_back = 0;
                self.dispatch(command);
            }
            None => {
                self.notice =
                    Some("Wait for the current reply, or press Esc to abort it".to_string());
            }
        }
    }

    fn new_chat(&mut self) {
        self.notice = Some(if self.registry.new_chat() {
            "Started a new chat".to_string()
        } else {
            "Abort the current reply before starting a new chat".to_string()
        });
        self.scroll_back = 0;
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => self.should_quit = true,
                KeyCode::Char('n') => self.new_chat(),
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Esc => match self.registry.abort_active() {
                Some(command) => self.dispatch(command),
                None => self.notice = None,
            },
            KeyCode::Enter => {
                if key
                    .modifiers
                    .intersects(KeyModifiers::SHIFT | KeyModifiers::ALT)
                {
                    self.input.new_line();
                } else {
                    self.submit();
                }
            }
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_up(),
            KeyCode::Down => self.input.move_down(),
            KeyCode::Home => self.input.move_home(),
            KeyCode::End => self.input.move_end(),
            KeyCode::PageUp => self.scroll_back = self.scroll_back.saturating_add(10),
            KeyCode::PageDown => self.scroll_back = self.scroll_back.saturating_sub(10),
            _ => {}
        }
    }

    fn status_line(&self) -> Line<'static> {
        if !self.connected {
            return Line::from(Span::styled(
                "Disconnected from coordinator",
                Style::default().fg(Color::Red),
            ));
        }
        if let Some(label) = self.registry.active().and_then(|s| s.phase.label()) {
            return Line::from(Span::styled(
                label,
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::ITALIC),
            ));
        }
        match &self.notice {
            Some(notice) => Line::from(Span::styled(
                notice.clone(),
                Style::default().fg(Color::Gray),
            )),
            None => Line::default(),
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [header, body, status, input] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
            Constraint::Length(INPUT_HEIGHT),
        ])
        .areas(f.area());

        let model = self.settings.get().selected_model;
        let title = format!(
            " repochat · {} · model: {} ",
            self.registry.active_key().unwrap_or("no repository"),
            if model.is_empty() { "none" } else { model.as_str() }
        );
        f.render_widget(
            Paragraph::new(Line::from(Span::styled(title, header_style(Color::White)))),
            header,
        );

        self.draw_conversation(f, body);
        f.render_widget(Paragraph::new(self.status_line()), status);

        let title = if self.registry.is_active_busy() {
            " Esc to abort "
        } else {
            " Enter to send, Alt+Enter for a new line, Ctrl-N new chat, Ctrl-C to quit "
        };
        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input.x + cursor_x).min(input.x + input.width.saturating_sub(2));
        let y = (input.y + 1 + cursor_y).min(input.y + input.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn draw_conversation(&mut self, f: &mut Frame, area: Rect) {
        let lines = match self.registry.active() {
            Some(session) => session_lines(session),
            None => vec![StyledLine::new(
                "No conversation yet. Ask a question about the open repository.",
                Style::default().fg(Color::DarkGray),
            )],
        };

        let total = rendered_height(&lines, area.width);
        let max_scroll = total.saturating_sub(area.height);
        self.scroll_back = self.scroll_back.min(max_scroll);
        let offset = max_scroll - self.scroll_back;

        let text = Text::from(
            lines
                .into_iter()
                .map(|line| Line::from(Span::styled(line.text, line.style)))
                .collect::<Vec<_>>(),
        );
        f.render_widget(
            Paragraph::new(text)
                .wrap(Wrap { trim: false })
                .scroll((offset, 0)),
            area,
        );
    }
}

/// Runs the panel until the user quits. Blocks the calling thread; coordinator I/O runs
/// on spawned tasks.
pub fn run_panel(
    client: BridgeClient,
    settings: SettingsStore,
    initial_url: Option<String>,
) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard::new();
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App::new(client, settings, initial_url);
    app.start();

    while !app.should_quit {
        while let Ok(event) = app.receiver.try_recv() {
            app.handle_ui_event(event);
        }

        terminal.draw(|f| app.draw(f))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                app.handle_key(key);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn input_buffer_shift_enter_inserts_new_line() {
        let mut buffer = InputBuffer::new();
        for ch in "hello".chars() {
            buffer.insert_char(ch);
        }
        buffer.new_line();
        for ch in "world".chars() {
            buffer.insert_char(ch);
        }

        assert_eq!(buffer.text(), "hello\nworld");
        assert_eq!(buffer.lines.len(), 2);
        assert_eq!(buffer.cursor_y, 1);
    }

    #[test]
    fn input_buffer_edits_multibyte_text_by_character() {
        let mut buffer = InputBuffer::new();
        for ch in "héllo".chars() {
            buffer.insert_char(ch);
        }
        buffer.move_left();
        buffer.move_left();
        buffer.delete_char();
        buffer.insert_char('L');

        assert_eq!(buffer.text(), "héLlo");
        assert_eq!(buffer.cursor_x, 3);
    }

    #[test]
    fn restored_text_puts_cursor_at_the_end() {
        let mut buffer = InputBuffer::new();
        buffer.set_text("explain\nthe retry logic");

        assert_eq!(buffer.cursor_y, 1);
        assert_eq!(buffer.cursor_x, "the retry logic".len());
        assert_eq!(buffer.text(), "explain\nthe retry logic");
    }

    #[test]
    fn slash_commands_are_recognised() {
        assert_eq!(
            parse_input("/open https://github.com/acme/widgets"),
            Input::Open("https://github.com/acme/widgets".to_string())
        );
        assert_eq!(
            parse_input("/model  llama3 "),
            Input::Model("llama3".to_string())
        );
        assert_eq!(parse_input("/models"), Input::Models);
        assert_eq!(parse_input("/new"), Input::NewChat);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/open"), Input::Unknown("/open".to_string()));
        assert_eq!(
            parse_input("  explain the retry logic \n"),
            Input::Message("explain the retry logic".to_string())
        );
    }

    #[test]
    fn grounding_message_renders_collapsed() {
        let items = vec![
            FirstMessageItem::text("Here is a list of files"),
            FirstMessageItem::File {
                file_path: "src/retry.rs".to_string(),
                file_content: "fn retry() {}\n".repeat(50),
            },
            FirstMessageItem::text("___"),
            FirstMessageItem::text(
                "[INSTRUCTION]\n\nAnswer.\n\n[USER QUERY]\n\nexplain the retry logic",
            ),
        ];
        let mut session = Session::default();
        session.history = vec![
            ChatMessage::user("flattened grounding"),
            ChatMessage::assistant("It retries."),
        ];
        session.first_message = items;

        let text: Vec<String> = session_lines(&session)
            .into_iter()
            .map(|line| line.text)
            .collect();

        assert_eq!(
            text,
            vec![
                "You:",
                "  ▸ 1 file",
                "    src/retry.rs",
                "  explain the retry logic",
                "",
                "Assistant:",
                "  It retries.",
                "",
            ]
        );
    }

    #[test]
    fn streaming_text_and_error_follow_history() {
        let mut session = Session::default();
        session.history = vec![ChatMessage::user("and the backoff?")];
        session.streaming = "Expo".to_string();
        session.last_error = Some("boom".to_string());

        let text: Vec<String> = session_lines(&session)
            .into_iter()
            .map(|line| line.text)
            .collect();

        assert_eq!(
            text,
            vec![
                "You:",
                "  and the backoff?",
                "",
                "Assistant:",
                "  Expo",
                "Error: boom",
            ]
        );
    }

    #[test]
    fn rendered_height_wraps_by_characters() {
        let lines = vec![
            StyledLine::new("ééééé", Style::default()),
            StyledLine::new("", Style::default()),
        ];
        assert_eq!(rendered_height(&lines, 2), 4);
    }
}
