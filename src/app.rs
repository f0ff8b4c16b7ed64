use anyhow::Result;
use chrono::Local;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use ratatui::{
    backend::Backend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::time::Duration;
use tokio::time;
use tui_textarea::TextArea;

use crate::api::JournalApi;
use crate::config::{self, AppConfig};
use crate::controller::{AuthState, ControllerEvent, JournalController};
use crate::error::JournalError;
use crate::markdown;
use crate::model::{EntryId, EntryView};

const LOGO: &str = "✦ NIGHTINGALE ✦";
const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

#[derive(PartialEq, Clone, Copy, Debug)]
enum Pane {
    Login,
    List,
    Compose,
    Edit,
    DeleteConfirm,
}

#[derive(PartialEq, Clone, Copy, Debug)]
enum LoginMode {
    Login,
    Register,
    Forgot,
    Reset,
}

impl LoginMode {
    fn next(self) -> Self {
        match self {
            LoginMode::Login => LoginMode::Register,
            LoginMode::Register => LoginMode::Forgot,
            LoginMode::Forgot => LoginMode::Reset,
            LoginMode::Reset => LoginMode::Login,
        }
    }

    fn title(self) -> &'static str {
        match self {
            LoginMode::Login => " Log In ",
            LoginMode::Register => " Create Account ",
            LoginMode::Forgot => " Forgot Password ",
            LoginMode::Reset => " Reset Password ",
        }
    }

    /// Field labels and whether each one is masked.
    fn fields(self) -> &'static [(&'static str, bool)] {
        match self {
            LoginMode::Login => &[("Email", false), ("Password", true)],
            LoginMode::Register => &[
                ("Email", false),
                ("Password", true),
                ("Confirm Password", true),
            ],
            LoginMode::Forgot => &[("Email", false)],
            LoginMode::Reset => &[
                ("Reset Token", false),
                ("New Password", true),
                ("Confirm Password", true),
            ],
        }
    }
}

#[derive(Debug)]
enum Message {
    Key(KeyEvent),
    Paste(String),
    Resize,
    Controller(ControllerEvent),
    Tick,
}

/// The terminal front end. Owns no journal state of its own; everything it
/// draws comes from the controller.
pub struct App<A: JournalApi> {
    controller: JournalController<A>,
    config: AppConfig,
    pane: Pane,

    login_mode: LoginMode,
    login_fields: Vec<TextArea<'static>>,
    login_focus: usize,

    title_input: TextArea<'static>,
    body_input: TextArea<'static>,
    body_focused: bool,
    compose_submitted: bool,

    list_state: ListState,
    paywall_state: ListState,
    clipboard: Option<arboard::Clipboard>,
    flash: Option<String>,
    spinner_index: usize,
}

impl<A: JournalApi> App<A> {
    pub fn new(controller: JournalController<A>, config: AppConfig) -> Self {
        let pane = if controller.auth() == AuthState::LoggedIn {
            Pane::List
        } else {
            Pane::Login
        };
        let mut app = Self {
            controller,
            config,
            pane,
            login_mode: LoginMode::Login,
            login_fields: Vec::new(),
            login_focus: 0,
            title_input: TextArea::default(),
            body_input: TextArea::default(),
            body_focused: false,
            compose_submitted: false,
            list_state: ListState::default(),
            paywall_state: ListState::default(),
            clipboard: arboard::Clipboard::new().ok(),
            flash: None,
            spinner_index: 0,
        };
        app.setup_login_fields();
        app.paywall_state.select(Some(0));
        app
    }

    pub async fn run<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        self.controller.start();
        let mut events = EventStream::new();
        let mut spinner_interval = time::interval(Duration::from_millis(100));
        let mut should_render = true;

        loop {
            if should_render {
                terminal.draw(|f| self.ui(f))?;
                should_render = false;
            }

            let busy = self.controller.in_flight() > 0 || self.controller.is_revealing();
            let msg = tokio::select! {
                event = events.next() => match event {
                    Some(Ok(Event::Key(key))) => Message::Key(key),
                    Some(Ok(Event::Paste(text))) => Message::Paste(text),
                    Some(Ok(Event::Resize(_, _))) => Message::Resize,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                event = self.controller.next_event() => Message::Controller(event),
                _ = spinner_interval.tick(), if busy => Message::Tick,
            };

            if self.update(msg)? {
                return Ok(());
            }
            should_render = true;
        }
    }

    fn update(&mut self, msg: Message) -> Result<bool> {
        match msg {
            Message::Key(key) => {
                if matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                    if self.handle_key_event(key) {
                        return Ok(true);
                    }
                }
            }
            Message::Paste(text) => {
                let text = text.replace('\r', "");
                match self.pane {
                    Pane::Login => {
                        if let Some(field) = self.login_fields.get_mut(self.login_focus) {
                            field.insert_str(text.replace('\n', ""));
                        }
                    }
                    Pane::Compose | Pane::Edit => {
                        if self.body_focused {
                            self.body_input.insert_str(text);
                        } else {
                            self.title_input.insert_str(text.replace('\n', " "));
                        }
                    }
                    _ => {}
                }
            }
            Message::Resize => {}
            Message::Controller(event) => self.controller.handle(event),
            Message::Tick => {
                self.spinner_index = (self.spinner_index + 1) % SPINNER.len();
            }
        }
        self.sync_pane();
        Ok(false)
    }

    /// Follows controller state: session changes, finished submissions and
    /// entries that disappeared underneath the selection.
    fn sync_pane(&mut self) {
        match self.controller.auth() {
            AuthState::LoggedIn => {
                if self.pane == Pane::Login {
                    self.pane = Pane::List;
                    self.setup_login_fields();
                    self.list_state.select(Some(0));
                }
            }
            AuthState::LoggedOut | AuthState::LoginPending => {
                if self.pane != Pane::Login {
                    self.pane = Pane::Login;
                    self.compose_submitted = false;
                }
            }
        }

        match self.pane {
            Pane::DeleteConfirm if self.controller.pending_delete().is_none() => {
                self.pane = Pane::List;
            }
            Pane::Edit if self.controller.draft().is_none() => {
                self.pane = Pane::List;
            }
            Pane::Compose if self.compose_submitted && !self.controller.is_creating() => {
                self.compose_submitted = false;
                let form = self.controller.compose();
                if form.title.is_empty() && form.content.is_empty() {
                    self.pane = Pane::List;
                    self.list_state.select(Some(0));
                }
            }
            _ => {}
        }

        let len = self.controller.entries().len();
        match self.list_state.selected() {
            _ if len == 0 => self.list_state.select(None),
            Some(i) if i >= len => self.list_state.select(Some(len - 1)),
            None => self.list_state.select(Some(0)),
            _ => {}
        }
    }

    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        self.flash = None;
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if ctrl && key.code == KeyCode::Char('c') {
            return true;
        }

        if self.controller.paywall().is_visible() && self.pane != Pane::Login {
            self.handle_paywall_key(key);
            return false;
        }

        match self.pane {
            Pane::Login => return self.handle_login_key(key),
            Pane::List => return self.handle_list_key(key),
            Pane::Compose | Pane::Edit => self.handle_form_key(key),
            Pane::DeleteConfirm => match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    let result = self.controller.confirm_delete();
                    self.report(result);
                    self.pane = Pane::List;
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    self.controller.cancel_delete();
                    self.pane = Pane::List;
                }
                _ => {}
            },
        }
        false
    }

    fn handle_login_key(&mut self, key: KeyEvent) -> bool {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => {
                if self.login_mode == LoginMode::Login {
                    return true;
                }
                self.login_mode = LoginMode::Login;
                self.setup_login_fields();
            }
            KeyCode::Char('r') if ctrl => {
                self.login_mode = self.login_mode.next();
                self.setup_login_fields();
            }
            KeyCode::Tab | KeyCode::Down => {
                self.login_focus = (self.login_focus + 1) % self.login_fields.len();
                self.style_login_fields();
            }
            KeyCode::BackTab | KeyCode::Up => {
                let len = self.login_fields.len();
                self.login_focus = (self.login_focus + len - 1) % len;
                self.style_login_fields();
            }
            KeyCode::Enter => {
                if self.login_focus + 1 < self.login_fields.len() {
                    self.login_focus += 1;
                    self.style_login_fields();
                } else {
                    self.submit_login();
                }
            }
            _ => {
                if let Some(field) = self.login_fields.get_mut(self.login_focus) {
                    field.input(key);
                }
            }
        }
        false
    }

    fn submit_login(&mut self) {
        if self.controller.auth() == AuthState::LoginPending {
            return;
        }
        let values: Vec<String> = self
            .login_fields
            .iter()
            .map(|f| f.lines().join(""))
            .collect();
        let value = |i: usize| values.get(i).map(String::as_str).unwrap_or("");
        let result = match self.login_mode {
            LoginMode::Login => self.controller.login(value(0), value(1)),
            LoginMode::Register => self.controller.register(value(0), value(1), value(2)),
            LoginMode::Forgot => self.controller.forgot_password(value(0)),
            LoginMode::Reset => self.controller.reset_password(value(0), value(1), value(2)),
        };
        self.report(result);
    }

    fn handle_list_key(&mut self, key: KeyEvent) -> bool {
        let selected = self.selected_id();
        let result = match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('j') | KeyCode::Down => {
                self.move_list_selection(1);
                Ok(())
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.move_list_selection(-1);
                Ok(())
            }
            KeyCode::Enter => {
                if let Some(id) = selected {
                    self.controller.toggle_expanded(id);
                }
                Ok(())
            }
            KeyCode::Char('n') => {
                self.open_compose();
                Ok(())
            }
            KeyCode::Char('e') => match selected {
                Some(id) => self.open_edit(id),
                None => Ok(()),
            },
            KeyCode::Char('d') => match selected {
                Some(id) => self.controller.request_delete(id).map(|()| {
                    self.pane = Pane::DeleteConfirm;
                }),
                None => Ok(()),
            },
            KeyCode::Char('f') => match selected {
                Some(id) => self.controller.request_feedback(id),
                None => Ok(()),
            },
            KeyCode::Char('y') => {
                self.copy_feedback(selected);
                Ok(())
            }
            KeyCode::Char('h') | KeyCode::Left => self.controller.prev_page(),
            KeyCode::Char('l') | KeyCode::Right => self.controller.next_page(),
            KeyCode::Char('r') => self.controller.reload(),
            KeyCode::Char('u') => {
                self.controller.show_paywall();
                Ok(())
            }
            KeyCode::Char('L') => {
                self.controller.logout();
                Ok(())
            }
            _ => Ok(()),
        };
        self.report(result);
        false
    }

    fn handle_form_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => {
                if self.pane == Pane::Compose {
                    // Keep the unsent text for next time.
                    self.push_form();
                } else {
                    self.controller.cancel_edit();
                }
                self.pane = Pane::List;
            }
            KeyCode::Tab | KeyCode::BackTab => {
                self.body_focused = !self.body_focused;
                self.style_form();
            }
            KeyCode::Char('s') if ctrl => {
                self.push_form();
                let result = if self.pane == Pane::Compose {
                    self.controller.add_entry().map(|()| {
                        self.compose_submitted = true;
                    })
                } else {
                    self.controller.save_edit()
                };
                self.report(result);
            }
            KeyCode::Enter if !self.body_focused => {
                self.body_focused = true;
                self.style_form();
            }
            _ => {
                if self.body_focused {
                    self.body_input.input(key);
                } else {
                    self.title_input.input(key);
                }
            }
        }
    }

    fn handle_paywall_key(&mut self, key: KeyEvent) {
        let count = self.controller.paywall().plans().len();
        let current = self.paywall_state.selected().unwrap_or(0);
        match key.code {
            KeyCode::Char('j') | KeyCode::Down if count > 0 => {
                self.paywall_state.select(Some((current + 1) % count));
            }
            KeyCode::Char('k') | KeyCode::Up if count > 0 => {
                self.paywall_state.select(Some((current + count - 1) % count));
            }
            KeyCode::Enter => {
                if let Some(plan) = self.controller.paywall().plan(current) {
                    tracing::info!("app: opening plan {}", plan.label);
                    open_browser(&plan.url);
                    self.flash = Some(format!("Opened {} in your browser.", plan.label));
                }
            }
            KeyCode::Esc | KeyCode::Char('q') => self.controller.dismiss_paywall(),
            _ => {}
        }
    }

    /// Guard rejections leave the controller's error line alone, so surface
    /// them here.
    fn report(&mut self, result: Result<(), JournalError>) {
        if let Err(e) = result {
            tracing::debug!("app: action rejected: {}", e);
            if self.controller.error().is_none() {
                self.flash = Some(e.message());
            }
        }
    }

    fn selected_id(&self) -> Option<EntryId> {
        self.list_state
            .selected()
            .and_then(|i| self.controller.entries().get(i))
            .map(EntryView::id)
    }

    fn move_list_selection(&mut self, delta: i32) {
        let len = self.controller.entries().len();
        if len == 0 {
            return;
        }
        let current = self.list_state.selected().unwrap_or(0) as i32;
        let next = (current + delta).clamp(0, len as i32 - 1);
        self.list_state.select(Some(next as usize));
    }

    fn copy_feedback(&mut self, id: Option<EntryId>) {
        let Some(view) = id.and_then(|id| self.controller.entry(id)) else {
            return;
        };
        let Some(text) = view.entry.feedback.clone().filter(|_| view.has_feedback) else {
            self.flash = Some("This entry has no feedback yet.".to_string());
            return;
        };
        match &mut self.clipboard {
            Some(cb) => match cb.set_text(text) {
                Ok(()) => self.flash = Some("Feedback copied.".to_string()),
                Err(e) => {
                    tracing::warn!("app: clipboard write failed: {}", e);
                    self.flash = Some("Clipboard unavailable.".to_string());
                }
            },
            None => self.flash = Some("Clipboard unavailable.".to_string()),
        }
    }

    fn open_compose(&mut self) {
        let form = self.controller.compose().clone();
        self.title_input = text_area(&form.title);
        self.body_input = text_area(&form.content);
        self.body_focused = false;
        self.pane = Pane::Compose;
        self.style_form();
    }

    fn open_edit(&mut self, id: EntryId) -> Result<(), JournalError> {
        self.controller.begin_edit(id)?;
        if let Some(draft) = self.controller.draft() {
            self.title_input = text_area(&draft.title);
            self.body_input = text_area(&draft.content);
        }
        self.body_focused = true;
        self.pane = Pane::Edit;
        self.style_form();
        Ok(())
    }

    fn push_form(&mut self) {
        let title = self.title_input.lines().join(" ");
        let content = self.body_input.lines().join("\n");
        if self.pane == Pane::Compose {
            self.controller.set_compose(&title, &content);
        } else {
            self.controller.update_draft(&title, &content);
        }
    }

    fn setup_login_fields(&mut self) {
        self.login_fields = self
            .login_mode
            .fields()
            .iter()
            .map(|(_, masked)| {
                let mut area = TextArea::default();
                if *masked {
                    area.set_mask_char('•');
                }
                area
            })
            .collect();
        self.login_focus = 0;
        self.style_login_fields();
    }

    fn style_login_fields(&mut self) {
        let theme = &self.config.theme;
        let labels = self.login_mode.fields();
        for (i, field) in self.login_fields.iter_mut().enumerate() {
            let active = i == self.login_focus;
            let color = if active {
                theme.border_active
            } else {
                theme.border_inactive
            };
            field.set_block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" {} ", labels[i].0))
                    .border_style(Style::default().fg(color)),
            );
            field.set_cursor_line_style(Style::default());
            field.set_cursor_style(if active {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            });
        }
    }

    fn style_form(&mut self) {
        let theme = &self.config.theme;
        let verb = if self.pane == Pane::Edit { "Edit" } else { "New" };
        let pairs = [
            (&mut self.title_input, !self.body_focused, format!(" {} Entry: Title ", verb)),
            (&mut self.body_input, self.body_focused, " Content ".to_string()),
        ];
        for (area, active, title) in pairs {
            let color = if active {
                theme.border_active
            } else {
                theme.border_inactive
            };
            area.set_block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(color)),
            );
            area.set_cursor_line_style(Style::default());
            area.set_cursor_style(if active {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            });
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let theme = self.config.theme.clone();

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(1),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .split(f.area());

        let account_text = match (self.controller.auth(), self.controller.account()) {
            (AuthState::LoggedIn, Some(account)) if account.is_premium => {
                format!("{} • Premium", account.email)
            }
            (AuthState::LoggedIn, Some(account)) => format!(
                "{} • Free ({} feedback used)",
                account.email, account.feedback_count
            ),
            (AuthState::LoggedIn, None) => "Logged in".to_string(),
            (AuthState::LoginPending, _) => "Logging in...".to_string(),
            (AuthState::LoggedOut, _) => "Not logged in".to_string(),
        };
        let header = Paragraph::new(vec![
            Line::from(Span::styled(
                LOGO,
                Style::default().fg(theme.logo).add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                format!("{} • {}", config::APP_VERSION, account_text),
                Style::default().fg(theme.border_inactive),
            )),
        ])
        .alignment(Alignment::Center);
        f.render_widget(header, chunks[0]);

        match self.pane {
            Pane::Login => self.render_login(f, chunks[1]),
            _ => {
                let main_chunks = Layout::default()
                    .direction(Direction::Horizontal)
                    .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
                    .split(chunks[1]);
                self.render_list(f, main_chunks[0]);
                match self.pane {
                    Pane::Compose | Pane::Edit => self.render_form(f, main_chunks[1]),
                    _ => self.render_detail(f, main_chunks[1]),
                }
                if self.pane == Pane::DeleteConfirm {
                    self.render_delete_confirm(f, chunks[1]);
                }
                if self.controller.paywall().is_visible() {
                    self.render_paywall(f, chunks[1]);
                }
            }
        }

        let (status, color) = if let Some(flash) = &self.flash {
            (flash.clone(), theme.notice)
        } else if let Some(err) = self.controller.error() {
            (format!("✗ {}", err), theme.error)
        } else if let Some(notice) = self.controller.notice() {
            (notice.to_string(), theme.notice)
        } else if self.controller.in_flight() > 0 {
            (
                format!("{} Working...", SPINNER[self.spinner_index]),
                theme.border_inactive,
            )
        } else {
            (String::new(), theme.foreground)
        };
        f.render_widget(
            Paragraph::new(format!(" {}", status))
                .style(Style::default().fg(color).add_modifier(Modifier::BOLD)),
            chunks[2],
        );

        let help_text = if self.controller.paywall().is_visible() && self.pane != Pane::Login {
            " j/k: Choose Plan  •  Enter: Open in Browser  •  Esc: Close "
        } else {
            match self.pane {
                Pane::Login => " Tab: Next Field  •  Enter: Submit  •  Ctrl+R: Switch Form  •  Esc: Back/Quit ",
                Pane::List => " j/k: Move  •  Enter: Expand  •  n: New  •  e: Edit  •  d: Delete  •  f: Feedback  •  y: Copy  •  h/l: Page  •  r: Refresh  •  u: Upgrade  •  L: Logout  •  q: Quit ",
                Pane::Compose | Pane::Edit => " Tab: Switch Field  •  Ctrl+S: Save  •  Esc: Cancel ",
                Pane::DeleteConfirm => " y: Confirm  •  n: Cancel ",
            }
        };
        f.render_widget(
            Paragraph::new(help_text).style(Style::default().fg(theme.border_inactive)),
            chunks[3],
        );
    }

    fn render_login(&self, f: &mut Frame, area: Rect) {
        let theme = &self.config.theme;
        let height = self.login_fields.len() as u16 * 3 + 4;
        let outer = centered_rect(50, 100, area);
        let outer = Rect {
            y: outer.y + outer.height.saturating_sub(height) / 2,
            height: height.min(outer.height),
            ..outer
        };
        f.render_widget(Clear, outer);
        let block = Block::default()
            .borders(Borders::ALL)
            .title(self.login_mode.title())
            .border_style(Style::default().fg(theme.border_active));
        let inner = block.inner(outer);
        f.render_widget(block, outer);

        let mut constraints: Vec<Constraint> =
            self.login_fields.iter().map(|_| Constraint::Length(3)).collect();
        constraints.push(Constraint::Min(0));
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(inner);
        for (i, field) in self.login_fields.iter().enumerate() {
            f.render_widget(field, rows[i]);
        }

        let hint = if self.controller.auth() == AuthState::LoginPending {
            "Waiting for the server..."
        } else {
            match self.login_mode {
                LoginMode::Login => "No account yet? Ctrl+R to register.",
                LoginMode::Register => "Registering logs you in right away.",
                LoginMode::Forgot => "We will email you a reset token.",
                LoginMode::Reset => "Paste the token from the reset email.",
            }
        };
        if let Some(last) = rows.last() {
            f.render_widget(
                Paragraph::new(hint)
                    .style(Style::default().fg(theme.border_inactive))
                    .alignment(Alignment::Center),
                *last,
            );
        }
    }

    fn render_list(&mut self, f: &mut Frame, area: Rect) {
        let theme = self.config.theme.clone();
        let items: Vec<ListItem> = self
            .controller
            .entries()
            .iter()
            .map(|view| {
                let loading = self.controller.loading(view.id());
                let marker = if loading.delete {
                    Span::styled(" ✗ ", Style::default().fg(theme.error))
                } else if loading.feedback || view.is_typing {
                    Span::styled(" … ", Style::default().fg(theme.typing_cursor))
                } else if view.has_feedback {
                    Span::styled(" ✦ ", Style::default().fg(theme.feedback))
                } else {
                    Span::raw("   ")
                };
                let title = if view.entry.title.trim().is_empty() {
                    markdown::preview(&view.entry.content, 40)
                } else {
                    markdown::preview(&view.entry.title, 40)
                };
                let date = view
                    .entry
                    .created_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string();
                ListItem::new(vec![
                    Line::from(vec![marker, Span::raw(title)]),
                    Line::from(Span::styled(
                        format!("   {}", date),
                        Style::default().fg(theme.timestamp),
                    )),
                ])
            })
            .collect();

        let mut title = format!(" Journal • Page {} ", self.controller.page());
        if self.controller.is_page_loading() {
            title.push_str(&format!("{} ", SPINNER[self.spinner_index]));
        }
        let nav = match (self.controller.can_go_prev(), self.controller.can_go_next()) {
            (true, true) => " ◀ h  l ▶ ",
            (true, false) => " ◀ h ",
            (false, true) => " l ▶ ",
            (false, false) => "",
        };
        let border = if self.pane == Pane::List {
            theme.border_active
        } else {
            theme.border_inactive
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .title_bottom(Line::from(nav).alignment(Alignment::Right))
            .border_style(Style::default().fg(border));

        let empty = items.is_empty();
        let list = List::new(items)
            .block(block)
            .highlight_style(
                Style::default()
                    .bg(theme.selection_bg)
                    .fg(theme.selection_fg)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol(">>");
        f.render_stateful_widget(list, area, &mut self.list_state);

        if empty && !self.controller.is_page_loading() {
            let inner = Rect {
                x: area.x + 2,
                y: area.y + 2,
                width: area.width.saturating_sub(4),
                height: 2.min(area.height.saturating_sub(3)),
            };
            f.render_widget(
                Paragraph::new("No entries yet. Press n to write one.")
                    .style(Style::default().fg(theme.border_inactive))
                    .wrap(Wrap { trim: true }),
                inner,
            );
        }
    }

    fn render_detail(&self, f: &mut Frame, area: Rect) {
        let theme = &self.config.theme;
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Entry ")
            .border_style(Style::default().fg(theme.border_inactive));

        let Some(view) = self.selected_id().and_then(|id| self.controller.entry(id)) else {
            f.render_widget(block, area);
            return;
        };

        let mut text = Text::default();
        text.lines.push(Line::from(Span::styled(
            view.entry.title.clone(),
            Style::default()
                .fg(theme.header)
                .add_modifier(Modifier::BOLD),
        )));
        text.lines.push(Line::from(Span::styled(
            view.entry
                .created_at
                .with_timezone(&Local)
                .format("%A, %B %-d %Y at %H:%M")
                .to_string(),
            Style::default().fg(theme.timestamp),
        )));
        text.lines.push(Line::default());
        text.lines.extend(
            markdown::render(
                &view.entry.content,
                Style::default().fg(theme.foreground),
                theme,
            )
            .lines,
        );
        text.lines.push(Line::default());

        let loading = self.controller.loading(view.id());
        let hint = Style::default().fg(theme.border_inactive);
        if view.has_feedback {
            if view.is_expanded || view.is_typing {
                text.lines.push(Line::from(Span::styled(
                    "── Reflection ──",
                    Style::default()
                        .fg(theme.feedback)
                        .add_modifier(Modifier::BOLD),
                )));
                text.lines.extend(
                    markdown::render_feedback(view.displayed_feedback(), view.is_typing, theme)
                        .lines,
                );
            } else {
                text.lines.push(Line::from(Span::styled(
                    "✦ Feedback available. Enter to show.",
                    hint,
                )));
            }
        } else if loading.feedback {
            text.lines.push(Line::from(Span::styled(
                format!("{} Reflecting on your entry...", SPINNER[self.spinner_index]),
                Style::default().fg(theme.feedback),
            )));
        } else if self.controller.can_request_feedback(view.id()) {
            text.lines.push(Line::from(Span::styled(
                "Press f for reflective feedback.",
                hint,
            )));
        }

        let paragraph = Paragraph::new(text)
            .block(block)
            .wrap(Wrap { trim: false });
        f.render_widget(paragraph, area);
    }

    fn render_form(&self, f: &mut Frame, area: Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(3)])
            .split(area);
        f.render_widget(&self.title_input, rows[0]);
        f.render_widget(&self.body_input, rows[1]);
    }

    fn render_delete_confirm(&self, f: &mut Frame, area: Rect) {
        let theme = &self.config.theme;
        let title = self
            .controller
            .pending_delete()
            .and_then(|id| self.controller.entry(id))
            .map(|v| markdown::preview(&v.entry.title, 30))
            .unwrap_or_default();

        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Delete Entry? ")
            .border_style(Style::default().fg(theme.error));
        let text = format!(
            "\n  Are you sure you want to delete this entry?\n\n  \"{}\"\n\n  (y/n)",
            title
        );
        let p = Paragraph::new(text)
            .block(block)
            .alignment(Alignment::Center);

        let confirm_area = centered_rect(40, 30, area);
        f.render_widget(Clear, confirm_area);
        f.render_widget(p, confirm_area);
    }

    fn render_paywall(&mut self, f: &mut Frame, area: Rect) {
        let theme = self.config.theme.clone();
        let popup = centered_rect(50, 40, area);
        f.render_widget(Clear, popup);

        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Upgrade to Premium ")
            .border_style(Style::default().fg(theme.premium));
        let inner = block.inner(popup);
        f.render_widget(block, popup);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(1)])
            .split(inner);
        f.render_widget(
            Paragraph::new("You've used your free feedback.\nChoose a plan for unlimited reflections.")
                .alignment(Alignment::Center)
                .wrap(Wrap { trim: true }),
            rows[0],
        );

        let items: Vec<ListItem> = self
            .controller
            .paywall()
            .plans()
            .iter()
            .map(|plan| ListItem::new(format!("  {}", plan.label)))
            .collect();
        let list = List::new(items)
            .highlight_style(
                Style::default()
                    .fg(theme.premium)
                    .add_modifier(Modifier::BOLD | Modifier::REVERSED),
            )
            .highlight_symbol(">>");
        f.render_stateful_widget(list, rows[1], &mut self.paywall_state);
    }
}

fn text_area(content: &str) -> TextArea<'static> {
    if content.is_empty() {
        TextArea::default()
    } else {
        TextArea::new(content.lines().map(str::to_string).collect())
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn open_browser(url: &str) {
    if let Err(e) = webbrowser::open(url) {
        tracing::warn!("app: failed to open browser: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use crate::paywall::PaywallGate;
    use crate::session::SessionStore;
    use crate::test_support::{FakeApi, TOKEN};
    use ratatui::backend::TestBackend;
    use std::sync::Arc;

    fn press(code: KeyCode) -> Message {
        Message::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> Message {
        Message::Key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL))
    }

    fn type_text(app: &mut App<FakeApi>, text: &str) {
        for c in text.chars() {
            app.update(press(KeyCode::Char(c))).unwrap();
        }
    }

    async fn settle(app: &mut App<FakeApi>) {
        time::timeout(Duration::from_secs(60), async {
            while app.controller.in_flight() > 0 {
                let event = app.controller.next_event().await;
                app.update(Message::Controller(event)).unwrap();
            }
        })
        .await
        .expect("app did not settle");
    }

    fn app(api: &Arc<FakeApi>, dir: &tempfile::TempDir) -> App<FakeApi> {
        let settings = ControllerSettings {
            page_size: 5,
            reveal_step: Duration::from_millis(10),
        };
        let controller = JournalController::new(
            Arc::clone(api),
            SessionStore::open(dir.path()),
            settings,
            PaywallGate::default(),
        );
        App::new(controller, AppConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn login_form_leads_to_the_list() {
        let api = FakeApi::with_entries(2);
        api.add_user("a@b.c", "pw");
        let dir = tempfile::tempdir().unwrap();
        let mut app = app(&api, &dir);
        assert_eq!(app.pane, Pane::Login);

        type_text(&mut app, "a@b.c");
        app.update(press(KeyCode::Tab)).unwrap();
        type_text(&mut app, "pw");
        app.update(press(KeyCode::Enter)).unwrap();
        settle(&mut app).await;

        assert_eq!(app.pane, Pane::List);
        assert_eq!(app.list_state.selected(), Some(0));
        assert!(app.login_fields.iter().all(|f| f.lines().join("").is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn compose_closes_only_after_the_entry_is_saved() {
        let api = FakeApi::with_entries(1);
        let dir = tempfile::tempdir().unwrap();
        SessionStore::open(dir.path()).set(TOKEN).unwrap();
        let mut app = app(&api, &dir);
        app.controller.start();
        settle(&mut app).await;

        app.update(press(KeyCode::Char('n'))).unwrap();
        assert_eq!(app.pane, Pane::Compose);
        type_text(&mut app, "Morning");
        app.update(press(KeyCode::Tab)).unwrap();
        type_text(&mut app, "Slept well");
        app.update(ctrl('s')).unwrap();
        assert_eq!(app.pane, Pane::Compose);
        settle(&mut app).await;

        assert_eq!(app.pane, Pane::List);
        assert_eq!(app.controller.entries()[0].entry.title, "Morning");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_asks_before_calling_the_server() {
        let api = FakeApi::with_entries(2);
        let dir = tempfile::tempdir().unwrap();
        SessionStore::open(dir.path()).set(TOKEN).unwrap();
        let mut app = app(&api, &dir);
        app.controller.start();
        settle(&mut app).await;

        app.update(press(KeyCode::Char('d'))).unwrap();
        assert_eq!(app.pane, Pane::DeleteConfirm);
        app.update(press(KeyCode::Char('n'))).unwrap();
        assert_eq!(app.pane, Pane::List);
        assert_eq!(api.calls("delete"), 0);

        app.update(press(KeyCode::Char('d'))).unwrap();
        app.update(press(KeyCode::Char('y'))).unwrap();
        settle(&mut app).await;
        assert_eq!(api.calls("delete"), 1);
        assert_eq!(app.controller.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renders_every_pane() {
        let api = FakeApi::with_entries(3);
        api.seed("Evening", "Long day", Some("Rest is earned."));
        let dir = tempfile::tempdir().unwrap();
        let mut app = app(&api, &dir);
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|f| app.ui(f)).unwrap();

        SessionStore::open(dir.path()).set(TOKEN).unwrap();
        app.controller.session().reload();
        let event = app.controller.next_event().await;
        app.update(Message::Controller(event)).unwrap();
        settle(&mut app).await;
        assert_eq!(app.pane, Pane::List);

        app.update(press(KeyCode::Enter)).unwrap();
        terminal.draw(|f| app.ui(f)).unwrap();
        let buffer = terminal.backend().buffer().clone();
        let rendered: String = buffer.content().iter().map(|c| c.symbol()).collect();
        assert!(rendered.contains("Rest is earned."));

        app.controller.show_paywall();
        terminal.draw(|f| app.ui(f)).unwrap();
        app.update(press(KeyCode::Esc)).unwrap();
        assert!(!app.controller.paywall().is_visible());

        app.update(press(KeyCode::Char('e'))).unwrap();
        assert_eq!(app.pane, Pane::Edit);
        terminal.draw(|f| app.ui(f)).unwrap();
    }
}
