//! Full-screen chat loop.
//!
//! Single-threaded cooperative design: the loop redraws from the shared
//! conversation state, turn tasks and detached purchase fulfillments
//! mutate it behind the mutex, and channels carry their progress back in.

use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ratatui::backend::CrosstermBackend;
use ratatui::crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::crossterm::execute;
use ratatui::crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::core::chat_store::{Chat, ChatStore};
use crate::core::conversation::{confirm_purchase, Conversation, DisplayBlock, PurchaseUpdate};
use crate::core::message::Role;
use crate::core::tools::PurchaseStatus;
use crate::core::turn::{TurnEngine, TurnError};
use crate::ui::widgets;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ChatSession {
    pub conversation: Arc<Mutex<Conversation>>,
    pub engine: TurnEngine,
    pub model: String,
    pub user_id: String,
    pub chat_store: Option<ChatStore>,
}

struct LoopState {
    input: String,
    scroll_offset: u16,
    auto_scroll: bool,
    status: Option<String>,
    last_saved_len: usize,
}

pub async fn run_chat(session: ChatSession) -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_loop(&mut terminal, session).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    session: ChatSession,
) -> Result<(), Box<dyn Error>> {
    let ChatSession {
        conversation,
        engine,
        model,
        user_id,
        chat_store,
    } = session;

    let (purchase_tx, mut purchase_rx) = mpsc::unbounded_channel::<PurchaseUpdate>();
    let mut state = LoopState {
        input: String::new(),
        scroll_offset: 0,
        auto_scroll: true,
        status: Some(format!("Model: {model} (Enter sends, /quit exits)")),
        last_saved_len: 0,
    };

    loop {
        let lines = {
            let guard = conversation.lock().await;
            transcript_lines(&guard)
        };

        terminal.draw(|frame| draw_ui(frame, &lines, &mut state))?;

        if event::poll(POLL_INTERVAL)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            break;
                        }
                        KeyCode::Enter => {
                            let submitted = state.input.trim().to_string();
                            if submitted.is_empty() {
                                continue;
                            }
                            state.input.clear();

                            if submitted == "/quit" {
                                break;
                            }
                            if submitted == "/buy" {
                                handle_buy(&conversation, &purchase_tx, &mut state).await;
                                continue;
                            }

                            match engine.submit(
                                Arc::clone(&conversation),
                                submitted,
                                model.clone(),
                            ) {
                                Ok(_handle) => {
                                    state.auto_scroll = true;
                                    state.status = None;
                                }
                                Err(TurnError::Busy) => {
                                    state.status = Some(
                                        "A response is still streaming; wait for it to finish."
                                            .to_string(),
                                    );
                                }
                            }
                        }
                        KeyCode::Char(ch) => state.input.push(ch),
                        KeyCode::Backspace => {
                            state.input.pop();
                        }
                        KeyCode::Up => {
                            state.auto_scroll = false;
                            state.scroll_offset = state.scroll_offset.saturating_sub(1);
                        }
                        KeyCode::Down => {
                            state.scroll_offset = state.scroll_offset.saturating_add(1);
                        }
                        KeyCode::End => {
                            state.auto_scroll = true;
                        }
                        _ => {}
                    }
                }
            }
        }

        while let Ok(update) = purchase_rx.try_recv() {
            apply_purchase_update(&conversation, update, &mut state).await;
        }

        maybe_save_snapshot(
            &conversation,
            &engine,
            chat_store.as_ref(),
            &user_id,
            &mut state,
        )
        .await;
    }

    Ok(())
}

async fn handle_buy(
    conversation: &Arc<Mutex<Conversation>>,
    purchase_tx: &mpsc::UnboundedSender<PurchaseUpdate>,
    state: &mut LoopState,
) {
    let pending = {
        let guard = conversation.lock().await;
        guard
            .ui_state()
            .into_iter()
            .rev()
            .find_map(|entry| match entry.display {
                DisplayBlock::Purchase(summary)
                    if summary.status == PurchaseStatus::RequiresAction =>
                {
                    Some(summary)
                }
                _ => None,
            })
    };

    match pending {
        Some(summary) => {
            let shares = summary.number_of_shares.unwrap_or_default();
            confirm_purchase(
                purchase_tx.clone(),
                summary.symbol.clone(),
                summary.price,
                shares,
            );
            state.status = Some(format!("Purchasing {shares} ${}...", summary.symbol));
        }
        None => {
            state.status = Some("No purchase is awaiting confirmation.".to_string());
        }
    }
}

async fn apply_purchase_update(
    conversation: &Arc<Mutex<Conversation>>,
    update: PurchaseUpdate,
    state: &mut LoopState,
) {
    match update {
        PurchaseUpdate::Working { symbol, amount } => {
            state.status = Some(format!("Purchasing {amount} ${symbol}..."));
        }
        PurchaseUpdate::StillWorking { symbol, amount } => {
            state.status = Some(format!("Purchasing {amount} ${symbol}... working on it..."));
        }
        PurchaseUpdate::Done {
            symbol,
            price,
            amount,
            total,
        } => {
            conversation
                .lock()
                .await
                .record_purchase_fill(&symbol, price, amount);
            state.status = Some(format!(
                "You have successfully purchased {amount} ${symbol}. Total cost: {total}"
            ));
        }
    }
}

/// Persist a whole snapshot after each settled transition, starting with
/// the first committed assistant turn.
async fn maybe_save_snapshot(
    conversation: &Arc<Mutex<Conversation>>,
    engine: &TurnEngine,
    chat_store: Option<&ChatStore>,
    user_id: &str,
    state: &mut LoopState,
) {
    let Some(store) = chat_store else {
        return;
    };
    if engine.is_busy() {
        return;
    }

    let guard = conversation.lock().await;
    let len = guard.messages().len();
    if len == state.last_saved_len {
        return;
    }
    let has_committed_reply = guard
        .messages()
        .iter()
        .any(|message| message.role != Role::User);
    if !has_committed_reply {
        return;
    }

    if let Some(chat) = Chat::snapshot(&guard, user_id) {
        if let Err(err) = store.save(&chat) {
            debug!(error = %err, "chat snapshot save failed");
        } else {
            state.last_saved_len = len;
        }
    }
}

fn transcript_lines(conversation: &Conversation) -> Vec<Line<'static>> {
    conversation
        .ui_state()
        .iter()
        .flat_map(widgets::entry_lines)
        .collect()
}

fn draw_ui(frame: &mut Frame, lines: &[Line<'static>], state: &mut LoopState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(3),
        ])
        .split(frame.area());

    let available_height = chunks[0].height.saturating_sub(1);
    let total_lines = lines.len() as u16;
    let max_offset = total_lines.saturating_sub(available_height);
    if state.auto_scroll {
        state.scroll_offset = max_offset;
    } else {
        state.scroll_offset = state.scroll_offset.min(max_offset);
    }

    let transcript = Paragraph::new(lines.to_vec())
        .block(Block::default().title("tickertalk"))
        .wrap(Wrap { trim: true })
        .scroll((state.scroll_offset, 0));
    frame.render_widget(transcript, chunks[0]);

    let status = Paragraph::new(state.status.clone().unwrap_or_default())
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(status, chunks[1]);

    let input = Paragraph::new(state.input.as_str())
        .style(Style::default().fg(Color::Yellow))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Type your message (Enter to send, /buy to confirm a purchase)"),
        )
        .wrap(Wrap { trim: true });
    frame.render_widget(input, chunks[2]);

    frame.set_cursor_position((
        chunks[2].x + state.input.chars().count() as u16 + 1,
        chunks[2].y + 1,
    ));
}
