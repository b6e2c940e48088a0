//! Terminal renderings for conversation entries.
//!
//! Each tool result maps to a small inline widget; visual fidelity is not
//! a contract, the mapping is. Everything renders to plain ratatui lines
//! so the transcript stays a single scrollable paragraph.

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::core::conversation::{DisplayBlock, UiEntry};
use crate::core::tools::{MarketEvent, PurchaseStatus, PurchaseSummary, StockQuote, ToolName};

pub fn entry_lines(entry: &UiEntry) -> Vec<Line<'static>> {
    match &entry.display {
        DisplayBlock::UserText(text) => user_lines(text),
        DisplayBlock::AssistantText(text) => assistant_lines(text),
        DisplayBlock::StreamingText(text) => assistant_lines(text),
        DisplayBlock::PendingTool(tool) => pending_lines(*tool),
        DisplayBlock::Stock(quote) => stock_lines(quote),
        DisplayBlock::Stocks(stocks) => stocks_lines(stocks),
        DisplayBlock::Purchase(purchase) => purchase_lines(purchase),
        DisplayBlock::Events(events) => events_lines(events),
        DisplayBlock::Error(text) => error_lines(text),
    }
}

fn user_lines(text: &str) -> Vec<Line<'static>> {
    vec![
        Line::from(vec![
            Span::styled(
                "You: ",
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(text.to_string(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(""),
    ]
}

fn assistant_lines(text: &str) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for content_line in text.lines() {
        if content_line.trim().is_empty() {
            lines.push(Line::from(""));
        } else {
            lines.push(Line::from(Span::styled(
                content_line.to_string(),
                Style::default().fg(Color::White),
            )));
        }
    }
    lines.push(Line::from(""));
    lines
}

fn pending_lines(tool: ToolName) -> Vec<Line<'static>> {
    let label = match tool {
        ToolName::ListStocks => "Loading trending stocks...",
        ToolName::ShowStockPrice => "Loading stock price...",
        ToolName::ShowStockPurchase => "Preparing purchase...",
        ToolName::GetEvents => "Loading events...",
    };
    vec![
        Line::from(Span::styled(
            label.to_string(),
            Style::default().fg(Color::DarkGray),
        )),
        Line::from(""),
    ]
}

fn delta_span(delta: f64) -> Span<'static> {
    if delta >= 0.0 {
        Span::styled(format!("▲ +{delta:.2}"), Style::default().fg(Color::Green))
    } else {
        Span::styled(format!("▼ {delta:.2}"), Style::default().fg(Color::Red))
    }
}

fn quote_line(quote: &StockQuote) -> Line<'static> {
    Line::from(vec![
        Span::styled(
            format!("{:<8}", quote.symbol),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("${:.2}  ", quote.price)),
        delta_span(quote.delta),
    ])
}

fn stock_lines(quote: &StockQuote) -> Vec<Line<'static>> {
    vec![quote_line(quote), Line::from("")]
}

fn stocks_lines(stocks: &[StockQuote]) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from(Span::styled(
        "Trending stocks".to_string(),
        Style::default().fg(Color::DarkGray),
    ))];
    for quote in stocks {
        lines.push(quote_line(quote));
    }
    lines.push(Line::from(""));
    lines
}

fn purchase_lines(purchase: &PurchaseSummary) -> Vec<Line<'static>> {
    let shares = purchase.number_of_shares.unwrap_or_default();
    let mut lines = vec![Line::from(vec![
        Span::styled(
            format!("Purchase {:<6}", purchase.symbol),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "{shares} shares at ${:.2} = ${:.2}",
            purchase.price,
            shares * purchase.price
        )),
    ])];
    let status = match purchase.status {
        PurchaseStatus::RequiresAction => Span::styled(
            "awaiting confirmation (/buy to confirm)".to_string(),
            Style::default().fg(Color::Yellow),
        ),
        PurchaseStatus::Completed => {
            Span::styled("completed".to_string(), Style::default().fg(Color::Green))
        }
        PurchaseStatus::Expired => {
            Span::styled("expired".to_string(), Style::default().fg(Color::Red))
        }
    };
    lines.push(Line::from(status));
    lines.push(Line::from(""));
    lines
}

fn events_lines(events: &[MarketEvent]) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for event in events {
        lines.push(Line::from(vec![
            Span::styled(
                format!("{}  ", event.date),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(
                event.headline.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
        ]));
        lines.push(Line::from(Span::raw(format!("  {}", event.description))));
    }
    lines.push(Line::from(""));
    lines
}

fn error_lines(text: &str) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for content_line in text.lines() {
        lines.push(Line::from(Span::styled(
            content_line.to_string(),
            Style::default().fg(Color::Red),
        )));
    }
    lines.push(Line::from(""));
    lines
}
