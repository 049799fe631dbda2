//! In-memory image of the subscribed tables of one connection

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use super::{MarketState, INSTRUMENT_TABLE, TRADE_TABLE};
use crate::error::Result;
use crate::orderbook::Level;
use crate::parser::{parse_rows, Action, BookRow, InstrumentRow, TableMessage, TradeRow};
use crate::trades::{Side, Trade};

/// Most recent trades kept per connection
pub const MAX_TRADE_ROWS: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct BookEntry {
    side: Side,
    level: Level,
}

/// Tables maintained from the frames of one connection
#[derive(Debug)]
pub struct FeedTables {
    book_table: String,
    instrument_state: Option<String>,
    trades: VecDeque<Trade>,
    book: HashMap<u64, BookEntry>,
    partials: HashSet<String>,
    last_updates: HashMap<String, DateTime<Utc>>,
}

impl FeedTables {
    pub fn new(book_table: &str) -> Self {
        Self {
            book_table: book_table.to_string(),
            instrument_state: None,
            trades: VecDeque::with_capacity(MAX_TRADE_ROWS),
            book: HashMap::new(),
            partials: HashSet::new(),
            last_updates: HashMap::new(),
        }
    }

    /// Apply one table frame received at `now`.
    ///
    /// Frames that arrive before the table's partial image are dropped.
    pub fn apply(&mut self, message: &TableMessage, now: DateTime<Utc>) -> Result<()> {
        if message.action != Action::Partial && !self.partials.contains(&message.table) {
            debug!(table = %message.table, "Dropping frame received before partial");
            return Ok(());
        }

        match message.table.as_str() {
            INSTRUMENT_TABLE => self.apply_instrument(message)?,
            TRADE_TABLE => self.apply_trades(message)?,
            table if table == self.book_table => self.apply_book(message)?,
            other => {
                warn!(table = %other, "Frame for an unexpected table");
                return Ok(());
            }
        }

        if message.action == Action::Partial {
            self.partials.insert(message.table.clone());
        }
        self.last_updates.insert(message.table.clone(), now);
        Ok(())
    }

    fn apply_instrument(&mut self, message: &TableMessage) -> Result<()> {
        if message.action == Action::Delete {
            return Ok(());
        }
        let rows: Vec<InstrumentRow> = parse_rows(&message.data)?;
        if let Some(state) = rows.into_iter().filter_map(|r| r.state).last() {
            self.instrument_state = Some(state);
        }
        Ok(())
    }

    fn apply_trades(&mut self, message: &TableMessage) -> Result<()> {
        match message.action {
            Action::Partial => self.trades.clear(),
            Action::Insert => {}
            Action::Update | Action::Delete => return Ok(()),
        }
        let rows: Vec<TradeRow> = parse_rows(&message.data)?;
        for row in rows {
            if self.trades.len() == MAX_TRADE_ROWS {
                self.trades.pop_front();
            }
            self.trades.push_back(Trade::from(row));
        }
        Ok(())
    }

    fn apply_book(&mut self, message: &TableMessage) -> Result<()> {
        if message.action == Action::Partial {
            self.book.clear();
        }
        let rows: Vec<BookRow> = parse_rows(&message.data)?;
        for row in rows {
            match message.action {
                Action::Partial | Action::Insert => match (row.price, row.size) {
                    (Some(price), Some(size)) => {
                        self.book.insert(
                            row.id,
                            BookEntry {
                                side: row.side,
                                level: Level::new(price, size),
                            },
                        );
                    }
                    _ => warn!(id = row.id, "Book insert without price or size"),
                },
                Action::Update => {
                    if let Some(entry) = self.book.get_mut(&row.id) {
                        entry.side = row.side;
                        if let Some(size) = row.size {
                            entry.level.size = size;
                        }
                        if let Some(price) = row.price {
                            entry.level.price = price;
                        }
                    }
                }
                Action::Delete => {
                    self.book.remove(&row.id);
                }
            }
        }
        Ok(())
    }

    /// True once every table in `tables` has received its partial image
    pub fn has_partials<S: AsRef<str>>(&self, tables: &[S]) -> bool {
        tables.iter().all(|t| self.partials.contains(t.as_ref()))
    }

    pub fn market_state(&self) -> MarketState {
        MarketState::from_instrument_state(self.instrument_state.as_deref())
    }

    pub fn sorted_recent_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.trades.iter().cloned().collect();
        trades.sort();
        trades
    }

    pub fn sorted_bids_and_asks(&self) -> (Vec<Level>, Vec<Level>) {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for entry in self.book.values() {
            match entry.side {
                Side::Buy => bids.push(entry.level),
                Side::Sell => asks.push(entry.level),
            }
        }
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        (bids, asks)
    }

    pub fn last_update(&self, table: &str) -> Option<DateTime<Utc>> {
        self.last_updates.get(table).copied()
    }
}
