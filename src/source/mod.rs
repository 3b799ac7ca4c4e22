//! Wallet records and the events derived from them.
//!
//! Each record carries one flag per audit concern. A set flag contributes its
//! event class; a record with no flags set produces no event.

mod sqlite;

pub use sqlite::SqliteWalletSource;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::scheduler::event::{Event, EventClass};

/// Flag columns in table order, with the class each one raises.
pub const FIELDS: [(&str, EventClass); 5] = [
    ("rebalance", EventClass::RebalanceNeeded),
    ("open_order", EventClass::OpenOrderDetected),
    ("open_position", EventClass::OpenPositionDetected),
    ("new_balance", EventClass::NewBalanceUpdate),
    ("check_balance", EventClass::BalanceCheckRequired),
];

/// Errors reading the wallet database.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid database URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// One row of the wallets table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub wallet_name: String,
    pub rebalance: bool,
    pub open_order: bool,
    pub open_position: bool,
    pub new_balance: bool,
    pub check_balance: bool,
}

impl WalletRecord {
    pub fn new(wallet_name: impl Into<String>) -> Self {
        Self {
            wallet_name: wallet_name.into(),
            ..Default::default()
        }
    }

    /// Value of a flag column by name.
    pub fn flag(&self, field: &str) -> bool {
        match field {
            "rebalance" => self.rebalance,
            "open_order" => self.open_order,
            "open_position" => self.open_position,
            "new_balance" => self.new_balance,
            "check_balance" => self.check_balance,
            _ => false,
        }
    }

    /// Classes raised by this record, in flag column order.
    pub fn classes(&self) -> Vec<EventClass> {
        FIELDS
            .iter()
            .filter(|(field, _)| self.flag(field))
            .map(|(_, class)| *class)
            .collect()
    }

    /// Builds the audit event for this wallet, if any flag is set.
    pub fn to_event(&self) -> Option<Event> {
        let classes = self.classes();
        if classes.is_empty() {
            return None;
        }
        match Event::new(self.wallet_name.clone(), classes) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(wallet = %self.wallet_name, error = %e, "Skipping wallet record");
                None
            }
        }
    }
}

/// Converts records to events, dropping records that raise nothing.
pub fn events_from_records(records: &[WalletRecord]) -> Vec<Event> {
    records.iter().filter_map(WalletRecord::to_event).collect()
}

/// Renders records as the plain-text table printed by `stats`.
pub fn record_table(title: &str, records: &[WalletRecord]) -> String {
    let rule = "-".repeat(80);
    let mut out = format!(
        "{title}\n{rule}\nwallet_name | rebalance | open_order | open_position | new_balance | check_balance\n{rule}\n"
    );
    for r in records {
        let bit = |set: bool| u8::from(set);
        out.push_str(&format!(
            "{:11} | {:9} | {:10} | {:13} | {:11} | {:12}\n",
            r.wallet_name,
            bit(r.rebalance),
            bit(r.open_order),
            bit(r.open_position),
            bit(r.new_balance),
            bit(r.check_balance),
        ));
    }
    out
}

/// Count of set flags per field over the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldStats {
    pub total: u64,
    pub counts: Vec<(String, u64)>,
}

impl FieldStats {
    pub fn count(&self, field: &str) -> u64 {
        self.counts
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Share of records with `field` set, in percent. Zero for an empty table.
    pub fn percentage(&self, field: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(field) as f64 / self.total as f64 * 100.0
    }
}

impl fmt::Display for FieldStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total wallet records: {}", self.total)?;
        writeln!(f)?;
        writeln!(f, "Field Statistics (count of 1s):")?;
        writeln!(f, "{}", "-".repeat(40))?;
        for (field, count) in &self.counts {
            writeln!(
                f,
                "{:15}: {:3} records ({:5.1}%)",
                field,
                count,
                self.percentage(field)
            )?;
        }
        Ok(())
    }
}

/// Read access to the wallet records.
#[async_trait]
pub trait WalletSource: Send + Sync {
    async fn count(&self) -> Result<u64, SourceError>;

    /// Records in table order, `limit` rows starting at `offset`.
    async fn fetch_range(&self, offset: u64, limit: u64) -> Result<Vec<WalletRecord>, SourceError>;

    async fn field_stats(&self) -> Result<FieldStats, SourceError>;

    /// The first `limit` records in table order.
    async fn sample(&self, limit: u64) -> Result<Vec<WalletRecord>, SourceError>;

    /// Up to `limit` records drawn at random.
    async fn random(&self, limit: u64) -> Result<Vec<WalletRecord>, SourceError>;
}
