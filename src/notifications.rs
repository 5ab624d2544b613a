//! Contract alerts and periodic summaries.
//!
//! Nothing is delivered from here: notices and reports are returned to the
//! caller and written to the log.

use crate::clock::SharedClock;
use crate::contract::{RecordState, UserId};
use crate::error::{Error, Result};
use crate::storage::Storage;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

/// Window used for "expiring soon" in the daily summary.
pub const EXPIRING_SOON_DAYS: i64 = 30;

// Caps lookahead and lookback so date arithmetic cannot overflow.
const MAX_WINDOW_DAYS: i64 = 36_500;

const UNKNOWN_CLIENT: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpirationNotice {
    pub contract_id: i64,
    pub contract_title: String,
    pub client_name: String,
    pub days_until_expiry: i64,
    pub expiration_date: NaiveDate,
    pub created_by: UserId,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChangeNotice {
    pub contract_id: i64,
    pub contract_title: String,
    pub client_name: String,
    pub old_status: Option<RecordState>,
    pub new_status: RecordState,
    pub changed_by: UserId,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_contracts: i64,
    pub new_contracts_today: i64,
    pub status_changes_today: i64,
    pub expiring_soon: i64,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyReport {
    /// Monday of the current week.
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub new_contracts: i64,
    pub expiring_this_week: i64,
    pub status_changes: i64,
}

pub struct Notifier {
    store: Storage,
    clock: SharedClock,
}

impl Notifier {
    pub fn new(store: Storage, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// One notice per active contract expiring within `days` days.
    pub async fn expiring_contracts(&self, days: i64) -> Result<Vec<ExpirationNotice>> {
        if !(0..=MAX_WINDOW_DAYS).contains(&days) {
            return Err(Error::Validation(format!(
                "days must be within 0..={MAX_WINDOW_DAYS}"
            )));
        }
        let now = self.clock.now();
        let today = now.date_naive();
        let notices = self
            .store
            .read(|tx| {
                let mut notices = Vec::new();
                for contract in tx.expiring_contracts(today, today + Duration::days(days))? {
                    let (Some(expiration_date), Some(days_until_expiry)) = (
                        contract.expiration_date,
                        contract.days_until_expiration(today),
                    ) else {
                        continue;
                    };
                    let client_name = tx
                        .get_client(contract.client_id)?
                        .map_or_else(|| UNKNOWN_CLIENT.to_string(), |c| c.name);
                    notices.push(ExpirationNotice {
                        contract_id: contract.id,
                        contract_title: contract.title,
                        client_name,
                        days_until_expiry,
                        expiration_date,
                        created_by: contract.created_by,
                        generated_at: now,
                    });
                }
                Ok(notices)
            })
            .await?;

        for notice in &notices {
            info!(
                contract_id = notice.contract_id,
                days_until_expiry = notice.days_until_expiry,
                "Contract '{}' expires soon",
                notice.contract_title
            );
        }
        Ok(notices)
    }

    /// Status changes recorded in the last `hours` hours, oldest first.
    pub async fn status_changes(&self, hours: i64) -> Result<Vec<StatusChangeNotice>> {
        if !(1..=MAX_WINDOW_DAYS * 24).contains(&hours) {
            return Err(Error::Validation(format!(
                "hours must be within 1..={}",
                MAX_WINDOW_DAYS * 24
            )));
        }
        let now = self.clock.now();
        let since = now - Duration::hours(hours);
        let changes = self
            .store
            .read(|tx| tx.status_changes_between(since, now + Duration::seconds(1)))
            .await?;
        let notices: Vec<StatusChangeNotice> = changes
            .into_iter()
            .map(|(entry, contract_title, client_name)| StatusChangeNotice {
                contract_id: entry.contract_id,
                contract_title,
                client_name: client_name.unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
                old_status: entry.old_status,
                new_status: entry.new_status,
                changed_by: entry.changed_by,
                reason: entry.reason,
                changed_at: entry.changed_at,
            })
            .collect();
        for notice in &notices {
            info!(
                contract_id = notice.contract_id,
                from = notice.old_status.map_or("none", |s| s.as_str()),
                to = notice.new_status.as_str(),
                changed_by = notice.changed_by,
                "Contract status changed"
            );
        }
        Ok(notices)
    }

    /// Totals for the current UTC day.
    pub async fn daily_summary(&self) -> Result<DailySummary> {
        let today = self.clock.today();
        let (start, end) = (day_start(today), day_start(today + Duration::days(1)));
        let summary = self
            .store
            .read(|tx| {
                Ok(DailySummary {
                    date: today,
                    total_contracts: tx.status_counts()?.iter().map(|s| s.count).sum(),
                    new_contracts_today: tx.count_created_between(start, end)?,
                    status_changes_today: tx.status_changes_between(start, end)?.len() as i64,
                    expiring_soon: tx
                        .expiring_contracts(today, today + Duration::days(EXPIRING_SOON_DAYS))?
                        .len() as i64,
                    total_value: tx.total_contract_value()?,
                })
            })
            .await?;
        info!(
            date = %summary.date,
            new_contracts = summary.new_contracts_today,
            status_changes = summary.status_changes_today,
            expiring_soon = summary.expiring_soon,
            "Daily summary generated"
        );
        Ok(summary)
    }

    /// Totals for the current Monday-to-Sunday week.
    pub async fn weekly_report(&self) -> Result<WeeklyReport> {
        let today = self.clock.today();
        let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let week_end = week_start + Duration::days(6);
        let (start, end) = (day_start(week_start), day_start(week_end + Duration::days(1)));
        let report = self
            .store
            .read(|tx| {
                Ok(WeeklyReport {
                    week_start,
                    week_end,
                    new_contracts: tx.count_created_between(start, end)?,
                    expiring_this_week: tx.count_expiring_between(week_start, week_end)?,
                    status_changes: tx.status_changes_between(start, end)?.len() as i64,
                })
            })
            .await?;
        info!(
            week_start = %report.week_start,
            new_contracts = report.new_contracts,
            expiring = report.expiring_this_week,
            status_changes = report.status_changes,
            "Weekly report generated"
        );
        Ok(report)
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
