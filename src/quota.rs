//! Daily annotation call counter
//!
//! The counter is a `(count, date)` record persisted under [`QUOTA_KEY`]. It
//! rolls over to zero once a full day has passed since the stored date. The
//! daily ceiling itself is enforced by the caller.

use crate::config::QUOTA_KEY;
use crate::storage::{self, KeyValueStore, StorageError};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while reading or writing the quota record
#[derive(Error, Debug)]
pub enum QuotaError {
    /// The backing store failed
    #[error("quota storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Persisted number of annotation calls for a calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Calls made since `date`
    pub count: u32,
    /// Day the counter was last reset
    pub date: NaiveDate,
}

impl QuotaRecord {
    /// A fresh counter for `today`
    #[must_use]
    pub const fn fresh(today: NaiveDate) -> Self {
        Self {
            count: 0,
            date: today,
        }
    }

    /// Whether at least one full day separates `date` from `today`
    #[must_use]
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        (today - self.date).num_days() >= 1
    }
}

/// Reads and updates the quota record through an injected store
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn KeyValueStore>,
}

impl QuotaTracker {
    /// Create a tracker on top of `store`
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current local calendar date
    #[must_use]
    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// Return today's record, creating or rolling it over as needed
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn check_quota(&self) -> Result<QuotaRecord, QuotaError> {
        self.check_quota_on(Self::today()).await
    }

    /// [`Self::check_quota`] with an explicit notion of "today"
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn check_quota_on(&self, today: NaiveDate) -> Result<QuotaRecord, QuotaError> {
        match self.load().await? {
            Some(record) if !record.is_stale(today) => Ok(record),
            Some(record) => {
                info!(
                    stored_date = %record.date,
                    stored_count = record.count,
                    "Quota rolled over"
                );
                self.store_fresh(today).await
            }
            None => {
                debug!("No quota record yet, initializing");
                self.store_fresh(today).await
            }
        }
    }

    /// Count one more annotation call
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn increment_quota(&self) -> Result<QuotaRecord, QuotaError> {
        self.increment_quota_on(Self::today()).await
    }

    /// [`Self::increment_quota`] with an explicit notion of "today", used only
    /// when no record exists yet
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn increment_quota_on(&self, today: NaiveDate) -> Result<QuotaRecord, QuotaError> {
        let mut record = self
            .load()
            .await?
            .unwrap_or_else(|| QuotaRecord::fresh(today));
        record.count = record.count.saturating_add(1);
        self.save(&record).await?;
        debug!(count = record.count, "Quota incremented");
        Ok(record)
    }

    /// Unconditionally reset the counter
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn reset_quota(&self) -> Result<QuotaRecord, QuotaError> {
        self.reset_quota_on(Self::today()).await
    }

    /// [`Self::reset_quota`] with an explicit notion of "today"
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn reset_quota_on(&self, today: NaiveDate) -> Result<QuotaRecord, QuotaError> {
        info!("Quota reset");
        self.store_fresh(today).await
    }

    async fn store_fresh(&self, today: NaiveDate) -> Result<QuotaRecord, QuotaError> {
        let record = QuotaRecord::fresh(today);
        self.save(&record).await?;
        Ok(record)
    }

    async fn load(&self) -> Result<Option<QuotaRecord>, QuotaError> {
        Ok(storage::load(self.store.as_ref(), QUOTA_KEY).await?)
    }

    async fn save(&self, record: &QuotaRecord) -> Result<(), QuotaError> {
        Ok(storage::save(self.store.as_ref(), QUOTA_KEY, record).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, MockKeyValueStore};
    use chrono::Days;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    async fn tracker_with(
        record: Option<QuotaRecord>,
    ) -> Result<(QuotaTracker, Arc<InMemoryStorage>), StorageError> {
        let store = Arc::new(InMemoryStorage::default());
        if let Some(record) = record {
            storage::save(store.as_ref(), QUOTA_KEY, &record).await?;
        }
        Ok((QuotaTracker::new(store.clone()), store))
    }

    async fn stored(store: &InMemoryStorage) -> Result<Option<QuotaRecord>, StorageError> {
        storage::load(store, QUOTA_KEY).await
    }

    #[tokio::test]
    async fn test_missing_record_is_initialized_and_persisted() -> TestResult {
        let today = day(2024, 5, 10);
        let (tracker, store) = tracker_with(None).await?;

        let record = tracker.check_quota_on(today).await?;
        assert_eq!(record, QuotaRecord::fresh(today));
        assert_eq!(stored(&store).await?, Some(QuotaRecord::fresh(today)));
        Ok(())
    }

    #[tokio::test]
    async fn test_record_two_days_old_is_reset() -> TestResult {
        let today = day(2024, 5, 10);
        let old = QuotaRecord {
            count: 17,
            date: today - Days::new(2),
        };
        let (tracker, store) = tracker_with(Some(old)).await?;

        let record = tracker.check_quota_on(today).await?;
        assert_eq!(record, QuotaRecord::fresh(today));
        assert_eq!(stored(&store).await?, Some(QuotaRecord::fresh(today)));
        Ok(())
    }

    #[tokio::test]
    async fn test_record_from_yesterday_is_reset() -> TestResult {
        let today = day(2024, 3, 1);
        let old = QuotaRecord {
            count: 30,
            date: day(2024, 2, 29),
        };
        let (tracker, _) = tracker_with(Some(old)).await?;

        assert_eq!(tracker.check_quota_on(today).await?.count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_from_today_is_unchanged() -> TestResult {
        let today = day(2024, 5, 10);
        let current = QuotaRecord {
            count: 12,
            date: today,
        };
        let (tracker, store) = tracker_with(Some(current)).await?;

        assert_eq!(tracker.check_quota_on(today).await?, current);
        assert_eq!(stored(&store).await?, Some(current));
        Ok(())
    }

    #[tokio::test]
    async fn test_increment_keeps_date() -> TestResult {
        let today = day(2024, 5, 10);
        let current = QuotaRecord {
            count: 4,
            date: day(2024, 5, 9),
        };
        let (tracker, store) = tracker_with(Some(current)).await?;

        let record = tracker.increment_quota_on(today).await?;
        assert_eq!(record.count, 5);
        assert_eq!(record.date, day(2024, 5, 9));
        assert_eq!(stored(&store).await?, Some(record));
        Ok(())
    }

    #[tokio::test]
    async fn test_increment_without_record_starts_at_one() -> TestResult {
        let today = day(2024, 5, 10);
        let (tracker, _) = tracker_with(None).await?;

        let record = tracker.increment_quota_on(today).await?;
        assert_eq!(
            record,
            QuotaRecord {
                count: 1,
                date: today
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_is_unconditional() -> TestResult {
        let today = day(2024, 5, 10);
        let current = QuotaRecord {
            count: 29,
            date: today,
        };
        let (tracker, store) = tracker_with(Some(current)).await?;

        assert_eq!(
            tracker.reset_quota_on(today).await?,
            QuotaRecord::fresh(today)
        );
        assert_eq!(stored(&store).await?, Some(QuotaRecord::fresh(today)));
        Ok(())
    }

    #[test]
    fn test_record_serializes_as_count_and_iso_date() -> TestResult {
        let record = QuotaRecord {
            count: 3,
            date: day(2024, 1, 2),
        };
        assert_eq!(
            serde_json::to_value(record)?,
            json!({"count": 3, "date": "2024-01-02"})
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get_json()
            .returning(|_| Err(StorageError::Config("offline".into())));
        let tracker = QuotaTracker::new(Arc::new(store));

        let result = tracker.check_quota_on(day(2024, 5, 10)).await;
        assert!(matches!(result, Err(QuotaError::Storage(_))));
    }
}
