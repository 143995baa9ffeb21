// src/history.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, TimeZone};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::HistoryError;
use crate::types::{decimal_u256, TransferRecord};

/// Per-sender counters, reset at local midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLimit {
    pub daily_count: u64,
    #[serde(with = "decimal_u256")]
    pub daily_value: U256,
    /// Local midnight the counters were last reset at, in milliseconds.
    pub last_reset: i64,
}

/// On-disk layout of the store.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    #[serde(default)]
    limits: BTreeMap<String, DailyLimit>,
    #[serde(default)]
    history: Vec<TransferRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<i64>,
}

/// Today's transfers for one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyUsage {
    pub count: usize,
    /// Wei.
    pub value: U256,
    /// Next local midnight.
    pub reset_time: DateTime<Local>,
}

/// JSON file of relayed transfers. All access goes through one lock, and
/// every write replaces the file with a rename so readers never see a
/// partial document.
pub struct HistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_transfer(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        tx_hash: H256,
    ) -> Result<TransferRecord, HistoryError> {
        self.record_transfer_at(from, to, amount, tx_hash, Local::now())
            .await
    }

    pub async fn record_transfer_at(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        tx_hash: H256,
        now: DateTime<Local>,
    ) -> Result<TransferRecord, HistoryError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;

        let now_ms = now.timestamp_millis();
        let day_start = local_midnight(now).timestamp_millis();

        let limit = doc
            .limits
            .entry(format!("{:?}", from))
            .or_insert_with(|| DailyLimit {
                daily_count: 0,
                daily_value: U256::zero(),
                last_reset: day_start,
            });
        if limit.last_reset < day_start {
            limit.daily_count = 0;
            limit.daily_value = U256::zero();
            limit.last_reset = day_start;
        }
        limit.daily_count += 1;
        limit.daily_value = limit
            .daily_value
            .checked_add(amount)
            .ok_or_else(|| HistoryError::Amount(format!("daily total overflows adding {amount}")))?;

        let record = TransferRecord {
            address: from,
            timestamp: now_ms,
            amount,
            tx_hash,
            recipient: to,
        };
        doc.history.push(record.clone());
        doc.last_updated = Some(now_ms);

        self.store(&doc).await?;
        info!("Recorded transfer {:?} from {:?}", tx_hash, from);
        Ok(record)
    }

    /// Count and total of `address`'s transfers since local midnight of `now`.
    pub async fn daily_usage(
        &self,
        address: Address,
        now: DateTime<Local>,
    ) -> Result<DailyUsage, HistoryError> {
        let since = local_midnight(now).timestamp_millis();

        let _guard = self.lock.lock().await;
        let doc = self.load().await?;

        let mut usage = DailyUsage {
            count: 0,
            value: U256::zero(),
            reset_time: next_local_midnight(now),
        };
        for record in doc
            .history
            .iter()
            .filter(|r| r.address == address && r.timestamp >= since)
        {
            usage.count += 1;
            usage.value = usage.value.saturating_add(record.amount);
        }
        Ok(usage)
    }

    /// Recorded transfers, newest first, optionally only those sent by `address`.
    pub async fn history(&self, address: Option<Address>) -> Result<Vec<TransferRecord>, HistoryError> {
        let _guard = self.lock.lock().await;
        let doc = self.load().await?;

        let mut records: Vec<_> = doc
            .history
            .into_iter()
            .filter(|r| address.map_or(true, |a| r.address == a))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn load(&self) -> Result<HistoryDocument, HistoryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No history at {}, starting empty", self.path.display());
                Ok(HistoryDocument::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, doc: &HistoryDocument) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, serde_json::to_vec_pretty(doc)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// When the daily counters of `now` roll over.
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    local_midnight(now) + Duration::days(1)
}

fn local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, day, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn empty_store_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("limits.json"));

        assert!(store.history(None).await.unwrap().is_empty());
        let usage = store.daily_usage(Address::repeat_byte(1), at(12, 9)).await.unwrap();
        assert_eq!(usage.count, 0);
        assert_eq!(usage.reset_time, at(13, 0));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn records_persist_in_document_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("limits.json");
        let store = HistoryStore::new(&path);
        let from: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();

        store
            .record_transfer_at(from, Address::repeat_byte(2), U256::exp10(18), H256::repeat_byte(7), at(12, 9))
            .await
            .unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let limit = &doc["limits"]["0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"];
        assert_eq!(limit["dailyCount"], 1);
        assert_eq!(limit["dailyValue"], "1000000000000000000");
        assert_eq!(limit["lastReset"], at(12, 0).timestamp_millis());
        assert_eq!(doc["history"][0]["amount"], "1000000000000000000");
        assert_eq!(doc["history"][0]["timestamp"], at(12, 9).timestamp_millis());
        assert!(doc["history"][0]["to"].is_string());
        assert_eq!(doc["lastUpdated"], at(12, 9).timestamp_millis());
        assert!(!dir.path().join("nested").join("limits.json.tmp").exists());
    }

    #[tokio::test]
    async fn daily_usage_resets_at_local_midnight() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("limits.json"));
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);

        store.record_transfer_at(alice, bob, 5.into(), H256::repeat_byte(1), at(11, 23)).await.unwrap();
        store.record_transfer_at(alice, bob, 7.into(), H256::repeat_byte(2), at(12, 1)).await.unwrap();
        store.record_transfer_at(alice, bob, 11.into(), H256::repeat_byte(3), at(12, 8)).await.unwrap();
        store.record_transfer_at(bob, alice, 100.into(), H256::repeat_byte(4), at(12, 9)).await.unwrap();

        let usage = store.daily_usage(alice, at(12, 10)).await.unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.value, U256::from(18));
        assert_eq!(usage.reset_time, at(13, 0));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("limits.json"));
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);

        store.record_transfer_at(alice, bob, 1.into(), H256::repeat_byte(1), at(10, 1)).await.unwrap();
        store.record_transfer_at(bob, alice, 2.into(), H256::repeat_byte(2), at(11, 1)).await.unwrap();
        store.record_transfer_at(alice, bob, 3.into(), H256::repeat_byte(3), at(12, 1)).await.unwrap();

        let all = store.history(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].tx_hash, H256::repeat_byte(3));
        assert_eq!(all[2].tx_hash, H256::repeat_byte(1));

        let alices = store.history(Some(alice)).await.unwrap();
        assert_eq!(
            alices.iter().map(|r| r.amount.as_u64()).collect::<Vec<_>>(),
            vec![3, 1]
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = HistoryStore::new(&path);

        let err = store
            .record_transfer_at(Address::zero(), Address::zero(), 1.into(), H256::zero(), at(12, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Json(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not json");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::new(dir.path().join("limits.json")));
        let from = Address::repeat_byte(0x11);

        let tasks: Vec<_> = (0..20u8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .record_transfer_at(from, Address::repeat_byte(i), 1.into(), H256::repeat_byte(i), at(12, 9))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.history(Some(from)).await.unwrap().len(), 20);
        let usage = store.daily_usage(from, at(12, 10)).await.unwrap();
        assert_eq!(usage.count, 20);
        assert_eq!(usage.value, U256::from(20));
    }
}
