use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{BinColor, BinStatus, ClassificationEntry, EntrySource, SortEvent, Timestamp};

/// Store shared between the frame loop and the request surface.
pub type SharedStore = Arc<Mutex<dyn ClassificationStore>>;

/// Result of a `put`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Same mapping already stored; nothing changed.
    Unchanged,
    /// A different mapping is stored and was kept.
    Conflict(BinColor),
}

/// Learned class→bin mappings plus the sort history.
///
/// `put` never overwrites: learned mappings are write-once.
pub trait ClassificationStore: Send {
    fn get(&self, class_name: &str) -> Result<Option<BinColor>>;

    fn put(&mut self, class_name: &str, bin_color: BinColor) -> Result<PutOutcome>;

    /// All learned entries, ordered by class name.
    fn entries(&self) -> Result<Vec<ClassificationEntry>>;

    fn append_sort_event(&mut self, event: &SortEvent) -> Result<()>;

    /// Most recent events first.
    fn recent_sort_events(&self, limit: usize) -> Result<Vec<SortEvent>>;

    /// Per-bin counts and last sort time over the whole history.
    fn bin_status(&self) -> Result<Vec<BinStatus>>;
}

pub fn shared<S: ClassificationStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// In-memory SQLite database URI shared by connections of one process.
pub fn shared_memory_uri() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("file:smart_bin_{}?mode=memory&cache=shared", hex::encode(bytes))
}

pub struct SqliteClassificationStore {
    conn: Connection,
}

impl SqliteClassificationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS waste_items (
              class_name TEXT PRIMARY KEY,
              bin_color TEXT NOT NULL,
              learned_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sort_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              class_name TEXT NOT NULL,
              bin_color TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sort_events_created ON sort_events(created_at_ms);
            "#,
        )?;
        Ok(())
    }
}

fn parse_bin(raw: &str) -> Result<BinColor> {
    raw.parse::<BinColor>()
        .map_err(|e| anyhow!("corrupt classification store: {}", e))
}

fn to_i64(ts: Timestamp) -> Result<i64> {
    i64::try_from(ts.epoch_ms).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

impl ClassificationStore for SqliteClassificationStore {
    fn get(&self, class_name: &str) -> Result<Option<BinColor>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT bin_color FROM waste_items WHERE class_name = ?1",
                params![class_name],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(parse_bin).transpose()
    }

    fn put(&mut self, class_name: &str, bin_color: BinColor) -> Result<PutOutcome> {
        let learned_at = to_i64(Timestamp::now()?)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO waste_items(class_name, bin_color, learned_at) VALUES (?1, ?2, ?3)",
            params![class_name, bin_color.as_str(), learned_at],
        )?;
        if inserted == 1 {
            return Ok(PutOutcome::Inserted);
        }
        match self.get(class_name)? {
            Some(existing) if existing == bin_color => Ok(PutOutcome::Unchanged),
            Some(existing) => Ok(PutOutcome::Conflict(existing)),
            None => Err(anyhow!("insert of '{}' was ignored but no row exists", class_name)),
        }
    }

    fn entries(&self) -> Result<Vec<ClassificationEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT class_name, bin_color FROM waste_items ORDER BY class_name ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let class_name: String = row.get(0)?;
            let bin: String = row.get(1)?;
            out.push(ClassificationEntry {
                class_name,
                bin_color: parse_bin(&bin)?,
                source: EntrySource::Learned,
            });
        }
        Ok(out)
    }

    fn append_sort_event(&mut self, event: &SortEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sort_events(class_name, bin_color, created_at_ms) VALUES (?1, ?2, ?3)",
            params![
                event.class_name,
                event.bin_color.as_str(),
                to_i64(event.timestamp)?
            ],
        )?;
        Ok(())
    }

    fn recent_sort_events(&self, limit: usize) -> Result<Vec<SortEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT class_name, bin_color, created_at_ms FROM sort_events ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let class_name: String = row.get(0)?;
            let bin: String = row.get(1)?;
            let created_at_ms: i64 = row.get(2)?;
            out.push(SortEvent {
                class_name,
                bin_color: parse_bin(&bin)?,
                timestamp: Timestamp::from_millis(created_at_ms.max(0) as u64),
            });
        }
        Ok(out)
    }

    fn bin_status(&self) -> Result<Vec<BinStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT bin_color, COUNT(*), MAX(created_at_ms) FROM sort_events GROUP BY bin_color",
        )?;
        let mut rows = stmt.query([])?;
        let mut seen = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let bin: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let last: Option<i64> = row.get(2)?;
            seen.insert(
                parse_bin(&bin)?.as_str(),
                (count.max(0) as u64, last.map(|ms| Timestamp::from_millis(ms.max(0) as u64))),
            );
        }
        Ok(status_for_all_bins(|bin| seen.get(bin.as_str()).copied()))
    }
}

fn status_for_all_bins(lookup: impl Fn(BinColor) -> Option<(u64, Option<Timestamp>)>) -> Vec<BinStatus> {
    BinColor::ALL
        .iter()
        .map(|&bin_color| {
            let (sorted_count, last_sorted_at) = lookup(bin_color).unwrap_or((0, None));
            BinStatus {
                bin_color,
                sorted_count,
                last_sorted_at,
            }
        })
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryClassificationStore {
    items: BTreeMap<String, BinColor>,
    events: Vec<SortEvent>,
}

impl InMemoryClassificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassificationStore for InMemoryClassificationStore {
    fn get(&self, class_name: &str) -> Result<Option<BinColor>> {
        Ok(self.items.get(class_name).copied())
    }

    fn put(&mut self, class_name: &str, bin_color: BinColor) -> Result<PutOutcome> {
        match self.items.get(class_name) {
            Some(&existing) if existing == bin_color => Ok(PutOutcome::Unchanged),
            Some(&existing) => Ok(PutOutcome::Conflict(existing)),
            None => {
                self.items.insert(class_name.to_string(), bin_color);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn entries(&self) -> Result<Vec<ClassificationEntry>> {
        Ok(self
            .items
            .iter()
            .map(|(class_name, &bin_color)| ClassificationEntry {
                class_name: class_name.clone(),
                bin_color,
                source: EntrySource::Learned,
            })
            .collect())
    }

    fn append_sort_event(&mut self, event: &SortEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn recent_sort_events(&self, limit: usize) -> Result<Vec<SortEvent>> {
        Ok(self.events.iter().rev().take(limit).cloned().collect())
    }

    fn bin_status(&self) -> Result<Vec<BinStatus>> {
        Ok(status_for_all_bins(|bin| {
            let matching = self.events.iter().filter(|ev| ev.bin_color == bin);
            let (count, last) = matching.fold((0u64, None), |(count, last), ev| {
                (count + 1, Some(last.map_or(ev.timestamp, |l: Timestamp| l.max(ev.timestamp))))
            });
            (count > 0).then_some((count, last))
        }))
    }
}
