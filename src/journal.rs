// ===============================
// src/journal.rs
// ===============================
//
// Write-ahead journal untuk ledger (JSONL):
// - Satu baris per transaksi yang commit: post-image baris saldo user,
//   baris order yang disentuh, dan fill baru.
// - Ditulis + flush SEBELUM perubahan terlihat di memori.
// - Otomatis membuat parent directory jika belum ada.
// - Setiap record punya `seq` unik. Jika tulis gagal, file di-reopen dan
//   ditulis marker `{"aborted_seq":N}` supaya replay mengabaikan record itu;
//   commit batal. Kalau marker juga gagal, journal menolak semua append
//   berikutnya.
// - Replay saat startup melewati baris rusak (mis. tulisan terpotong) dan
//   record yang sudah di-abort.
//
// ENV: set `JOURNAL_FILE=/path/to/ledger.jsonl` agar persisten (lihat config.rs).
//
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::{error, info, warn};

use crate::domain::{FillRecord, PendingOrder, UserId};

/// One committed ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Per-commit sequence number; 0 on records written before sequencing.
    #[serde(default)]
    pub seq: u64,
    pub ts_ms: i64,
    pub user_id: UserId,
    pub balances: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub orders: Vec<PendingOrder>,
    #[serde(default)]
    pub fills: Vec<FillRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AbortMarker {
    aborted_seq: u64,
}

/// What a journal file replays to.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<JournalRecord>,
    /// Highest sequence number seen, aborted ones included.
    pub last_seq: u64,
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably append one record. An error means the transaction must not commit.
    async fn append(&self, record: &JournalRecord) -> io::Result<()>;
}

/// In-memory only ledger (no JOURNAL_FILE configured).
pub struct NullJournal;

#[async_trait]
impl Journal for NullJournal {
    async fn append(&self, _record: &JournalRecord) -> io::Result<()> { Ok(()) }
}

pub struct JsonlJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    poisoned: AtomicBool,
}

async fn open_writer(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(w: &mut BufWriter<File>, line: &[u8]) -> io::Result<()> {
    w.write_all(line).await?;
    w.flush().await
}

impl JsonlJournal {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let writer = open_writer(&path).await?;
        info!(path = %path.display(), "journal: opened");
        Ok(Self { path, writer: Mutex::new(writer), poisoned: AtomicBool::new(false) })
    }

    async fn mark_aborted(&self, w: &mut BufWriter<File>, seq: u64) -> io::Result<()> {
        *w = open_writer(&self.path).await?;
        let mut line = b"\n".to_vec();
        serde_json::to_writer(&mut line, &AbortMarker { aborted_seq: seq })?;
        line.push(b'\n');
        write_line(w, &line).await
    }
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&self, record: &JournalRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut w = self.writer.lock().await;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "journal disabled after an unresolved write"));
        }
        let Err(e) = write_line(&mut w, &line).await else {
            return Ok(());
        };
        error!(?e, seq = record.seq, path = %self.path.display(), "journal: write failed, marking record aborted");
        if let Err(mark) = self.mark_aborted(&mut w, record.seq).await {
            self.poisoned.store(true, Ordering::SeqCst);
            error!(?mark, seq = record.seq, "ALERT journal: abort marker not written, refusing further commits");
        }
        Err(e)
    }
}

/// Read every well-formed record that was not aborted; a missing file is an empty journal.
pub async fn read_records(path: &Path) -> io::Result<Replay> {
    let text = match fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
        Err(e) => return Err(e),
    };
    let mut records = Vec::new();
    let mut aborted = HashSet::new();
    let mut last_seq = 0;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(rec) => {
                last_seq = last_seq.max(rec.seq);
                records.push(rec);
            }
            Err(e) => match serde_json::from_str::<AbortMarker>(line) {
                Ok(m) => {
                    last_seq = last_seq.max(m.aborted_seq);
                    aborted.insert(m.aborted_seq);
                }
                Err(_) => warn!(?e, line = lineno + 1, "journal: skip malformed line"),
            },
        }
    }
    if !aborted.is_empty() {
        info!(count = aborted.len(), "journal: dropping aborted records");
        records.retain(|r| r.seq == 0 || !aborted.contains(&r.seq));
    }
    Ok(Replay { records, last_seq })
}
