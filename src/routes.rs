//! Host-keyed routing decisions with wildcard-suffix matching and
//! copy-on-signal persistence.
//!
//! Keys are ordered by comparing bytes from the end of the host toward the
//! front, which clusters suffix-sharing hosts together; a single lower-bound
//! seek then answers both the exact and the wildcard match question. A key
//! whose first character is `*` matches any host that ends with the rest of
//! it (including the bare suffix itself). A `*` anywhere else is a literal.

use crate::common::Backend;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handlers addressable from the persisted route file, by name.
pub type BackendMap = HashMap<String, Arc<dyn Backend>>;

/// A host pattern, ordered reverse-lexicographically with the wildcard rule
/// folded into the comparison.
#[derive(Debug, Clone)]
pub struct HostKey(String);

impl HostKey {
    pub fn new(host: &str) -> Self {
        Self(host.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn compare_hosts(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (an, bn) = (a.len(), b.len());
    let mut i = 1;
    while i <= an && i <= bn {
        let (ab, bb) = (a[an - i], b[bn - i]);
        if ab != bb {
            if i == an && ab == b'*' {
                return Ordering::Equal;
            }
            if i == bn && bb == b'*' {
                return Ordering::Equal;
            }
            return ab.cmp(&bb);
        }
        i += 1;
    }
    // One key is a suffix of the other. They only match when the longer is
    // the shorter plus a leading wildcard; a plain strict suffix sorts lower.
    if an == bn {
        return Ordering::Equal;
    }
    if an == bn + 1 && a[0] == b'*' {
        return Ordering::Equal;
    }
    if bn == an + 1 && b[0] == b'*' {
        return Ordering::Equal;
    }
    an.cmp(&bn)
}

impl Ord for HostKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_hosts(&self.0, &other.0)
    }
}

impl PartialOrd for HostKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HostKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HostKey {}

/// A routing decision: the serializable backend name plus the live handler.
/// Entries with an empty name are session-only and never persisted.
#[derive(Clone)]
pub struct RouteEntry {
    pub name: String,
    pub backend: Arc<dyn Backend>,
}

struct Saver {
    signal: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

struct TableInner {
    entries: RwLock<BTreeMap<HostKey, RouteEntry>>,
    saver: Mutex<Option<Saver>>,
    saves: AtomicU64,
}

/// The host-to-backend decision table. Cloning yields another handle onto
/// the same table.
#[derive(Clone)]
pub struct RouteTable {
    inner: Arc<TableInner>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: RwLock::new(BTreeMap::new()),
                saver: Mutex::new(None),
                saves: AtomicU64::new(0),
            }),
        }
    }

    /// Find the backend responsible for `host`, honoring wildcard suffixes.
    pub fn lookup(&self, host: &str) -> Option<RouteEntry> {
        let key = HostKey::new(host);
        let entries = self.inner.entries.read().expect("route table poisoned");
        let (candidate, entry) = entries.range(key.clone()..).next()?;
        if *candidate == key {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Insert or replace the decision for `host`. A non-empty `name` marks
    /// the entry persistent and nudges the save worker.
    pub fn set(&self, host: &str, name: &str, backend: Arc<dyn Backend>) {
        {
            let mut entries = self.inner.entries.write().expect("route table poisoned");
            entries.insert(
                HostKey::new(host),
                RouteEntry {
                    name: name.to_string(),
                    backend,
                },
            );
        }

        if !name.is_empty() {
            let saver = self.inner.saver.lock().expect("saver slot poisoned");
            if let Some(saver) = saver.as_ref() {
                // Single-slot signal: a full channel means a save is already
                // owed, so rapid mutations coalesce.
                let _ = saver.signal.try_send(());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().expect("route table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize every named entry, one `name\thost` line each, in key order.
    fn render(&self) -> String {
        let entries = self.inner.entries.read().expect("route table poisoned");
        let mut out = String::new();
        for (key, entry) in entries.iter() {
            if !entry.name.is_empty() {
                out.push_str(&entry.name);
                out.push('\t');
                out.push_str(key.as_str());
                out.push('\n');
            }
        }
        out
    }

    /// Write the table to `w`; returns the number of bytes emitted.
    pub async fn save<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<usize> {
        let payload = self.render();
        w.write_all(payload.as_bytes()).await?;
        Ok(payload.len())
    }

    /// Load entries from `r`, resolving backend names through `backends`.
    /// Tolerates the two columns being swapped; malformed or unresolvable
    /// lines are logged and skipped.
    pub async fn load<R: AsyncBufRead + Unpin>(
        &self,
        r: R,
        backends: &BackendMap,
    ) -> std::io::Result<()> {
        let mut lines = r.lines();
        let mut parsed = Vec::new();
        while let Some(line) = lines.next_line().await? {
            parsed.push(line);
        }

        let mut entries = self.inner.entries.write().expect("route table poisoned");
        for line in parsed {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let &[first, second] = fields.as_slice() else {
                log::warn!("failed to parse route line: {}", line);
                continue;
            };
            if let Some(backend) = backends.get(first) {
                entries.insert(
                    HostKey::new(second),
                    RouteEntry {
                        name: first.to_string(),
                        backend: backend.clone(),
                    },
                );
            } else if let Some(backend) = backends.get(second) {
                entries.insert(
                    HostKey::new(first),
                    RouteEntry {
                        name: second.to_string(),
                        backend: backend.clone(),
                    },
                );
            } else {
                log::warn!("no handler for route line: {}", line);
            }
        }
        Ok(())
    }

    /// Install a background save worker flushing to `file` whenever the
    /// table changes. Passing `None` stops and joins the current worker.
    pub async fn auto_save_to(&self, file: Option<File>) {
        let previous = self.inner.saver.lock().expect("saver slot poisoned").take();
        if let Some(saver) = previous {
            drop(saver.signal);
            let _ = saver.worker.await;
        }

        let Some(mut file) = file else { return };
        let (signal, mut wakeups) = mpsc::channel(1);
        let table = self.clone();
        let worker = tokio::spawn(async move {
            while wakeups.recv().await.is_some() {
                table.inner.saves.fetch_add(1, AtomicOrdering::Relaxed);
                if let Err(e) = table.flush_to(&mut file).await {
                    log::warn!("route file save failed: {}", e);
                }
            }
        });
        *self.inner.saver.lock().expect("saver slot poisoned") = Some(Saver { signal, worker });
    }

    async fn flush_to(&self, file: &mut File) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(0)).await?;
        let written = self.save(file).await?;
        file.flush().await?;
        file.sync_data().await?;
        file.set_len(written as u64).await?;
        Ok(())
    }

    /// How many times the save worker has run. Useful for observing
    /// coalescing behavior.
    pub fn save_count(&self) -> u64 {
        self.inner.saves.load(AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_order_clusters_suffixes() {
        assert_eq!(compare_hosts("a.com", "a.com"), Ordering::Equal);
        assert_eq!(compare_hosts("b.com", "a.com"), Ordering::Greater);
        assert_eq!(compare_hosts("a.com", "a.net"), Ordering::Less);
    }

    #[test]
    fn wildcard_matches_any_prefix() {
        assert_eq!(
            compare_hosts("*example.com", "sub.example.com"),
            Ordering::Equal
        );
        assert_eq!(
            compare_hosts("www.internal.corp", "*internal.corp"),
            Ordering::Equal
        );
        // The bare suffix itself is matched too.
        assert_eq!(compare_hosts("*example.com", "example.com"), Ordering::Equal);
    }

    #[test]
    fn strict_suffix_without_wildcard_is_not_equal() {
        assert_ne!(
            compare_hosts("example.com", "sub.example.com"),
            Ordering::Equal
        );
        assert_eq!(compare_hosts("example.com", "sub.example.com"), Ordering::Less);
    }

    #[test]
    fn wildcard_must_lead() {
        assert_ne!(compare_hosts("ex*ample.com", "exXample.com"), Ordering::Equal);
        assert_ne!(compare_hosts("*ab.com", ".com"), Ordering::Equal);
    }
}
