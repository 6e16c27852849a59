//! A file-backed swap device.
//!
//! The device appends self-describing records to a single file and keeps
//! the swap tuple's metadata (version, TTL state, loader ids, value
//! position) in an in-memory directory, so a read only touches disk for
//! the value bytes. Removes append a short tombstone record. The device
//! does not compact: swap entries are removed on promotion, so the file is
//! reclaimed by deleting it once the cache is torn down.
//!
//! Record layout, big-endian:
//!
//! - flags (u8): tombstone, conflict-version, key-loader and value-loader
//!   presence bits
//! - tombstones carry only: key length (u32), key bytes
//! - live records continue with: type tag (u8), version block, optional
//!   conflict version block, optional key/value loader ids (u64 each),
//!   TTL (i64), expire time (i64), key length (u32), value length (u32),
//!   key bytes, value bytes
//!
//! A version block is topology version (u32), node order (u32), data
//! center id (u8), order (u64).

use std::collections::BTreeMap;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::swap::{SwapEntry, SwapManager};
use crate::value::{CacheKey, TypeTag};
use crate::version::GridVersion;

const TOMBSTONE: u8 = 0b0001;
const HAS_CONFLICT: u8 = 0b0010;
const HAS_KEY_LOADER: u8 = 0b0100;
const HAS_VALUE_LOADER: u8 = 0b1000;

/// Encoded size of a version block.
const VERSION_LEN: usize = 4 + 4 + 1 + 8;

/// Directory state for the latest live record of a key: the whole swap
/// tuple except the value bytes, which stay on disk.
#[derive(Clone, Debug)]
struct SwapSlot {
    value_pos: u64,
    value_len: u32,
    type_tag: TypeTag,
    version: GridVersion,
    ttl: i64,
    expire_time: i64,
    key_loader_id: Option<u64>,
    value_loader_id: Option<u64>,
}

impl SwapSlot {
    fn into_entry(self, key: CacheKey, value_bytes: Vec<u8>) -> SwapEntry {
        SwapEntry {
            key,
            value_bytes,
            type_tag: self.type_tag,
            version: self.version,
            ttl: self.ttl,
            expire_time: self.expire_time,
            key_loader_id: self.key_loader_id,
            value_loader_id: self.value_loader_id,
            offheap_ptr: None,
        }
    }
}

type SwapDir = BTreeMap<Vec<u8>, SwapSlot>;

fn push_version(buf: &mut Vec<u8>, ver: &GridVersion) {
    buf.extend_from_slice(&ver.topology_version.to_be_bytes());
    buf.extend_from_slice(&ver.node_order.to_be_bytes());
    buf.push(ver.data_center_id);
    buf.extend_from_slice(&ver.order.to_be_bytes());
}

/// Encodes a live record and returns it along with a directory slot whose
/// `value_pos` is relative to the record start; the appender shifts it to
/// the absolute file position.
fn encode_entry(entry: &SwapEntry) -> (Vec<u8>, SwapSlot) {
    let key = entry.key.bytes();

    let mut flags = 0u8;
    if entry.version.conflict.is_some() {
        flags |= HAS_CONFLICT;
    }
    if entry.key_loader_id.is_some() {
        flags |= HAS_KEY_LOADER;
    }
    if entry.value_loader_id.is_some() {
        flags |= HAS_VALUE_LOADER;
    }

    let mut buf = Vec::with_capacity(64 + key.len() + entry.value_bytes.len());
    buf.push(flags);
    buf.push(entry.type_tag);
    push_version(&mut buf, &entry.version);
    if let Some(conflict) = &entry.version.conflict {
        push_version(&mut buf, conflict);
    }
    if let Some(id) = entry.key_loader_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    if let Some(id) = entry.value_loader_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(&entry.ttl.to_be_bytes());
    buf.extend_from_slice(&entry.expire_time.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(entry.value_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);

    let value_pos = buf.len() as u64;
    buf.extend_from_slice(&entry.value_bytes);

    let slot = SwapSlot {
        value_pos,
        value_len: entry.value_bytes.len() as u32,
        type_tag: entry.type_tag,
        version: entry.version.clone(),
        ttl: entry.ttl,
        expire_time: entry.expire_time,
        key_loader_id: entry.key_loader_id,
        value_loader_id: entry.value_loader_id,
    };
    (buf, slot)
}

fn encode_tombstone(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + key.len());
    buf.push(TOMBSTONE);
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_i64(r: &mut impl Read) -> std::io::Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

fn read_version(r: &mut impl Read) -> std::io::Result<GridVersion> {
    let topology_version = read_u32(r)?;
    let node_order = read_u32(r)?;
    let data_center_id = read_u8(r)?;
    let order = read_u64(r)?;
    Ok(GridVersion::new(topology_version, order, node_order, data_center_id))
}

/// One record decoded by the recovery scan. Tombstones carry no slot.
struct ScannedRecord {
    key: Vec<u8>,
    next_pos: u64,
    slot: Option<SwapSlot>,
}

/// Decodes the record starting at `pos`, skipping over the value bytes.
/// A record running past `file_len` reads as unexpected EOF, which the
/// caller treats as a torn trailing append.
fn scan_record(
    r: &mut BufReader<&mut std::fs::File>,
    pos: u64,
    file_len: u64,
) -> std::io::Result<ScannedRecord> {
    let flags = read_u8(r)?;

    if flags & TOMBSTONE != 0 {
        let key_len = read_u32(r)?;
        let mut key = vec![0; key_len as usize];
        r.read_exact(&mut key)?;
        return Ok(ScannedRecord { key, next_pos: pos + 5 + key_len as u64, slot: None });
    }

    let type_tag = read_u8(r)?;
    let mut version = read_version(r)?;
    let mut header = 2 + VERSION_LEN;
    if flags & HAS_CONFLICT != 0 {
        version = version.with_conflict(read_version(r)?);
        header += VERSION_LEN;
    }
    let key_loader_id = if flags & HAS_KEY_LOADER != 0 {
        header += 8;
        Some(read_u64(r)?)
    } else {
        None
    };
    let value_loader_id = if flags & HAS_VALUE_LOADER != 0 {
        header += 8;
        Some(read_u64(r)?)
    } else {
        None
    };
    let ttl = read_i64(r)?;
    let expire_time = read_i64(r)?;
    let key_len = read_u32(r)?;
    let value_len = read_u32(r)?;
    header += 8 + 8 + 4 + 4;

    let mut key = vec![0; key_len as usize];
    r.read_exact(&mut key)?;

    let value_pos = pos + header as u64 + key_len as u64;
    if value_pos + value_len as u64 > file_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "swap value runs past end of file",
        ));
    }
    r.seek_relative(value_len as i64)?;

    Ok(ScannedRecord {
        key,
        next_pos: value_pos + value_len as u64,
        slot: Some(SwapSlot {
            value_pos,
            value_len,
            type_tag,
            version,
            ttl,
            expire_time,
            key_loader_id,
            value_loader_id,
        }),
    })
}

struct DeviceInner {
    path: PathBuf,
    file: std::fs::File,
    dir: SwapDir,
}

impl DeviceInner {
    /// Replays the record file into a fresh directory. Tombstones delete
    /// their key; a torn trailing record from an interrupted append is cut
    /// off, keeping everything that replayed cleanly before it.
    fn rebuild(&mut self) -> CResult<SwapDir> {
        let file_len = self.file.metadata()?.len();
        let mut dir = SwapDir::new();
        let mut torn_at = None;

        {
            let mut r = BufReader::new(&mut self.file);
            r.seek(SeekFrom::Start(0))?;
            let mut pos = 0u64;

            while pos < file_len {
                match scan_record(&mut r, pos, file_len) {
                    Ok(ScannedRecord { key, next_pos, slot: Some(slot) }) => {
                        dir.insert(key, slot);
                        pos = next_pos;
                    }
                    Ok(ScannedRecord { key, next_pos, slot: None }) => {
                        dir.remove(&key);
                        pos = next_pos;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                        torn_at = Some(pos);
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(pos) = torn_at {
            log::error!(
                "Dropping torn swap record at offset {} in {}",
                pos,
                self.path.display()
            );
            self.file.set_len(pos)?;
        }

        Ok(dir)
    }

    /// Appends a record, returning its absolute start position.
    fn append(&mut self, record: &[u8]) -> CResult<u64> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(record)?;
        self.file.flush()?;
        Ok(pos)
    }

    fn read_value(&mut self, slot: &SwapSlot) -> CResult<Vec<u8>> {
        let mut bytes = vec![0; slot.value_len as usize];
        self.file.seek(SeekFrom::Start(slot.value_pos))?;
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// A disk-only swap manager over the record file. The off-heap tier is not
/// served by this device, and adopted pointers are rejected.
pub struct FileSwap {
    inner: Mutex<DeviceInner>,
}

impl FileSwap {
    /// Opens or creates a file swap device at the given path, replaying
    /// any existing records. Takes an exclusive lock on the file until
    /// closed, or errors if the lock is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return Err(Error::Internal(format!("{}:{:?}", err, parent.to_str())));
            }
        }

        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;

        let mut inner = DeviceInner { path, file, dir: SwapDir::new() };
        inner.dir = inner.rebuild()?;
        Ok(Self { inner: Mutex::new(inner) })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("swap device poisoned").dir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().expect("swap device poisoned").path.clone()
    }
}

impl SwapManager for FileSwap {
    fn read(
        &self,
        key: &CacheKey,
        _peek_only: bool,
        _include_offheap: bool,
        include_swap: bool,
    ) -> CResult<Option<SwapEntry>> {
        if !include_swap {
            return Ok(None);
        }
        let mut inner = self.inner.lock()?;
        let slot = match inner.dir.get(key.bytes()) {
            Some(slot) => slot.clone(),
            None => return Ok(None),
        };
        let value_bytes = inner.read_value(&slot)?;
        Ok(Some(slot.into_entry(key.clone(), value_bytes)))
    }

    fn read_and_remove(&self, key: &CacheKey) -> CResult<Option<SwapEntry>> {
        let mut inner = self.inner.lock()?;
        let slot = match inner.dir.remove(key.bytes()) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let value_bytes = inner.read_value(&slot)?;
        inner.append(&encode_tombstone(key.bytes()))?;
        Ok(Some(slot.into_entry(key.clone(), value_bytes)))
    }

    fn read_offheap_pointer(&self, _key: &CacheKey) -> CResult<Option<SwapEntry>> {
        Ok(None)
    }

    fn write(&self, entry: SwapEntry) -> CResult<()> {
        if entry.offheap_ptr.is_some() {
            return Err(Error::Value("file swap cannot adopt off-heap pointers".into()));
        }
        let (record, mut slot) = encode_entry(&entry);
        let mut inner = self.inner.lock()?;
        let pos = inner.append(&record)?;
        slot.value_pos += pos;
        inner.dir.insert(entry.key.bytes().to_vec(), slot);
        Ok(())
    }

    /// Flushes a whole eviction batch as one append.
    fn write_batch(&self, entries: Vec<SwapEntry>) -> CResult<()> {
        let mut buf = Vec::new();
        let mut slots = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.offheap_ptr.is_some() {
                return Err(Error::Value("file swap cannot adopt off-heap pointers".into()));
            }
            let (record, mut slot) = encode_entry(entry);
            slot.value_pos += buf.len() as u64;
            buf.extend_from_slice(&record);
            slots.push((entry.key.bytes().to_vec(), slot));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock()?;
        let pos = inner.append(&buf)?;
        for (key, mut slot) in slots {
            slot.value_pos += pos;
            inner.dir.insert(key, slot);
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        if inner.dir.remove(key.bytes()).is_some() {
            inner.append(&encode_tombstone(key.bytes()))?;
        }
        Ok(())
    }

    fn remove_offheap(&self, _key: &CacheKey) -> CResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(key: &CacheKey, bytes: &[u8]) -> SwapEntry {
        SwapEntry {
            key: key.clone(),
            value_bytes: bytes.to_vec(),
            type_tag: 0,
            version: GridVersion::new(1, 3, 1, 0),
            ttl: 500,
            expire_time: 1_500,
            key_loader_id: None,
            value_loader_id: None,
            offheap_ptr: None,
        }
    }

    #[test]
    fn write_read_round_trip() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let swap = FileSwap::new(dir.path().join("swapdb"))?;

        let key = CacheKey::new(b"a".to_vec());
        swap.write(entry(&key, b"one"))?;

        let read = swap.read(&key, false, false, true)?.unwrap();
        assert_eq!(read.value_bytes, b"one".to_vec());
        assert_eq!(read.ttl, 500);
        assert_eq!(read.expire_time, 1_500);
        assert_eq!(read.type_tag, 0);
        assert_eq!(read.version, GridVersion::new(1, 3, 1, 0));
        Ok(())
    }

    #[test]
    fn optional_blocks_survive_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let path = dir.path().join("swapdb");
        let key = CacheKey::new(b"a".to_vec());
        let origin = GridVersion::new(2, 77, 9, 3);
        {
            let swap = FileSwap::new(path.clone())?;
            let mut e = entry(&key, b"dc");
            e.version = GridVersion::new(1, 5, 1, 0).with_conflict(origin.clone());
            e.key_loader_id = Some(11);
            e.value_loader_id = Some(22);
            swap.write(e)?;
        }

        let swap = FileSwap::new(path)?;
        let read = swap.read(&key, false, false, true)?.unwrap();
        assert_eq!(read.version.conflict_version(), &origin);
        assert_eq!(read.version.conflict_version().data_center_id, 3);
        assert_eq!(read.key_loader_id, Some(11));
        assert_eq!(read.value_loader_id, Some(22));
        assert_eq!(read.value_bytes, b"dc".to_vec());
        Ok(())
    }

    #[test]
    fn read_and_remove_leaves_tombstone() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let path = dir.path().join("swapdb");
        {
            let swap = FileSwap::new(path.clone())?;
            let key = CacheKey::new(b"a".to_vec());
            swap.write(entry(&key, b"one"))?;
            assert!(swap.read_and_remove(&key)?.is_some());
            assert!(swap.read_and_remove(&key)?.is_none());
        }

        // Reopen: the tombstone must survive the replay.
        let swap = FileSwap::new(path)?;
        assert!(swap.is_empty());
        Ok(())
    }

    #[test]
    fn latest_record_wins_after_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let path = dir.path().join("swapdb");
        let key = CacheKey::new(b"a".to_vec());
        {
            let swap = FileSwap::new(path.clone())?;
            swap.write(entry(&key, b"one"))?;
            swap.write(entry(&key, b"two"))?;
        }

        let swap = FileSwap::new(path)?;
        let read = swap.read(&key, false, false, true)?.unwrap();
        assert_eq!(read.value_bytes, b"two".to_vec());
        Ok(())
    }

    #[test]
    fn batch_flush_lands_every_entry() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let swap = FileSwap::new(dir.path().join("swapdb"))?;

        let a = CacheKey::new(b"a".to_vec());
        let b = CacheKey::new(b"b".to_vec());
        swap.write_batch(vec![entry(&a, b"one"), entry(&b, b"two")])?;

        assert_eq!(swap.len(), 2);
        assert_eq!(swap.read(&a, false, false, true)?.unwrap().value_bytes, b"one".to_vec());
        assert_eq!(swap.read(&b, false, false, true)?.unwrap().value_bytes, b"two".to_vec());
        Ok(())
    }

    #[test]
    fn torn_trailing_record_is_dropped() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let path = dir.path().join("swapdb");
        let key = CacheKey::new(b"a".to_vec());
        {
            let swap = FileSwap::new(path.clone())?;
            swap.write(entry(&key, b"kept"))?;
        }

        // Model an interrupted append: a live-record flag byte with only a
        // sliver of header behind it.
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[0u8, 7, 1])?;
        }

        let swap = FileSwap::new(path)?;
        assert_eq!(swap.len(), 1);
        let read = swap.read(&key, false, false, true)?.unwrap();
        assert_eq!(read.value_bytes, b"kept".to_vec());

        // The device stays writable after the cut.
        swap.write(entry(&key, b"after"))?;
        assert_eq!(swap.read(&key, false, false, true)?.unwrap().value_bytes, b"after".to_vec());
        Ok(())
    }

    #[test]
    fn rejects_adopted_pointers() -> CResult<()> {
        let dir = tempdir::TempDir::new("swap")?;
        let swap = FileSwap::new(dir.path().join("swapdb"))?;
        let key = CacheKey::new(b"a".to_vec());
        let mut e = entry(&key, b"");
        e.offheap_ptr = Some(7);
        assert!(swap.write(e.clone()).is_err());
        assert!(swap.write_batch(vec![e]).is_err());
        Ok(())
    }
}
