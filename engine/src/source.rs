use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use memmap2::Mmap;

// ===== TRACE SOURCES =====

/// Random-access byte provider for one trace file.
///
/// Reads may suspend independently of the engine (network-backed sources,
/// throttled disks), which is why the coordinators re-check cancellation
/// around every read.
#[async_trait]
pub trait TraceSource: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Read `len` bytes starting at `offset`. Reads past the end are
    /// truncated to the available range.
    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>>;
}

/// Memory-mapped file source. The map stays valid for the lifetime of the
/// session that owns the source.
pub struct FileTraceSource {
    name: String,
    map: Mmap,
}

impl FileTraceSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(FileTraceSource { name, map })
    }
}

#[async_trait]
impl TraceSource for FileTraceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let total = self.map.len() as u64;
        if offset >= total {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(total);
        Ok(self.map[offset as usize..end as usize].to_vec())
    }
}

/// In-memory source for tests: can slow reads down and fail at a scripted
/// offset to exercise cancellation races and read-failure handling.
pub struct MemTraceSource {
    name: String,
    bytes: Vec<u8>,
    read_delay: Option<Duration>,
    fail_at_offset: Option<u64>,
}

impl MemTraceSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        MemTraceSource {
            name: name.into(),
            bytes,
            read_delay: None,
            fail_at_offset: None,
        }
    }

    /// Synthetic source of `size` zero bytes; the simulation engine only
    /// cares about offsets, not contents.
    pub fn zeroed(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, vec![0u8; size as usize])
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }
}

#[async_trait]
impl TraceSource for MemTraceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fail_at) = self.fail_at_offset {
            if offset + len > fail_at {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("scripted read failure at offset {fail_at}"),
                ));
            }
        }
        let total = self.bytes.len() as u64;
        if offset >= total {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(total);
        Ok(self.bytes[offset as usize..end as usize].to_vec())
    }
}
