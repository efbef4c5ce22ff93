use serde::{Deserialize, Serialize};

// ===== CONFIG TYPES =====

/// Engine tuning configuration, persisted as TOML alongside the host
/// application's own settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub app: AppSection,
    pub streaming: StreamingSection,
    pub cache: CacheSection,
    pub scheduling: SchedulingSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            app: AppSection::default(),
            streaming: StreamingSection::default(),
            cache: CacheSection::default(),
            scheduling: SchedulingSection::default(),
        }
    }
}

// AppSection carries configuration metadata, primarily for versioning.
// The version field enables config migration when the format changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppSection {
    pub version: String,
}

impl AppSection {
    /// Current configuration format version
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn is_supported_version(&self) -> bool {
        matches!(self.version.as_str(), "1.0.0")
    }

    pub fn needs_migration(&self) -> bool {
        self.version != Self::CURRENT_VERSION
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamingSection {
    /// Chunk size used when streaming the trace file into the engine.
    pub chunk_bytes: u64,
}

impl StreamingSection {
    pub const DEFAULT_CHUNK_BYTES: u64 = 32 * 1024 * 1024;
    const MIN_CHUNK_BYTES: u64 = 4 * 1024;
    const MAX_CHUNK_BYTES: u64 = 512 * 1024 * 1024;
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            chunk_bytes: Self::DEFAULT_CHUNK_BYTES,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheSection {
    /// Maximum number of cached query results, evicted least-recently-used.
    pub max_entries: usize,
    /// Extra fetch range on each side of a requested window, in multiples
    /// of the window width, so small pans hit the cache.
    pub pad_factor: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 10,
            pad_factor: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulingSection {
    /// Quiet period before an accumulated viewport request is issued.
    pub debounce_ms: u64,
    /// Minimum interval between issued fetches for one query stream.
    pub throttle_ms: u64,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            throttle_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Validate loaded values and clamp anything out of range, returning a
    /// warning per correction so callers can log or persist the fixes.
    pub fn validate_and_fix(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.app.needs_migration() {
            warnings.push(format!(
                "config version '{}' migrated to '{}'",
                self.app.version,
                AppSection::CURRENT_VERSION
            ));
            self.app.version = AppSection::CURRENT_VERSION.to_string();
        }

        if self.streaming.chunk_bytes < StreamingSection::MIN_CHUNK_BYTES
            || self.streaming.chunk_bytes > StreamingSection::MAX_CHUNK_BYTES
        {
            warnings.push(format!(
                "streaming.chunk_bytes {} out of range, reset to {}",
                self.streaming.chunk_bytes,
                StreamingSection::DEFAULT_CHUNK_BYTES
            ));
            self.streaming.chunk_bytes = StreamingSection::DEFAULT_CHUNK_BYTES;
        }

        if self.cache.max_entries == 0 {
            warnings.push("cache.max_entries 0 reset to 10".to_string());
            self.cache.max_entries = 10;
        }

        if !self.cache.pad_factor.is_finite() || self.cache.pad_factor < 0.0 {
            warnings.push(format!(
                "cache.pad_factor {} invalid, reset to 1.0",
                self.cache.pad_factor
            ));
            self.cache.pad_factor = 1.0;
        }

        if self.scheduling.debounce_ms > 5_000 {
            warnings.push(format!(
                "scheduling.debounce_ms {} too large, reset to 50",
                self.scheduling.debounce_ms
            ));
            self.scheduling.debounce_ms = 50;
        }

        if self.scheduling.throttle_ms > 60_000 {
            warnings.push(format!(
                "scheduling.throttle_ms {} too large, reset to 250",
                self.scheduling.throttle_ms
            ));
            self.scheduling.throttle_ms = 250;
        }

        warnings
    }
}
