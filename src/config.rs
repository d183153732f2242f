/// Fixed size of one buffer cell, including its forward-link pointer.
pub const CELL_BYTES: usize = 64;

/// Number of bytes in a cell available for payload/hole-list content, after
/// the cell's own forward-link pointer is carved out.
pub const CELL_LEN: usize = CELL_BYTES - std::mem::size_of::<u32>();

/// Cells (and segments) are slab-allocated in groups of this size.
pub const GROUP_LEN: usize = 32;

/// Number of children of one segment node, and the radix of the tree.
pub const NUM_CHILDREN: usize = 128;

/// `shift` always advances by this many bits per tree level (`2^7 == 128`).
pub const SHIFT_STEP: u32 = 7;

/// Width in bits of the `L` (contiguous-prefix length) field of a bin's
/// status word.
pub const L_BITS: u32 = 28;

/// Largest representable contiguous-prefix length / bin offset.
pub const L_MAX: u32 = (1 << L_BITS) - 1;

/// Class id reserved to mean "this is a stream-root or stream-nav node",
/// never a real data-bin class.
pub const STREAM_CLASS_SENTINEL: u32 = 255;

/// Default number of data-bin classes. The JPIP cache model this is drawn
/// from has six meaningful classes (main/tile header merged, precinct,
/// tile, metadata, plus two reserved for higher-level protocol machinery);
/// a round default of 8 leaves room without hard-coding the original's
/// exact count.
pub const DEFAULT_NUM_CLASSES: usize = 8;

/// Upper bound on `Config::num_classes`. Stream-root nodes carry their
/// per-class overlay (`classes[]`, `mark_counts[]`) as fixed-size arrays
/// sized to this constant so that segments stay a uniform, poolable shape;
/// `Config::num_classes` must not exceed it.
pub const MAX_CLASSES: usize = 32;

/// Class index that the tile-header class collapses into, per §4.3's
/// bin-class collapsing rule.
pub const MAIN_HEADER_CLASS: u32 = 0;

/// Class index accepted on input and rewritten to [`MAIN_HEADER_CLASS`]
/// with `bin_id += 1` (reserving bin 0 of the main-header class for the
/// main header itself), per §4.3 and §6.
pub const TILE_HEADER_CLASS: u32 = 1;

/// The metadata-bin class, excluded from the wildcard-class query in
/// `Cache::stream_class_marked(None, stream)` per §4.5.
pub const METADATA_CLASS: u32 = 2;

/// Runtime-tunable knobs for one [`crate::Cache`](crate::cache::Cache)
/// instance.
///
/// Constructed with [`Config::new`] and passed to
/// [`Cache::with_config`](crate::cache::Cache::with_config); fields are
/// public and mutated through builder-style `with_*` setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of distinct data-bin classes addressable in this cache.
    pub num_classes: u32,
    /// Soft memory budget, in bytes. `0` disables auto-trim. Internally
    /// converted to a cell-count threshold by `ceil(bytes / CELL_BYTES)`.
    pub preferred_memory_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_classes: DEFAULT_NUM_CLASSES as u32,
            preferred_memory_limit: 0,
        }
    }
}

impl Config {
    /// Creates a configuration with the cache's documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the number of data-bin classes. Panics if `num_classes`
    /// exceeds [`MAX_CLASSES`].
    pub fn with_num_classes(mut self, num_classes: u32) -> Self {
        assert!(
            (num_classes as usize) <= MAX_CLASSES,
            "num_classes ({num_classes}) exceeds MAX_CLASSES ({MAX_CLASSES})"
        );
        self.num_classes = num_classes;
        self
    }

    /// Overrides the preferred soft memory limit, in bytes.
    pub fn with_preferred_memory_limit(mut self, bytes: u64) -> Self {
        self.preferred_memory_limit = bytes;
        self
    }

    /// Converts [`Config::preferred_memory_limit`] into a cell-count
    /// threshold, `0` meaning "auto-trim disabled".
    pub fn auto_trim_buf_threshold(&self) -> u64 {
        if self.preferred_memory_limit == 0 {
            0
        } else {
            self.preferred_memory_limit.div_ceil(CELL_BYTES as u64)
        }
    }
}
