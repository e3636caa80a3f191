use std::num::NonZeroU32;

/// Rows fetched per round trip when no batch size is given, i.e., by a plain
/// `FETCH FORWARD`.
pub const DEFAULT_BATCH_SIZE: NonZeroU32 = match NonZeroU32::new(1) {
    Some(size) => size,
    None => unreachable!(),
};

/// Prefix of the generated cursor names.
pub const CURSOR_NAME_PREFIX: &str = "cursor_";

/// Maximum length, in bytes, of a PostgreSQL identifier (`NAMEDATALEN - 1`).
pub const IDENTIFIER_SIZE: usize = 63;

/// Options for opening a [`CursorStream`](crate::cursor::CursorStream).
#[derive(Debug, Clone)]
pub struct StreamOpts {
    pub(crate) batch_size: Option<NonZeroU32>,
    pub(crate) cursor_name: Option<String>,
    pub(crate) check_ordering: bool,
}

impl StreamOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many rows each `FETCH FORWARD` requests.
    pub fn batch_size(mut self, batch_size: NonZeroU32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Uses the given cursor name instead of a generated one.
    ///
    /// The caller must ensure no other open cursor of the same session uses
    /// this name.
    pub fn cursor_name(mut self, name: impl Into<String>) -> Self {
        self.cursor_name = Some(name.into());
        self
    }

    /// Enables or disables the detection of non-contiguous parent rows in
    /// joined streams. It is enabled by default.
    ///
    /// Detection remembers the key of every emitted parent, so a joined
    /// stream's memory grows with its number of parents rather than staying
    /// bounded by its largest group. Disable it for streams with a very large
    /// number of parents if the query ordering is known to be correct; rows
    /// of a parent that aren't contiguous are then silently emitted as
    /// several incomplete groups. Flat streams never remember keys.
    pub fn check_ordering(mut self, enabled: bool) -> Self {
        self.check_ordering = enabled;
        self
    }
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            batch_size: None,
            cursor_name: None,
            check_ordering: true,
        }
    }
}
