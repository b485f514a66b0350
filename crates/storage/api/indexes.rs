//! The fixed set of named indexes of the store.

/// A named partition of the key-value store.
///
/// The set of indexes is closed at compile time. Each index is backed by its
/// own sub-database in the persistent backend and its own table in the
/// in-memory backend; cache layers key their buffers by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Index {
    /// Miscellaneous chain metadata.
    Main,
    /// Block index records.
    BlockIndex,
    /// Raw block data.
    Blocks,
    /// Transaction records.
    Tx,
    /// Token transaction records.
    Ntp1Tx,
    /// Token name records; a name may resolve to several entries.
    Ntp1TokenNames,
    /// Address to public-key associations; an address may carry several keys.
    AddrsVsPubKeys,
}

impl Index {
    /// Every index, in a stable order.
    pub const ALL: [Index; 7] = [
        Index::Main,
        Index::BlockIndex,
        Index::Blocks,
        Index::Tx,
        Index::Ntp1Tx,
        Index::Ntp1TokenNames,
        Index::AddrsVsPubKeys,
    ];

    /// Name of the backing sub-database / table.
    pub const fn table_name(self) -> &'static str {
        match self {
            Index::Main => "main",
            Index::BlockIndex => "blockindex",
            Index::Blocks => "blocks",
            Index::Tx => "tx",
            Index::Ntp1Tx => "ntp1tx",
            Index::Ntp1TokenNames => "ntp1tokennames",
            Index::AddrsVsPubKeys => "addrsvspubkeys",
        }
    }

    /// Whether a key in this index may map to more than one value.
    pub const fn duplicate_keys_allowed(self) -> bool {
        matches!(self, Index::Ntp1TokenNames | Index::AddrsVsPubKeys)
    }
}
