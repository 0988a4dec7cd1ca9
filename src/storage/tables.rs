use redb::TableDefinition;

/// File records: file id -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Owner index: owner id -> msgpack Vec of file ids
pub const OWNER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("owner_files");

/// Shard identity written on first open: "shard_index" and "shard_count"
pub const SHARD_META: TableDefinition<&str, u64> = TableDefinition::new("shard_meta");
