mod disk_extendible_hash;

pub use disk_extendible_hash::DiskExtendibleHashTable;
