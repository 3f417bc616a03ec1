use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::PAGE_SIZE;
use crate::error::{ShaleDBError, ShaleDBResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::{HashTableBucketPage, HashTableDirectoryPage};

pub struct HashTableDirectoryPageCodec;

impl HashTableDirectoryPageCodec {
    pub fn encode(page: &HashTableDirectoryPage) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(page.global_depth()));
        for idx in 0..page.size() {
            bytes.extend(CommonCodec::encode_i32(page.bucket_page_id(idx)));
            bytes.extend(CommonCodec::encode_u8(page.local_depth(idx) as u8));
        }
        assert!(bytes.len() <= PAGE_SIZE);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> ShaleDBResult<DecodedData<HashTableDirectoryPage>> {
        let mut left = bytes;
        let (global_depth, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];

        let size = 1usize << global_depth;
        let mut bucket_page_ids = Vec::with_capacity(size);
        let mut local_depths = Vec::with_capacity(size);
        for _ in 0..size {
            let (page_id, offset) = CommonCodec::decode_i32(left)?;
            left = &left[offset..];
            let (local_depth, offset) = CommonCodec::decode_u8(left)?;
            left = &left[offset..];
            bucket_page_ids.push(page_id);
            local_depths.push(local_depth);
        }
        Ok((
            HashTableDirectoryPage::from_parts(global_depth, bucket_page_ids, local_depths),
            PAGE_SIZE,
        ))
    }
}

pub struct HashTableBucketPageCodec;

impl HashTableBucketPageCodec {
    /// Bitmaps go first; only readable slots carry a payload, each prefixed
    /// with its slot index so tombstones survive the round trip.
    pub fn encode<K, V>(page: &HashTableBucketPage<K, V>) -> ShaleDBResult<Vec<u8>>
    where
        K: Serialize + Clone + PartialEq,
        V: Serialize + Clone + PartialEq,
    {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(page.max_size()));
        bytes.extend(CommonCodec::encode_bytes(page.occupied_bits()));
        bytes.extend(CommonCodec::encode_bytes(page.readable_bits()));
        for idx in 0..page.max_size() as usize {
            if let Some((key, value)) = page.key_value_at(idx) {
                bytes.extend(CommonCodec::encode_u32(idx as u32));
                bytes.extend(CommonCodec::encode_bytes(&bincode::serialize(key)?));
                bytes.extend(CommonCodec::encode_bytes(&bincode::serialize(value)?));
            }
        }
        if bytes.len() > PAGE_SIZE {
            return Err(ShaleDBError::Storage(format!(
                "bucket page of {} bytes overflows the page size",
                bytes.len()
            )));
        }
        bytes.resize(PAGE_SIZE, 0);
        Ok(bytes)
    }

    pub fn decode<K, V>(bytes: &[u8]) -> ShaleDBResult<DecodedData<HashTableBucketPage<K, V>>>
    where
        K: DeserializeOwned + Clone + PartialEq,
        V: DeserializeOwned + Clone + PartialEq,
    {
        let mut left = bytes;
        let (max_size, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (occupied, offset) = CommonCodec::decode_bytes(left)?;
        left = &left[offset..];
        let (readable, offset) = CommonCodec::decode_bytes(left)?;
        left = &left[offset..];

        let num_readable = readable.iter().map(|b| b.count_ones()).sum::<u32>();
        let mut array: Vec<Option<(K, V)>> = (0..max_size).map(|_| None).collect();
        for _ in 0..num_readable {
            let (idx, offset) = CommonCodec::decode_u32(left)?;
            left = &left[offset..];
            let (key_bytes, offset) = CommonCodec::decode_bytes(left)?;
            left = &left[offset..];
            let (value_bytes, offset) = CommonCodec::decode_bytes(left)?;
            left = &left[offset..];
            array[idx as usize] = Some((
                bincode::deserialize(&key_bytes)?,
                bincode::deserialize(&value_bytes)?,
            ));
        }
        Ok((
            HashTableBucketPage::from_parts(max_size, occupied, readable, array),
            PAGE_SIZE,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_page_roundtrip() {
        let mut directory = HashTableDirectoryPage::new(3);
        directory.incr_global_depth();
        directory.set_bucket_page_id(1, 4);
        directory.incr_local_depth(0);
        directory.incr_local_depth(1);

        let bytes = HashTableDirectoryPageCodec::encode(&directory);
        assert_eq!(bytes.len(), PAGE_SIZE);
        let (decoded, _) = HashTableDirectoryPageCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, directory);
    }

    #[test]
    fn bucket_page_roundtrip_keeps_tombstones() {
        let mut bucket: HashTableBucketPage<u64, String> = HashTableBucketPage::new(8);
        assert!(bucket.insert(1, "one".to_string()));
        assert!(bucket.insert(2, "two".to_string()));
        assert!(bucket.insert(3, "three".to_string()));
        assert!(bucket.remove(&2, &"two".to_string()));

        let bytes = HashTableBucketPageCodec::encode(&bucket).unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let (decoded, _) = HashTableBucketPageCodec::decode::<u64, String>(&bytes).unwrap();

        assert_eq!(decoded.get_value(&1), vec!["one".to_string()]);
        assert_eq!(decoded.get_value(&2), Vec::<String>::new());
        assert_eq!(decoded.get_value(&3), vec!["three".to_string()]);
        // the tombstone in slot 1 is still occupied
        assert!(decoded.is_occupied(1));
        assert!(!decoded.is_readable(1));
        assert_eq!(decoded.num_readable(), 2);
    }
}
