use crate::error::{ShaleDBError, ShaleDBResult};
use crate::storage::codec::DecodedData;

/// Fixed-width big-endian primitives shared by the page codecs.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> ShaleDBResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(ShaleDBError::Internal(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                1
            )));
        }
        Ok((u8::from_be_bytes([bytes[0]]), 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> ShaleDBResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(ShaleDBError::Internal(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                4
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_i32(data: i32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i32(bytes: &[u8]) -> ShaleDBResult<DecodedData<i32>> {
        if bytes.len() < 4 {
            return Err(ShaleDBError::Internal(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                4
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((i32::from_be_bytes(data), 4))
    }

    /// Length-prefixed byte strings.
    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(CommonCodec::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> ShaleDBResult<DecodedData<Vec<u8>>> {
        let (length, offset) = CommonCodec::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(ShaleDBError::Internal(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        Ok((bytes[offset..offset + length].to_vec(), offset + length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_codec() {
        assert_eq!(
            5u8,
            CommonCodec::decode_u8(&CommonCodec::encode_u8(5u8)).unwrap().0
        );
        assert_eq!(
            5u32,
            CommonCodec::decode_u32(&CommonCodec::encode_u32(5u32))
                .unwrap()
                .0
        );
        assert_eq!(
            -5i32,
            CommonCodec::decode_i32(&CommonCodec::encode_i32(-5i32))
                .unwrap()
                .0
        );
        assert_eq!(
            vec![1u8, 2, 3],
            CommonCodec::decode_bytes(&CommonCodec::encode_bytes(&[1, 2, 3]))
                .unwrap()
                .0
        );
        assert!(CommonCodec::decode_u32(&[0, 1]).is_err());
        assert!(CommonCodec::decode_bytes(&CommonCodec::encode_u32(100)).is_err());
    }
}
