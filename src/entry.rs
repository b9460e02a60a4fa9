//! Records exchanged with the [`EntryStore`](crate::EntryStore).
//!
//! Both records use a small length-prefixed encoding: a one byte type tag,
//! then big-endian `u32` lengths in front of every variable sized field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CacheError, Result};

const BODY_TAG: u8 = 100;
const HEADER_TAG: u8 = 101;

/// Response headers plus the authoritative length of the cached body.
///
/// Written once, after every partition of the body, and never edited. A later
/// insert under the same key replaces it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderEntry {
    pub headers: Vec<(String, String)>,
    pub total_body_size: u64,
}

/// One contiguous slice of a cached body. Every partition of a body holds
/// exactly `partition_size` bytes except possibly the last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyPartition {
    pub bytes: Bytes,
}

impl HeaderEntry {
    pub fn new(headers: Vec<(String, String)>, total_body_size: u64) -> Self {
        HeaderEntry { headers, total_body_size }
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Result<Bytes> {
        const KIND: &str = "header";
        let strings: usize = self.headers.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
        let mut buf = BytesMut::with_capacity(1 + 4 + strings + 8);
        buf.put_u8(HEADER_TAG);
        put_len(&mut buf, self.headers.len(), KIND)?;
        for (name, value) in &self.headers {
            put_str(&mut buf, name, KIND)?;
            put_str(&mut buf, value, KIND)?;
        }
        buf.put_u64(self.total_body_size);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        const KIND: &str = "header";
        expect_tag(&mut buf, HEADER_TAG, KIND)?;
        let count = get_u32(&mut buf, KIND)? as usize;
        // every pair needs at least its two length prefixes
        if count > buf.remaining() / 8 {
            return Err(CacheError::decode(KIND, format!("{count} headers cannot fit")));
        }
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let name = get_str(&mut buf, KIND)?;
            let value = get_str(&mut buf, KIND)?;
            headers.push((name, value));
        }
        if buf.remaining() != 8 {
            return Err(CacheError::decode(
                KIND,
                format!("expected 8 trailing bytes for body size, found {}", buf.remaining()),
            ));
        }
        let total_body_size = buf.get_u64();
        Ok(HeaderEntry { headers, total_body_size })
    }
}

impl BodyPartition {
    pub fn new(bytes: Bytes) -> Self {
        BodyPartition { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(1 + 4 + self.bytes.len());
        buf.put_u8(BODY_TAG);
        put_len(&mut buf, self.bytes.len(), "body")?;
        buf.put_slice(&self.bytes);
        Ok(buf.freeze())
    }

    /// Decodes without copying: the partition shares the value's buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        const KIND: &str = "body";
        expect_tag(&mut buf, BODY_TAG, KIND)?;
        let len = get_u32(&mut buf, KIND)? as usize;
        if buf.remaining() != len {
            return Err(CacheError::decode(
                KIND,
                format!("length prefix {len} but {} bytes follow", buf.remaining()),
            ));
        }
        Ok(BodyPartition { bytes: buf })
    }
}

fn put_len(buf: &mut BytesMut, len: usize, kind: &'static str) -> Result<()> {
    let prefix = u32::try_from(len).map_err(|_| CacheError::Encode { kind, len })?;
    buf.put_u32(prefix);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str, kind: &'static str) -> Result<()> {
    put_len(buf, s.len(), kind)?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn expect_tag(buf: &mut Bytes, tag: u8, kind: &'static str) -> Result<()> {
    if !buf.has_remaining() {
        return Err(CacheError::decode(kind, "empty record"));
    }
    match buf.get_u8() {
        t if t == tag => Ok(()),
        t => Err(CacheError::decode(kind, format!("unexpected type tag {t}"))),
    }
}

fn get_u32(buf: &mut Bytes, kind: &'static str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(CacheError::decode(kind, "truncated length prefix"));
    }
    Ok(buf.get_u32())
}

fn get_str(buf: &mut Bytes, kind: &'static str) -> Result<String> {
    let len = get_u32(buf, kind)? as usize;
    if buf.remaining() < len {
        return Err(CacheError::decode(kind, "truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| CacheError::decode(kind, e.to_string()))
}
