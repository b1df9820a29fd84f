//! Raw composite records a boxed [`crate::value::Value`] points into.
//!
//! These are plain, C-layout structs written directly into arena bytes by
//! the builder (`builder.rs`); `value.rs`'s inspectors read them back
//! through raw pointers. None of this is meant to be safe on its own —
//! every method here trusts that the pointer came from the matching
//! `write` call and that the owning tag is still live.

use std::ptr;

use crate::value::Value;

/// `len` bytes of UTF-8 content followed by a trailing NUL (not counted in
/// `len`, not part of the content hash).
#[repr(C)]
pub struct StringRecord {
    length: u64,
}

impl StringRecord {
    pub const ALIGN: usize = std::mem::align_of::<u64>();

    pub fn content_size(byte_len: usize) -> usize {
        std::mem::size_of::<u64>() + byte_len + 1
    }

    /// # Safety
    /// `dst` must be writable for `content_size(bytes.len())` bytes, aligned
    /// to `ALIGN`.
    pub unsafe fn write(dst: *mut u8, bytes: &[u8]) -> *const StringRecord {
        unsafe {
            ptr::write_unaligned(dst.cast::<u64>(), bytes.len() as u64);
            let body = dst.add(8);
            ptr::copy_nonoverlapping(bytes.as_ptr(), body, bytes.len());
            *body.add(bytes.len()) = 0u8;
            dst.cast::<StringRecord>()
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn len(&self) -> usize {
        self.length as usize
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn content_bytes(&self) -> &[u8] {
        unsafe {
            let body = (self as *const Self).cast::<u8>().add(8);
            std::slice::from_raw_parts(body, self.length as usize)
        }
    }

    /// # Safety
    /// `self` must have been produced by `write` from valid UTF-8.
    pub unsafe fn as_str(&self) -> &str {
        unsafe { std::str::from_utf8_unchecked(self.content_bytes()) }
    }
}

/// `length` child [`Value`] words, stored inline in order.
#[repr(C)]
pub struct SequenceRecord {
    length: u64,
}

impl SequenceRecord {
    pub const ALIGN: usize = std::mem::align_of::<u64>();

    pub fn content_size(elem_count: usize) -> usize {
        std::mem::size_of::<u64>() + elem_count * std::mem::size_of::<u64>()
    }

    /// # Safety
    /// `dst` must be writable for `content_size(elems.len())` bytes, aligned
    /// to `ALIGN`.
    pub unsafe fn write(dst: *mut u8, elems: &[Value]) -> *const SequenceRecord {
        unsafe {
            ptr::write_unaligned(dst.cast::<u64>(), elems.len() as u64);
            let body = dst.add(8).cast::<u64>();
            for (i, v) in elems.iter().enumerate() {
                ptr::write_unaligned(body.add(i), v.to_bits());
            }
            dst.cast::<SequenceRecord>()
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn len(&self) -> usize {
        self.length as usize
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn get(&self, index: usize) -> Option<Value> {
        unsafe {
            if index >= self.length as usize {
                return None;
            }
            let body = (self as *const Self).cast::<u8>().add(8).cast::<u64>();
            Some(Value::from_bits(ptr::read_unaligned(body.add(index))))
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn as_bits_slice(&self) -> &[u64] {
        unsafe {
            let body = (self as *const Self).cast::<u8>().add(8).cast::<u64>();
            std::slice::from_raw_parts(body, self.length as usize)
        }
    }
}

/// `count` (key, value) pairs, stored inline in insertion order.
#[repr(C)]
pub struct MappingRecord {
    count: u64,
}

impl MappingRecord {
    pub const ALIGN: usize = std::mem::align_of::<u64>();
    const PAIR_SIZE: usize = 2 * std::mem::size_of::<u64>();

    pub fn content_size(pair_count: usize) -> usize {
        std::mem::size_of::<u64>() + pair_count * Self::PAIR_SIZE
    }

    /// # Safety
    /// `dst` must be writable for `content_size(pairs.len())` bytes, aligned
    /// to `ALIGN`.
    pub unsafe fn write(dst: *mut u8, pairs: &[(Value, Value)]) -> *const MappingRecord {
        unsafe {
            ptr::write_unaligned(dst.cast::<u64>(), pairs.len() as u64);
            let body = dst.add(8).cast::<u64>();
            for (i, (k, v)) in pairs.iter().enumerate() {
                ptr::write_unaligned(body.add(i * 2), k.to_bits());
                ptr::write_unaligned(body.add(i * 2 + 1), v.to_bits());
            }
            dst.cast::<MappingRecord>()
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn len(&self) -> usize {
        self.count as usize
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn pair_at(&self, index: usize) -> (Value, Value) {
        unsafe {
            let body = (self as *const Self).cast::<u8>().add(8).cast::<u64>();
            let k = ptr::read_unaligned(body.add(index * 2));
            let v = ptr::read_unaligned(body.add(index * 2 + 1));
            (Value::from_bits(k), Value::from_bits(v))
        }
    }

    /// Byte-equality lookup only; the persistent update engine falls back to
    /// structural comparison for non-dedup builders.
    ///
    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn get(&self, key: Value) -> Option<Value> {
        unsafe {
            for i in 0..self.len() {
                let (k, v) = self.pair_at(i);
                if k.to_bits() == key.to_bits() {
                    return Some(v);
                }
            }
            None
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        (0..unsafe { self.len() }).map(move |i| unsafe { self.pair_at(i) })
    }
}

/// An anchor/alias: a name string plus an optional target value.
#[repr(C)]
pub struct AliasRecord {
    name_ptr: u64,
    has_target: u64,
    target: u64,
}

impl AliasRecord {
    pub const ALIGN: usize = std::mem::align_of::<u64>();

    pub fn content_size() -> usize {
        std::mem::size_of::<Self>()
    }

    /// # Safety
    /// `dst` must be writable for `content_size()` bytes, aligned to
    /// `ALIGN`. `name` must outlive the returned record (same tag, or a
    /// longer-lived one).
    pub unsafe fn write(
        dst: *mut u8,
        name: *const StringRecord,
        target: Option<Value>,
    ) -> *const AliasRecord {
        unsafe {
            let rec = dst.cast::<AliasRecord>();
            ptr::write_unaligned(dst.cast::<u64>(), name as u64);
            ptr::write_unaligned(
                dst.add(8).cast::<u64>(),
                if target.is_some() { 1 } else { 0 },
            );
            ptr::write_unaligned(
                dst.add(16).cast::<u64>(),
                target.map(Value::to_bits).unwrap_or(0),
            );
            rec
        }
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn name(&self) -> *const StringRecord {
        self.name_ptr as *const StringRecord
    }

    /// # Safety
    /// `self` must have been produced by `write`.
    pub unsafe fn target(&self) -> Option<Value> {
        if self.has_target != 0 {
            Some(Value::from_bits(self.target))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_record_roundtrip() {
        let bytes = b"hello";
        let mut buf = vec![0u8; StringRecord::content_size(bytes.len())];
        let rec = unsafe { StringRecord::write(buf.as_mut_ptr(), bytes) };
        unsafe {
            assert_eq!((*rec).len(), 5);
            assert_eq!((*rec).as_str(), "hello");
        }
    }

    #[test]
    fn sequence_record_roundtrip() {
        let elems = [
            Value::int_inline(1).unwrap(),
            Value::int_inline(2).unwrap(),
            Value::int_inline(3).unwrap(),
        ];
        let mut buf = vec![0u8; SequenceRecord::content_size(elems.len())];
        let rec = unsafe { SequenceRecord::write(buf.as_mut_ptr(), &elems) };
        unsafe {
            assert_eq!((*rec).len(), 3);
            assert_eq!((*rec).get(0).unwrap().as_int(0), 1);
            assert_eq!((*rec).get(2).unwrap().as_int(0), 3);
            assert!((*rec).get(3).is_none());
        }
    }

    #[test]
    fn mapping_record_preserves_insertion_order() {
        let a = Value::int_inline(1).unwrap();
        let b = Value::int_inline(2).unwrap();
        let pairs = [(a, Value::int_inline(10).unwrap()), (b, Value::int_inline(20).unwrap())];
        let mut buf = vec![0u8; MappingRecord::content_size(pairs.len())];
        let rec = unsafe { MappingRecord::write(buf.as_mut_ptr(), &pairs) };
        unsafe {
            assert_eq!((*rec).len(), 2);
            assert_eq!((*rec).get(a).unwrap().as_int(0), 10);
            assert_eq!((*rec).get(b).unwrap().as_int(0), 20);
            let order: Vec<_> = (*rec).pairs().map(|(k, _)| k.as_int(0)).collect();
            assert_eq!(order, vec![1, 2]);
        }
    }
}
