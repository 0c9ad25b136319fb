//! Small byte-buffer helpers shared by the record codec and the paged
//! storage backends.

/// Extract a little-endian `u64` from `data` at `off`.
pub fn getu64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Store a little-endian `u64` into `data` at `off`.
pub fn setu64(data: &mut [u8], off: usize, val: u64) {
    data[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Extract a little-endian `u32` from `data` at `off`.
pub fn getu32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

/// Store a little-endian `u32` into `data` at `off`.
pub fn setu32(data: &mut [u8], off: usize, val: u32) {
    data[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Extract a little-endian `i64` from `data` at `off`.
pub fn geti64(data: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Store a little-endian `i64` into `data` at `off`.
pub fn seti64(data: &mut [u8], off: usize, val: i64) {
    data[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Extract a little-endian `f64` from `data` at `off`.
pub fn getf64(data: &[u8], off: usize) -> f64 {
    f64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Store a little-endian `f64` into `data` at `off`.
pub fn setf64(data: &mut [u8], off: usize, val: f64) {
    data[off..off + 8].copy_from_slice(&val.to_le_bytes());
}
