//! Serialized pipeline cache keys.
//!
//! Every key is a fixed-size `#[repr(C)]` POD buffer whose first 8 bytes are
//! an xxh3 hash of the remainder. The hash prefix is what the cache maps and
//! the per-thread caches bucket on, so equal descriptions serialize to
//! byte-identical buffers and the map hasher never has to walk the key.

use std::hash::{BuildHasherDefault, Hasher};

use bytemuck::{Pod, Zeroable};
use xxhash_rust::xxh3::xxh3_64;

pub const GRAPHICS_KEY_SIZE: usize = 104;
pub const COMPUTE_KEY_SIZE: usize = 16;
pub const RAYTRACE_KEY_SIZE: usize = 896;

/// Scratch capacities per kind; also the upper bound any caller needs.
pub const GRAPHICS_KEY_STORAGE: usize = 128;
pub const COMPUTE_KEY_STORAGE: usize = 64;
pub const RAYTRACE_KEY_STORAGE: usize = 1024;
pub const MAX_KEY_STORAGE: usize = RAYTRACE_KEY_STORAGE;

/// UTF-16 code units reserved per raytrace entry-point name.
pub const ENTRY_NAME_CAPACITY: usize = 48;

/// Number of entry-point name slots in a raytrace key.
pub const RAYTRACE_NAME_SLOTS: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GraphicsKeyData {
    pub hash: u64,
    pub vs_id: i64,
    pub ps_id: i64,
    pub ds_id: i64,
    pub hs_id: i64,
    pub gs_id: i64,
    pub rtv_formats: [i32; 8],
    pub dsv_format: i32,
    pub sample_count: u32,
    pub blend_mode: i8,
    pub fill_mode: i8,
    pub cull_mode: i8,
    pub depth_func: i8,
    pub topology: i8,
    pub render_target_count: i8,
    pub front_counter_clockwise: i8,
    pub multisample_enable: i8,
    pub depth_enable: i8,
    pub depth_write_enable: i8,
    pub _pad0: [u8; 2],
    pub _pad1: u32,
}

const _: () = assert!(std::mem::size_of::<GraphicsKeyData>() == GRAPHICS_KEY_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ComputeKeyData {
    pub hash: u64,
    pub cs_id: i64,
}

const _: () = assert!(std::mem::size_of::<ComputeKeyData>() == COMPUTE_KEY_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RaytraceKeyData {
    pub hash: u64,
    pub item_library_id: i64,
    pub materials_library_id: i64,
    pub entry_names: [[u16; ENTRY_NAME_CAPACITY]; RAYTRACE_NAME_SLOTS],
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
}

const _: () = assert!(std::mem::size_of::<RaytraceKeyData>() == RAYTRACE_KEY_SIZE);

/// Zero-padded UTF-16 copy of `name`. Names longer than the slot are a
/// caller bug; they are truncated in release builds.
pub fn pack_entry_name(name: &str) -> [u16; ENTRY_NAME_CAPACITY] {
    let mut out = [0u16; ENTRY_NAME_CAPACITY];
    let mut len = 0;
    for unit in name.encode_utf16() {
        if len >= ENTRY_NAME_CAPACITY {
            debug_assert!(false, "entry point name {:?} exceeds the name slot", name);
            break;
        }
        out[len] = unit;
        len += 1;
    }
    out
}

/// Hashes `key[8..]` and writes the result over the leading 8 bytes.
pub fn seal_key(key: &mut [u8]) -> u64 {
    debug_assert!(key.len() > 8);
    let hash = xxh3_64(&key[8..]);
    key[..8].copy_from_slice(&hash.to_le_bytes());
    hash
}

/// The precomputed hash a sealed key carries in its first 8 bytes.
pub fn lead_hash(key: &[u8]) -> u64 {
    debug_assert!(key.len() >= 8);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[..8]);
    u64::from_le_bytes(bytes)
}

/// Map hasher that trusts the sealed hash prefix instead of re-hashing the
/// whole key.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyDataHasher {
    state: u64,
}

impl Hasher for KeyDataHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        // Keys are byte slices at least a hash prefix long; shorter writes
        // are the container's length prefix and carry no entropy we need.
        if bytes.len() >= 8 {
            self.state = lead_hash(bytes);
        }
    }

    fn write_usize(&mut self, _: usize) {}

    fn write_u64(&mut self, _: u64) {}
}

pub type KeyHashState = BuildHasherDefault<KeyDataHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_graphics_key(ps_id: i64, dsv_format: i32) -> Vec<u8> {
        let data = GraphicsKeyData {
            hash: 0,
            vs_id: 3,
            ps_id,
            ds_id: -1,
            hs_id: -1,
            gs_id: -1,
            rtv_formats: [28, 0, 0, 0, 0, 0, 0, 0],
            dsv_format,
            sample_count: 1,
            blend_mode: 0,
            fill_mode: 3,
            cull_mode: 3,
            depth_func: 4,
            topology: 2,
            render_target_count: 1,
            front_counter_clockwise: 0,
            multisample_enable: 0,
            depth_enable: 1,
            depth_write_enable: 1,
            _pad0: [0; 2],
            _pad1: 0,
        };
        let mut key = bytemuck::bytes_of(&data).to_vec();
        seal_key(&mut key);
        key
    }

    #[test]
    fn identical_descriptions_serialize_identically() {
        let a = sealed_graphics_key(7, 40);
        let b = sealed_graphics_key(7, 40);
        assert_eq!(a, b);
        assert_eq!(lead_hash(&a), lead_hash(&b));
    }

    #[test]
    fn hash_covers_every_field_after_the_prefix() {
        let a = sealed_graphics_key(7, 40);
        let b = sealed_graphics_key(8, 40);
        let c = sealed_graphics_key(7, 45);
        assert_ne!(lead_hash(&a), lead_hash(&b));
        assert_ne!(lead_hash(&a), lead_hash(&c));
    }

    #[test]
    fn map_hasher_uses_the_sealed_prefix() {
        use std::hash::{BuildHasher, Hash};

        let key = sealed_graphics_key(9, 0);
        let state = KeyHashState::default();
        let mut hasher = state.build_hasher();
        key.as_slice().hash(&mut hasher);
        assert_eq!(hasher.finish(), lead_hash(&key));
    }

    #[test]
    fn entry_names_are_zero_padded() {
        let packed = pack_entry_name("RayGen");
        assert_eq!(packed[..6], "RayGen".encode_utf16().collect::<Vec<_>>()[..]);
        assert!(packed[6..].iter().all(|&u| u == 0));
    }

    #[test]
    fn compute_keys_are_two_words() {
        let data = ComputeKeyData { hash: 0, cs_id: 42 };
        let mut key = bytemuck::bytes_of(&data).to_vec();
        let hash = seal_key(&mut key);
        assert_eq!(key.len(), COMPUTE_KEY_SIZE);
        assert_eq!(lead_hash(&key), hash);
    }
}
