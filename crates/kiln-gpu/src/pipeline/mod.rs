//! Pipeline descriptions and the caches that resolve them.
//!
//! A description is a plain-data snapshot of everything that feeds a native
//! pipeline build: shader content ids and blobs plus fixed-function state.
//! Descriptions serialize to fixed-size keys (see [`key`]) and resolve
//! through a per-kind [`PipelineCache`] fronted by per-recorder
//! [`LocalPipelineCache`] lookasides.

pub mod cache;
pub mod key;
pub mod local;

pub use cache::{CachedPipeline, LocalPipelineCache, PipelineCache, UNUSED_AGE_THRESHOLD};

use crate::native::{NativeDevice, NativePipeline, PipelineKind};
use crate::shader::{ShaderBlob, INVALID_CONTENTS_ID};

use key::{
    ComputeKeyData, GraphicsKeyData, RaytraceKeyData, COMPUTE_KEY_SIZE, COMPUTE_KEY_STORAGE,
    ENTRY_NAME_CAPACITY, GRAPHICS_KEY_SIZE, GRAPHICS_KEY_STORAGE, RAYTRACE_KEY_SIZE,
    RAYTRACE_KEY_STORAGE, RAYTRACE_NAME_SLOTS,
};

/// A buildable pipeline description.
///
/// `write_key` serializes the description into `out` with the leading 8
/// bytes zeroed; the cache seals the hash prefix afterwards. `build` may be
/// called from any thread and must not touch shared caches.
pub trait PipelineDesc {
    const KIND: PipelineKind;
    const KEY_SIZE: usize;
    const KEY_STORAGE: usize;

    fn write_key(&self, out: &mut [u8]) -> usize;
    fn build(&self, native: &NativeDevice) -> Option<NativePipeline>;
}

/// Graphics pipeline description. Enum-typed state arrives from the recorder
/// already narrowed to its wire encoding.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub vs_id: i64,
    pub ps_id: i64,
    pub ds_id: i64,
    pub hs_id: i64,
    pub gs_id: i64,
    pub vs_blob: Option<ShaderBlob>,
    pub ps_blob: Option<ShaderBlob>,
    pub ds_blob: Option<ShaderBlob>,
    pub hs_blob: Option<ShaderBlob>,
    pub gs_blob: Option<ShaderBlob>,
    pub rtv_formats: [i32; 8],
    pub dsv_format: i32,
    pub sample_count: u32,
    pub render_target_count: i8,
    pub blend_mode: i8,
    pub fill_mode: i8,
    pub cull_mode: i8,
    pub depth_func: i8,
    pub topology: i8,
    pub front_counter_clockwise: bool,
    pub multisample_enable: bool,
    pub depth_enable: bool,
    pub depth_write_enable: bool,
}

impl GraphicsPipelineDesc {
    /// Drops every resolved shader so the next item re-resolves them.
    pub fn invalidate_shaders(&mut self) {
        self.vs_id = INVALID_CONTENTS_ID;
        self.ps_id = INVALID_CONTENTS_ID;
        self.ds_id = INVALID_CONTENTS_ID;
        self.hs_id = INVALID_CONTENTS_ID;
        self.gs_id = INVALID_CONTENTS_ID;
        self.vs_blob = None;
        self.ps_blob = None;
        self.ds_blob = None;
        self.hs_blob = None;
        self.gs_blob = None;
    }
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            vs_id: INVALID_CONTENTS_ID,
            ps_id: INVALID_CONTENTS_ID,
            ds_id: INVALID_CONTENTS_ID,
            hs_id: INVALID_CONTENTS_ID,
            gs_id: INVALID_CONTENTS_ID,
            vs_blob: None,
            ps_blob: None,
            ds_blob: None,
            hs_blob: None,
            gs_blob: None,
            rtv_formats: [0; 8],
            dsv_format: 0,
            sample_count: 1,
            render_target_count: 0,
            blend_mode: 0,
            fill_mode: 0,
            cull_mode: 0,
            depth_func: 0,
            topology: 0,
            front_counter_clockwise: false,
            multisample_enable: false,
            depth_enable: false,
            depth_write_enable: false,
        }
    }
}

impl PipelineDesc for GraphicsPipelineDesc {
    const KIND: PipelineKind = PipelineKind::Graphics;
    const KEY_SIZE: usize = GRAPHICS_KEY_SIZE;
    const KEY_STORAGE: usize = GRAPHICS_KEY_STORAGE;

    fn write_key(&self, out: &mut [u8]) -> usize {
        let data = GraphicsKeyData {
            hash: 0,
            vs_id: self.vs_id,
            ps_id: self.ps_id,
            ds_id: self.ds_id,
            hs_id: self.hs_id,
            gs_id: self.gs_id,
            rtv_formats: self.rtv_formats,
            dsv_format: self.dsv_format,
            sample_count: self.sample_count,
            blend_mode: self.blend_mode,
            fill_mode: self.fill_mode,
            cull_mode: self.cull_mode,
            depth_func: self.depth_func,
            topology: self.topology,
            render_target_count: self.render_target_count,
            front_counter_clockwise: self.front_counter_clockwise as i8,
            multisample_enable: self.multisample_enable as i8,
            depth_enable: self.depth_enable as i8,
            depth_write_enable: self.depth_write_enable as i8,
            _pad0: [0; 2],
            _pad1: 0,
        };
        out[..Self::KEY_SIZE].copy_from_slice(bytemuck::bytes_of(&data));
        Self::KEY_SIZE
    }

    fn build(&self, native: &NativeDevice) -> Option<NativePipeline> {
        let vs = match &self.vs_blob {
            Some(blob) => blob,
            None => {
                debug_assert!(false, "graphics pipeline build without a vertex shader blob");
                return None;
            }
        };
        let mut blobs: Vec<&ShaderBlob> = Vec::with_capacity(5);
        blobs.push(vs);
        for blob in [&self.ps_blob, &self.ds_blob, &self.hs_blob, &self.gs_blob] {
            if let Some(blob) = blob {
                blobs.push(blob);
            }
        }
        native.build_pipeline(PipelineKind::Graphics, &blobs)
    }
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub cs_id: i64,
    pub cs_blob: Option<ShaderBlob>,
}

impl ComputePipelineDesc {
    pub fn invalidate_shaders(&mut self) {
        self.cs_id = INVALID_CONTENTS_ID;
        self.cs_blob = None;
    }
}

impl Default for ComputePipelineDesc {
    fn default() -> Self {
        Self {
            cs_id: INVALID_CONTENTS_ID,
            cs_blob: None,
        }
    }
}

impl PipelineDesc for ComputePipelineDesc {
    const KIND: PipelineKind = PipelineKind::Compute;
    const KEY_SIZE: usize = COMPUTE_KEY_SIZE;
    const KEY_STORAGE: usize = COMPUTE_KEY_STORAGE;

    fn write_key(&self, out: &mut [u8]) -> usize {
        let data = ComputeKeyData {
            hash: 0,
            cs_id: self.cs_id,
        };
        out[..Self::KEY_SIZE].copy_from_slice(bytemuck::bytes_of(&data));
        Self::KEY_SIZE
    }

    fn build(&self, native: &NativeDevice) -> Option<NativePipeline> {
        let cs = match &self.cs_blob {
            Some(blob) => blob,
            None => {
                debug_assert!(false, "compute pipeline build without a shader blob");
                return None;
            }
        };
        native.build_pipeline(PipelineKind::Compute, &[cs])
    }
}

/// Raytrace pipeline description. Entry-point names are keyed positionally:
/// ray generation, miss, secondary miss, any hit, closest hit, callable,
/// then the material-shader variants of the last three.
#[derive(Clone, Debug)]
pub struct RaytracePipelineDesc {
    pub item_library_id: i64,
    pub materials_library_id: i64,
    pub item_blob: Option<ShaderBlob>,
    pub materials_blob: Option<ShaderBlob>,
    pub entry_names: [[u16; ENTRY_NAME_CAPACITY]; RAYTRACE_NAME_SLOTS],
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
}

impl RaytracePipelineDesc {
    pub fn invalidate_shaders(&mut self) {
        self.item_library_id = INVALID_CONTENTS_ID;
        self.materials_library_id = INVALID_CONTENTS_ID;
        self.item_blob = None;
        self.materials_blob = None;
    }
}

impl Default for RaytracePipelineDesc {
    fn default() -> Self {
        Self {
            item_library_id: INVALID_CONTENTS_ID,
            materials_library_id: INVALID_CONTENTS_ID,
            item_blob: None,
            materials_blob: None,
            entry_names: [[0; ENTRY_NAME_CAPACITY]; RAYTRACE_NAME_SLOTS],
            max_recursion_depth: 1,
            max_payload_size: 0,
        }
    }
}

impl PipelineDesc for RaytracePipelineDesc {
    const KIND: PipelineKind = PipelineKind::Raytrace;
    const KEY_SIZE: usize = RAYTRACE_KEY_SIZE;
    const KEY_STORAGE: usize = RAYTRACE_KEY_STORAGE;

    fn write_key(&self, out: &mut [u8]) -> usize {
        let data = RaytraceKeyData {
            hash: 0,
            item_library_id: self.item_library_id,
            materials_library_id: self.materials_library_id,
            entry_names: self.entry_names,
            max_recursion_depth: self.max_recursion_depth,
            max_payload_size: self.max_payload_size,
        };
        out[..Self::KEY_SIZE].copy_from_slice(bytemuck::bytes_of(&data));
        Self::KEY_SIZE
    }

    fn build(&self, native: &NativeDevice) -> Option<NativePipeline> {
        let item = match &self.item_blob {
            Some(blob) => blob,
            None => {
                debug_assert!(false, "raytrace pipeline build without an item library blob");
                return None;
            }
        };
        let mut blobs: Vec<&ShaderBlob> = Vec::with_capacity(2);
        blobs.push(item);
        if let Some(materials) = &self.materials_blob {
            blobs.push(materials);
        }
        native.build_pipeline(PipelineKind::Raytrace, &blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key::{lead_hash, pack_entry_name, seal_key};

    #[test]
    fn default_descriptions_carry_invalid_shader_ids() {
        let graphics = GraphicsPipelineDesc::default();
        assert_eq!(graphics.vs_id, INVALID_CONTENTS_ID);
        assert_eq!(graphics.gs_id, INVALID_CONTENTS_ID);
        assert!(graphics.vs_blob.is_none());

        let compute = ComputePipelineDesc::default();
        assert_eq!(compute.cs_id, INVALID_CONTENTS_ID);

        let raytrace = RaytracePipelineDesc::default();
        assert_eq!(raytrace.item_library_id, INVALID_CONTENTS_ID);
    }

    #[test]
    fn key_lengths_match_their_declared_sizes() {
        let mut out = [0u8; key::MAX_KEY_STORAGE];
        assert_eq!(
            GraphicsPipelineDesc::default().write_key(&mut out),
            GraphicsPipelineDesc::KEY_SIZE
        );
        assert_eq!(
            ComputePipelineDesc::default().write_key(&mut out),
            ComputePipelineDesc::KEY_SIZE
        );
        assert_eq!(
            RaytracePipelineDesc::default().write_key(&mut out),
            RaytracePipelineDesc::KEY_SIZE
        );
    }

    #[test]
    fn fixed_function_state_reaches_the_key() {
        let mut a = GraphicsPipelineDesc::default();
        a.vs_id = 5;
        let mut b = a.clone();
        b.topology = 3;

        let mut key_a = [0u8; key::MAX_KEY_STORAGE];
        let mut key_b = [0u8; key::MAX_KEY_STORAGE];
        let len = a.write_key(&mut key_a);
        b.write_key(&mut key_b);
        seal_key(&mut key_a[..len]);
        seal_key(&mut key_b[..len]);
        assert_ne!(lead_hash(&key_a), lead_hash(&key_b));
    }

    #[test]
    fn entry_names_reach_the_raytrace_key() {
        let mut a = RaytracePipelineDesc::default();
        a.item_library_id = 9;
        a.entry_names[0] = pack_entry_name("RayGen");
        let mut b = a.clone();
        b.entry_names[0] = pack_entry_name("RayGenShadow");

        let mut key_a = [0u8; key::MAX_KEY_STORAGE];
        let mut key_b = [0u8; key::MAX_KEY_STORAGE];
        let len = a.write_key(&mut key_a);
        b.write_key(&mut key_b);
        seal_key(&mut key_a[..len]);
        seal_key(&mut key_b[..len]);
        assert_ne!(lead_hash(&key_a), lead_hash(&key_b));
    }

    #[test]
    fn blobs_do_not_affect_the_key() {
        let mut a = ComputePipelineDesc::default();
        a.cs_id = 4;
        let mut b = a.clone();
        b.cs_blob = Some(ShaderBlob::from_bytes(b"cs"));

        let mut key_a = [0u8; key::MAX_KEY_STORAGE];
        let mut key_b = [0u8; key::MAX_KEY_STORAGE];
        let len = a.write_key(&mut key_a);
        b.write_key(&mut key_b);
        assert_eq!(key_a[..len], key_b[..len]);
    }
}
