//! Shader provider model.
//!
//! Compilation itself lives outside this crate; recorders only care about the
//! observable surface: is the shader usable, and if so, which bytecode and
//! content id does it carry. Content ids are unique and monotonic so that
//! pipeline cache keys made from them are stable; [`INVALID_CONTENTS_ID`]
//! marks "no usable bytecode" and must never reach a cache key.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Content id of a shader that has no usable bytecode.
pub const INVALID_CONTENTS_ID: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderState {
    /// No source attached yet.
    Empty,
    /// Compilation requested but not finished; retry the item later.
    Uncooked,
    /// Usable bytecode available.
    Cooked,
    /// Compilation failed; items using this shader are errors, not retries.
    Failed,
}

/// Opaque shader bytecode handle.
///
/// `valid` models driver acceptance: building a pipeline from an invalid blob
/// fails. `tables_pending` models a raytrace library whose export tables are
/// still being generated after the library itself finished cooking.
#[derive(Clone, Debug)]
pub struct ShaderBlob {
    bytes: Arc<[u8]>,
    valid: bool,
    tables_pending: bool,
}

impl ShaderBlob {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
            valid: true,
            tables_pending: false,
        }
    }

    /// A blob the native device will refuse to build pipelines from.
    pub fn invalid() -> Self {
        Self {
            bytes: Arc::from(&b""[..]),
            valid: false,
            tables_pending: false,
        }
    }

    /// A valid library blob whose shader tables are not ready yet.
    pub fn with_pending_tables(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
            valid: true,
            tables_pending: true,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn tables_pending(&self) -> bool {
        self.tables_pending
    }
}

/// Device-wide shader bookkeeping: content id allocation plus the count of
/// shaders still compiling (the raytrace item gate).
#[derive(Debug)]
pub struct ShaderRegistry {
    compiling: AtomicUsize,
    next_contents_id: AtomicI64,
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self {
            compiling: AtomicUsize::new(0),
            next_contents_id: AtomicI64::new(1),
        }
    }

    pub fn compiling_count(&self) -> usize {
        self.compiling.load(Ordering::Acquire)
    }

    fn next_contents_id(&self) -> i64 {
        self.next_contents_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ShaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ShaderInner {
    state: ShaderState,
    blob: Option<ShaderBlob>,
    contents_id: i64,
}

/// One shader slot. Also used for raytrace shader libraries, which follow the
/// same state machine with library bytecode in place of a single entry point.
#[derive(Debug)]
pub struct Shader {
    registry: Arc<ShaderRegistry>,
    inner: Mutex<ShaderInner>,
}

impl Shader {
    pub fn new(registry: Arc<ShaderRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(ShaderInner {
                state: ShaderState::Empty,
                blob: None,
                contents_id: INVALID_CONTENTS_ID,
            }),
        }
    }

    /// Shorthand for a shader that is immediately usable.
    pub fn cooked(registry: Arc<ShaderRegistry>, bytes: &[u8]) -> Arc<Self> {
        let shader = Arc::new(Self::new(registry));
        shader.begin_compile();
        shader.finish_compile(ShaderBlob::from_bytes(bytes));
        shader
    }

    pub fn state(&self) -> ShaderState {
        self.inner.lock().unwrap().state
    }

    /// Marks the shader as compiling. Any previous bytecode stops being
    /// visible until [`Shader::finish_compile`] lands.
    pub fn begin_compile(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ShaderState::Uncooked {
            return;
        }
        inner.state = ShaderState::Uncooked;
        inner.blob = None;
        inner.contents_id = INVALID_CONTENTS_ID;
        self.registry.compiling.fetch_add(1, Ordering::AcqRel);
    }

    /// Publishes compiled bytecode and assigns a fresh content id.
    pub fn finish_compile(&self, blob: ShaderBlob) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(
            inner.state,
            ShaderState::Uncooked,
            "finish_compile without begin_compile"
        );
        inner.state = ShaderState::Cooked;
        inner.blob = Some(blob);
        inner.contents_id = self.registry.next_contents_id();
        self.registry.compiling.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records a compilation failure.
    pub fn fail_compile(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(
            inner.state,
            ShaderState::Uncooked,
            "fail_compile without begin_compile"
        );
        inner.state = ShaderState::Failed;
        inner.blob = None;
        inner.contents_id = INVALID_CONTENTS_ID;
        self.registry.compiling.fetch_sub(1, Ordering::AcqRel);
    }

    /// Bytecode and content id, available only in the cooked state.
    pub fn cooked_blob(&self) -> Option<(ShaderBlob, i64)> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            ShaderState::Cooked => {
                let blob = inner.blob.clone()?;
                debug_assert_ne!(inner.contents_id, INVALID_CONTENTS_ID);
                Some((blob, inner.contents_id))
            }
            _ => None,
        }
    }

    pub fn contents_id(&self) -> i64 {
        self.inner.lock().unwrap().contents_id
    }
}
