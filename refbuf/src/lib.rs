//! Reference-counted heap arena that carries pipeline objects without
//! copying (§4.1).
//!
//! The C++ original models a handle as an atomic pointer to a manually
//! refcounted block, with a raw aux-pointer array walked by hand on
//! release. Per the design notes this is collapsed here into a single
//! atomic-refcount primitive (`Arc`) wrapping a closed aux-slot enum; the
//! recursive release of aux slot 0 (a raw allocation) and slots 1..n (owned
//! child `RefBuf`s) falls out of ordinary drop glue instead of being
//! reimplemented by hand.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Sentinel written at the front and back of every allocation's metadata.
/// A mismatch here means heap corruption or a use-after-free and is fatal.
pub const GUARD: u32 = 0x8475_8362;

/// Maximum number of aux-pointer slots a RefBuf may carry.
pub const MAX_AUX_SLOTS: usize = 20;

/// Maximum single allocation size.
pub const MAX_ALLOC_SIZE: usize = 258 * 1024 * 1024;

static LIVE_OBJECTS: AtomicU64 = AtomicU64::new(0);
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static MAX_LIVE_OBJECTS: AtomicU64 = AtomicU64::new(0);
static MAX_REFCOUNT: AtomicU32 = AtomicU32::new(0);

/// Process-wide live object count, for diagnostics/tests.
pub fn live_object_count() -> u64 {
    LIVE_OBJECTS.load(Ordering::SeqCst)
}

/// Process-wide live byte count, for diagnostics/tests.
pub fn live_byte_count() -> u64 {
    LIVE_BYTES.load(Ordering::SeqCst)
}

fn is_pow2(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// One aux-pointer slot. Slot 0 historically carried a raw block-auxiliary
/// record freed directly; slots 1..n form an owned DAG of child objects
/// (e.g. a block's constituent transactions) released together with the
/// parent.
pub enum AuxSlot {
    Raw(Box<[u8]>),
    Child(RefBuf),
}

struct Inner {
    guard_front: u32,
    body: Box<[u8]>,
    aux: Vec<AuxSlot>,
    guard_back: u32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        check_guard(self.guard_front, self.guard_back);
        LIVE_OBJECTS.fetch_sub(1, Ordering::SeqCst);
        LIVE_BYTES.fetch_sub(self.body.len() as u64, Ordering::SeqCst);
        // `body` and `aux` are dropped by ordinary field drop glue after
        // this returns: aux slot 0 frees as a plain byte buffer, later
        // slots recursively decrement their child RefBuf's refcount.
    }
}

fn check_guard(front: u32, back: u32) {
    if front != GUARD || back != GUARD {
        error!(front, back, expected = GUARD, "refbuf guard violation, aborting process");
        std::process::abort();
    }
}

/// A handle to a heap-allocated, reference-counted object. `None` is the
/// "empty handle" returned for a zero or oversized allocation request.
pub struct RefBuf(Option<Arc<Inner>>);

impl RefBuf {
    /// Allocates an all-zero body of at least `body_size` bytes. Returns an
    /// empty handle if `body_size == 0` or exceeds [`MAX_ALLOC_SIZE`].
    pub fn alloc(body_size: usize) -> RefBuf {
        if body_size == 0 || body_size > MAX_ALLOC_SIZE {
            return RefBuf(None);
        }
        let body = vec![0u8; body_size].into_boxed_slice();
        let inner = Arc::new(Inner {
            guard_front: GUARD,
            body,
            aux: Vec::new(),
            guard_back: GUARD,
        });

        let nobjs = LIVE_OBJECTS.fetch_add(1, Ordering::SeqCst) + 1;
        LIVE_BYTES.fetch_add(body_size as u64, Ordering::SeqCst);
        let prev_max = MAX_LIVE_OBJECTS.fetch_max(nobjs, Ordering::SeqCst);
        if nobjs > prev_max && is_pow2(nobjs) {
            info!(live_objects = nobjs, "refbuf live-object milestone");
        }
        RefBuf(Some(inner))
    }

    /// True for the empty handle (failed/degenerate allocation).
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn inner(&self) -> Option<&Inner> {
        self.0.as_deref()
    }

    /// Read access to the body, after a guard check. Returns `None` for an
    /// empty handle.
    pub fn data(&self) -> Option<&[u8]> {
        let inner = self.inner()?;
        check_guard(inner.guard_front, inner.guard_back);
        Some(&inner.body)
    }

    pub fn len(&self) -> usize {
        self.inner().map(|i| i.body.len()).unwrap_or(0)
    }

    /// Mutable access to the body, only available while this handle is the
    /// sole owner (true during the parse-and-fill stage, before the object
    /// is cloned into the pipeline and becomes immutable in practice).
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let arc = self.0.as_mut()?;
        let inner = Arc::get_mut(arc)?;
        check_guard(inner.guard_front, inner.guard_back);
        Some(&mut inner.body)
    }

    /// Reserves `n` aux slots (all initially empty `Raw` slots of length 0).
    /// Only available while this handle is the sole owner. Fails silently
    /// (no-op) if `n > MAX_AUX_SLOTS` or the handle is shared/empty.
    pub fn set_aux_count(&mut self, n: usize) -> bool {
        if n > MAX_AUX_SLOTS {
            return false;
        }
        let Some(arc) = self.0.as_mut() else { return false };
        let Some(inner) = Arc::get_mut(arc) else { return false };
        inner.aux.resize_with(n, || AuxSlot::Raw(Box::new([])));
        true
    }

    pub fn aux_count(&self) -> usize {
        self.inner().map(|i| i.aux.len()).unwrap_or(0)
    }

    /// Sets aux slot `i`. Only available while this handle is the sole
    /// owner. Returns `false` if `i` is out of range or the handle is
    /// shared/empty.
    pub fn set_aux_slot(&mut self, i: usize, value: AuxSlot) -> bool {
        let Some(arc) = self.0.as_mut() else { return false };
        let Some(inner) = Arc::get_mut(arc) else { return false };
        let Some(slot) = inner.aux.get_mut(i) else { return false };
        *slot = value;
        true
    }

    /// Current strong-reference count (1 for a freshly allocated, unshared
    /// handle; `0` for the empty handle).
    pub fn ref_count(&self) -> usize {
        self.0.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// Stable identity for the underlying allocation, usable as a map key
    /// (the C++ original's `refbuf_basep`).
    pub fn base_ptr(&self) -> Option<usize> {
        self.0.as_ref().map(|a| Arc::as_ptr(a) as usize)
    }
}

impl Clone for RefBuf {
    fn clone(&self) -> Self {
        let Some(arc) = &self.0 else {
            return RefBuf(None);
        };
        let cloned = Arc::clone(arc);
        let count = Arc::strong_count(&cloned) as u32;
        let prev_max = MAX_REFCOUNT.fetch_max(count, Ordering::SeqCst);
        if count > prev_max && is_pow2(count as u64) {
            info!(refcount = count, "refbuf refcount milestone");
        }
        RefBuf(Some(cloned))
    }
}
