//! Debug aids: sentinel canaries, the memstomp fill pattern, and the
//! outstanding-allocation ledger. All are opt-in and no-ops when disabled.

use crate::runtime::Runtime;
use bitflags::bitflags;
use std::collections::HashSet;
use std::mem;

bitflags! {
    /// Which debug aids are active for a pool. Defaults to all-off; see
    /// [`DebugOptions::from_env`].
    pub struct DebugOptions: u32 {
        const NONE      = 0;
        /// Canary words immediately before/after each small allocation.
        const SENTINEL  = 1;
        /// Write 0xF0 on alloc, 0xF3 on free, over the user-visible bytes.
        const MEMSTOMP  = 2;
        /// Emit `log::info!` sweep summaries under the `heapcore::sweep` target.
        const COLLECT_PRINTF = 4;
        /// Retain a ledger of outstanding allocations for leak diagnostics.
        const LOGGING   = 8;
    }
}

/// Byte written into a freshly allocated small object when `MEMSTOMP` is set.
pub const MEMSTOMP_ALLOC_BYTE: u8 = 0xF0;
/// Byte written into a freed small object when `MEMSTOMP` is set.
pub const MEMSTOMP_FREE_BYTE: u8 = 0xF3;

/// Canary value written immediately before and after a sentinel-protected
/// allocation.
pub const SENTINEL_CANARY: usize = 0xDEAD_C0DE_DEAD_C0DE_u64 as usize;

/// Layout of a sentinel-protected allocation, internal address first:
/// `[pre-canary: usize][user size: usize][user bytes...][post-canary: usize]`.
/// `sentinel_add`/`sentinel_sub` convert between this internal (allocation)
/// address and the runtime-visible address handed out to the caller. This is
/// the boundary the sweep paths cross when reporting addresses to `Runtime`.
const SENTINEL_PRE_WORDS: usize = 2;
const SENTINEL_PRE_BYTES: usize = SENTINEL_PRE_WORDS * mem::size_of::<usize>();
const SENTINEL_POST_BYTES: usize = mem::size_of::<usize>();

/// Total bytes of sentinel overhead around a `user_size`-byte allocation.
pub const fn sentinel_overhead(user_size: usize) -> usize {
    SENTINEL_PRE_BYTES + SENTINEL_POST_BYTES + user_size
}

/// Runtime-visible address -> internal (allocation) address.
///
/// # Safety
/// `visible` must have been produced by [`sentinel_add`] on an allocation of
/// at least `SENTINEL_PRE_BYTES` bytes.
pub unsafe fn sentinel_sub(visible: *mut u8) -> *mut u8 {
    visible.sub(SENTINEL_PRE_BYTES)
}

/// Internal (allocation) address -> runtime-visible address.
///
/// # Safety
/// `internal` must point to the start of a sentinel-protected allocation.
pub unsafe fn sentinel_add(internal: *mut u8) -> *mut u8 {
    internal.add(SENTINEL_PRE_BYTES)
}

/// Write the pre-canary, the user size, and the post-canary around a
/// `user_size`-byte allocation starting at `internal`.
///
/// # Safety
/// `internal` must point to at least `sentinel_overhead(user_size)` writable
/// bytes.
pub unsafe fn sentinel_init(internal: *mut u8, user_size: usize) {
    let words = internal as *mut usize;
    words.write(SENTINEL_CANARY);
    words.add(1).write(user_size);
    let post = internal.add(SENTINEL_PRE_BYTES + user_size) as *mut usize;
    post.write(SENTINEL_CANARY);
}

/// Read back the user size stamped by [`sentinel_init`].
///
/// # Safety
/// `internal` must point to a sentinel-protected allocation written by
/// [`sentinel_init`].
pub unsafe fn sentinel_size(internal: *const u8) -> usize {
    (internal as *const usize).add(1).read()
}

/// Check both canaries; call `runtime.on_invalid_memory_operation()` (never
/// returns) if either has been corrupted.
///
/// # Safety
/// `internal` must point to a sentinel-protected allocation written by
/// [`sentinel_init`].
pub unsafe fn sentinel_invariant<R: Runtime>(internal: *const u8, runtime: &R) {
    let words = internal as *const usize;
    let pre_ok = words.read() == SENTINEL_CANARY;
    let user_size = words.add(1).read();
    let post = internal.add(SENTINEL_PRE_BYTES + user_size) as *const usize;
    let post_ok = post.read() == SENTINEL_CANARY;
    if !pre_ok || !post_ok {
        runtime.on_invalid_memory_operation();
    }
}

impl DebugOptions {
    /// Parse a comma-separated toggle list from `HEAPCORE_DEBUG`
    /// (e.g. `HEAPCORE_DEBUG=sentinel,memstomp`). Unset or unparseable
    /// entries are ignored rather than treated as a hard error: there is no
    /// invalid state here that must abort, only a permissive fallback to
    /// "everything off".
    pub fn from_env() -> DebugOptions {
        let raw = match std::env::var("HEAPCORE_DEBUG") {
            Ok(s) => s,
            Err(_) => return DebugOptions::NONE,
        };
        let mut opts = DebugOptions::NONE;
        for tok in raw.split(',') {
            match tok.trim() {
                "sentinel" => opts |= DebugOptions::SENTINEL,
                "memstomp" => opts |= DebugOptions::MEMSTOMP,
                "collect_printf" => opts |= DebugOptions::COLLECT_PRINTF,
                "logging" => opts |= DebugOptions::LOGGING,
                _ => {}
            }
        }
        opts
    }
}

impl Default for DebugOptions {
    fn default() -> Self {
        DebugOptions::NONE
    }
}

/// Ledger of outstanding allocations, kept per-pool when `LOGGING` is set.
/// Purely diagnostic: nothing in the allocator reads it to make decisions.
#[derive(Default)]
pub struct AllocLedger {
    live: HashSet<usize>,
}

impl AllocLedger {
    pub fn new() -> Self {
        AllocLedger { live: HashSet::new() }
    }

    pub fn record_alloc(&mut self, addr: usize) {
        self.live.insert(addr);
    }

    pub fn record_free(&mut self, addr: usize) {
        self.live.remove(&addr);
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &usize> {
        self.live.iter()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::recording::RecordingRuntime;
    use std::sync::Mutex;

    // `HEAPCORE_DEBUG` is process-global; serialize the tests that touch it
    // so they don't race under the default multi-threaded test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn from_env_defaults_to_all_off_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("HEAPCORE_DEBUG");
        assert_eq!(DebugOptions::from_env(), DebugOptions::NONE);
    }

    #[test]
    fn from_env_parses_known_tokens_and_ignores_unknown_ones() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HEAPCORE_DEBUG", "sentinel, bogus,memstomp");
        let opts = DebugOptions::from_env();
        assert!(opts.contains(DebugOptions::SENTINEL));
        assert!(opts.contains(DebugOptions::MEMSTOMP));
        assert!(!opts.contains(DebugOptions::COLLECT_PRINTF));
        std::env::remove_var("HEAPCORE_DEBUG");
    }

    #[test]
    fn sentinel_add_sub_round_trip() {
        let mut buf = [0u8; 64];
        let internal = buf.as_mut_ptr();
        unsafe {
            let visible = sentinel_add(internal);
            assert_eq!(sentinel_sub(visible), internal);
        }
    }

    #[test]
    fn sentinel_size_round_trips_through_init() {
        let mut buf = [0u8; 64];
        let internal = buf.as_mut_ptr();
        let user_size = 32usize;
        unsafe {
            sentinel_init(internal, user_size);
            assert_eq!(sentinel_size(internal), user_size);
        }
    }

    #[test]
    fn corrupting_the_pre_canary_triggers_invalid_memory_operation() {
        let mut buf = [0u8; 64];
        let internal = buf.as_mut_ptr();
        let user_size = 16usize;
        unsafe {
            sentinel_init(internal, user_size);
            // Stomp the pre-canary word.
            (internal as *mut usize).write(0);
        }
        let rt = RecordingRuntime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            sentinel_invariant(internal, &rt);
        }));
        assert!(result.is_err(), "corrupted pre-canary must trigger on_invalid_memory_operation");
    }

    #[test]
    fn intact_canaries_pass_the_invariant_check() {
        let mut buf = [0u8; 64];
        let internal = buf.as_mut_ptr();
        let user_size = 16usize;
        let rt = RecordingRuntime::new();
        unsafe {
            sentinel_init(internal, user_size);
            sentinel_invariant(internal, &rt); // must not panic
        }
    }
}
