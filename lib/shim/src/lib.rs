//! In-process memory tracer.
//!
//! Built as a `cdylib` and loaded into an arbitrary target process via the
//! dynamic linker's preload facility, this library exports the standard
//! memory-management entry points (`malloc`, `mmap`, `mlock`, ...) and
//! forwards each call to the real implementation while emitting a text
//! record (optionally with a stack backtrace) to stderr or a per-process
//! trace file. See the repository README for the environment variables and
//! the record format.
//!
//! Nothing here may assume a friendly host: initialization is lazy because
//! other modules' constructors run (and allocate) first, every internal
//! allocation re-enters the interposed functions and is let through by the
//! reentrancy gate, and the whole event path avoids libc's stdio.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod events;
pub mod gate;
pub mod logger;
pub mod maps_cache;
pub mod options;
pub mod output;
pub mod policy;
pub mod signals;
pub mod symbols;
pub mod unwind;

use core::ffi::{c_char, c_int, c_void, CStr};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, Once};

use crate::events::Event;
use crate::maps_cache::RangeCache;
use crate::options::{Mode, Options};
use crate::policy::Policy;
use crate::signals::SignalGuard;
use crate::symbols::SymbolTable;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type MemalignFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut c_void, libc::size_t, libc::size_t) -> c_int;
type MemsetFn = unsafe extern "C" fn(*mut c_void, c_int, libc::size_t) -> *mut c_void;
type MemmoveFn = unsafe extern "C" fn(*mut c_void, *const c_void, libc::size_t) -> *mut c_void;
type MmapFn =
    unsafe extern "C" fn(*mut c_void, libc::size_t, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> c_int;
type MlockFn = unsafe extern "C" fn(*const c_void, libc::size_t) -> c_int;
type MlockallFn = unsafe extern "C" fn(c_int) -> c_int;
type MunlockallFn = unsafe extern "C" fn() -> c_int;
type GetenvFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// The real entry points, resolved once through the dynamic linker's
/// "next symbol" facility. Written during initialization, read-only after.
struct RealFns {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
    cfree: Option<FreeFn>,
    memalign: MemalignFn,
    posix_memalign: PosixMemalignFn,
    aligned_alloc: MemalignFn,
    valloc: MallocFn,
    pvalloc: MallocFn,
    memset: MemsetFn,
    memmove: MemmoveFn,
    mmap: MmapFn,
    #[cfg_attr(not(any(target_arch = "x86", target_arch = "arm")), allow(dead_code))]
    mmap2: Option<MmapFn>,
    munmap: MunmapFn,
    mlock: MlockFn,
    munlock: MlockFn,
    mlockall: MlockallFn,
    munlockall: MunlockallFn,
    getenv: GetenvFn,
    dlclose: DlcloseFn,
}

/// Resolve the next definition of `name` after this library.
///
/// # Safety
///
/// `F` must be a function-pointer type matching the symbol's C signature.
unsafe fn next_fn<F: Copy>(name: &CStr) -> Option<F> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        None
    } else {
        // SAFETY: object and function pointers share a representation on
        // every platform the dynamic linker supports this on.
        Some(unsafe { core::mem::transmute_copy::<*mut c_void, F>(&sym) })
    }
}

/// # Safety
///
/// As for [`next_fn`].
unsafe fn require_fn<F: Copy>(name: &CStr) -> F {
    match unsafe { next_fn::<F>(name) } {
        Some(f) => f,
        None => output::fatal(format_args!(
            "cannot resolve '{}'",
            name.to_str().unwrap_or("?")
        )),
    }
}

impl RealFns {
    /// # Safety
    ///
    /// Must run once, before `initialized` flips; resolution may allocate,
    /// which the caller routes to the early-init arena via the gate.
    unsafe fn resolve() -> Self {
        // SAFETY: each type alias matches the documented C prototype.
        unsafe {
            Self {
                malloc: require_fn(c"malloc"),
                calloc: require_fn(c"calloc"),
                realloc: require_fn(c"realloc"),
                free: require_fn(c"free"),
                cfree: next_fn(c"cfree"),
                memalign: require_fn(c"memalign"),
                posix_memalign: require_fn(c"posix_memalign"),
                aligned_alloc: require_fn(c"aligned_alloc"),
                valloc: require_fn(c"valloc"),
                pvalloc: require_fn(c"pvalloc"),
                memset: require_fn(c"memset"),
                memmove: require_fn(c"memmove"),
                mmap: require_fn(c"mmap"),
                mmap2: next_fn(c"mmap2"),
                munmap: require_fn(c"munmap"),
                mlock: require_fn(c"mlock"),
                munlock: require_fn(c"munlock"),
                mlockall: require_fn(c"mlockall"),
                munlockall: require_fn(c"munlockall"),
                getenv: require_fn(c"getenv"),
                dlclose: require_fn(c"dlclose"),
            }
        }
    }
}

/// All process-wide tracer state behind one handle.
pub struct Tracer {
    initialized: AtomicBool,
    real: OnceCell<RealFns>,
    pub(crate) opts: OnceCell<Options>,
    page_size: AtomicUsize,
    phys_pages: AtomicUsize,
    pub(crate) maps: RangeCache,
    pub(crate) symbols: SymbolTable,
    pub(crate) policy: Policy,
    /// Serializes whole events in growth mode, so two threads cannot
    /// interleave their RSS samples.
    event_lock: Mutex<()>,
}

static FALLBACK_OPTS: Options = Options::fallback();

impl Tracer {
    pub(crate) const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            real: OnceCell::new(),
            opts: OnceCell::new(),
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            phys_pages: AtomicUsize::new(0),
            maps: RangeCache::new(),
            symbols: SymbolTable::new(),
            policy: Policy::new(),
            event_lock: Mutex::new(()),
        }
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Parsed options, or the defaults for the short window in which a
    /// racing thread sees `initialized` before the environment is parsed.
    pub(crate) fn opts(&self) -> &Options {
        self.opts.get().unwrap_or(&FALLBACK_OPTS)
    }

    fn real(&self) -> &RealFns {
        match self.real.get() {
            Some(r) => r,
            None => output::fatal(format_args!("real entry points used before resolution")),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed)
    }
}

static TRACER: Tracer = Tracer::new();

pub(crate) fn tracer() -> &'static Tracer {
    &TRACER
}

static INIT: Once = Once::new();

// The items below are reached only through the exported ABI surface, which
// is compiled out of unit-test builds.

/// Lazy initialization, run from the first interposed call.
///
/// Constructor attributes are useless here: other modules' constructors can
/// run first and will already be calling the interposed functions, which is
/// exactly why the early-init arena exists. A reentrant attempt (an
/// interposed call made *by* the initialization itself) returns early and
/// lets the outer invocation finish the job.
#[cfg_attr(test, allow(dead_code))]
fn ensure_init() {
    let t = tracer();
    if t.initialized() {
        return;
    }

    let _sig = SignalGuard::block();
    if gate::depth() != 0 {
        return;
    }
    let _g = gate::suppress();
    INIT.call_once(init_tracer);
}

#[cfg_attr(test, allow(dead_code))]
fn init_tracer() {
    let t = tracer();

    // SAFETY: first and only resolution; allocations made by dlsym land in
    // the arena because `initialized` is still down and the gate is held.
    let real = unsafe { RealFns::resolve() };

    // SAFETY: sysconf is async-signal- and thread-safe for these names.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        t.page_size.store(page as usize, Ordering::Relaxed);
    }
    let phys = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if phys > 0 {
        t.phys_pages.store(phys as usize, Ordering::Relaxed);
    }

    let _ = t.real.set(real);
    t.initialized.store(true, Ordering::Release);

    // Only now can the environment be read: getenv goes through our own
    // shim, which forwards once the initialized flag is up.
    let opts = Options::from_env();
    logger::install(opts.log_level);
    log::debug!(
        "tracer initialized: page_size={}, phys_pages={}, backtrace_depth={}",
        t.page_size(),
        t.phys_pages.load(Ordering::Relaxed),
        opts.backtrace_depth,
    );
    let _ = t.opts.set(opts);
}

/// What to print after the operation's argument list.
#[cfg_attr(test, allow(dead_code))]
enum Ret {
    Ptr(usize),
    Num(c_int),
    /// Operations without a return value (`free`): the record ends with the
    /// argument list.
    Void,
}

/// The template every interposed operation runs through.
///
/// Outermost calls open an event frame (tid + timestamp), serialize the
/// operation, invoke `call`, append the return value, consult the policy
/// engine, optionally unwind, and commit. Nested calls (the tracer's own
/// allocations) just forward.
#[cfg_attr(test, allow(dead_code))]
fn traced_call<R>(
    ev: Event,
    policy_size: usize,
    args: core::fmt::Arguments<'_>,
    call: impl FnOnce() -> R,
    ret: impl FnOnce(&R) -> Ret,
) -> R {
    let t = tracer();
    gate::enter();

    let result = if gate::is_outermost() {
        let _sig = SignalGuard::block();
        output::with(|out| {
            out.tid_tag();
            out.timestamp_tag();

            let growth_guard = (t.opts().mode == Mode::Growth).then(|| t.event_lock.lock());

            out.append(format_args!(
                "{}({})",
                ev.name(t.opts().human_readable),
                args
            ));

            let r = call();

            match ret(&r) {
                Ret::Ptr(p) => out.append(format_args!("=0x{p:x}\n")),
                Ret::Num(n) => out.append(format_args!("={n}\n")),
                Ret::Void => out.append(format_args!("\n")),
            }

            let wants_trace =
                t.policy
                    .should_backtrace(t.opts(), t.page_size(), policy_size, ev.class(), out);
            drop(growth_guard);

            if wants_trace {
                unwind::trace(t, out);
            }
            out.commit(t.opts().sink.fd());
            r
        })
    } else {
        call()
    };

    gate::leave();
    result
}

/// Touch every byte of a fresh allocation so the kernel charges it to the
/// resident set now, while the growth-mode event that allocated it is still
/// open. Byte-by-byte volatile stores; the real `memset` must not be
/// involved while an event frame is open.
#[cfg_attr(test, allow(dead_code))]
fn forced_pgfault(ptr: *mut c_void, len: usize) {
    if tracer().opts().mode != Mode::Growth || ptr.is_null() {
        return;
    }
    arena::fill(ptr.cast(), 0, len);
}

/// The interposed ABI surface. Compiled out of unit-test builds so the test
/// harness itself does not get traced.
#[cfg(not(test))]
pub mod export {
    use super::*;
    use crate::arena;

    /// # Safety
    ///
    /// Standard C `malloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            return arena::alloc(size, arena::MIN_ALIGNMENT).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Malloc,
            size,
            format_args!("{size}"),
            || {
                // SAFETY: forwarding the caller's arguments unchanged.
                let p = unsafe { (real.malloc)(size) };
                forced_pgfault(p, size);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `calloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
        ensure_init();
        let total = nmemb.saturating_mul(size);
        if !tracer().initialized() {
            // Arena bytes are never recycled, so the block is already zero.
            return arena::alloc(total, arena::MIN_ALIGNMENT).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Calloc,
            total,
            format_args!("{nmemb}, {size}"),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.calloc)(nmemb, size) };
                forced_pgfault(p, total);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `realloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
        if !tracer().initialized() {
            // Too early to preserve contents: pre-init reallocs come from
            // constructors that overwrite the block anyway.
            return arena::alloc(size, arena::MIN_ALIGNMENT).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Realloc,
            size,
            format_args!("0x{:x}, {}", ptr as usize, size),
            || {
                if arena::contains(ptr) {
                    // Migrate an early-init block into the real heap. Its
                    // requested size was not recorded; copy up to the new
                    // size, bounded by the arena.
                    // SAFETY: `n` stays inside the arena and inside the new
                    // allocation.
                    unsafe {
                        let p = (real.malloc)(size);
                        if !p.is_null() {
                            let n = size.min(arena::bytes_from(ptr.cast()));
                            core::ptr::copy_nonoverlapping(ptr.cast::<u8>(), p.cast::<u8>(), n);
                        }
                        p
                    }
                } else {
                    // SAFETY: forwarding unchanged.
                    unsafe { (real.realloc)(ptr, size) }
                }
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `free` contract.
    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        if !tracer().initialized() {
            // Arena blocks leak on purpose.
            return;
        }
        let real = tracer().real();
        traced_call(
            Event::Free,
            0,
            format_args!("0x{:x}", ptr as usize),
            || {
                if !arena::contains(ptr) {
                    // SAFETY: forwarding unchanged.
                    unsafe { (real.free)(ptr) }
                }
            },
            |_| Ret::Void,
        )
    }

    /// # Safety
    ///
    /// Same contract as `free`.
    #[no_mangle]
    pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
        if !tracer().initialized() {
            return;
        }
        let real = tracer().real();
        traced_call(
            Event::Cfree,
            0,
            format_args!("0x{:x}", ptr as usize),
            || {
                if !arena::contains(ptr) {
                    // SAFETY: forwarding unchanged; platforms without a
                    // real cfree treat it as free.
                    unsafe { (real.cfree.unwrap_or(real.free))(ptr) }
                }
            },
            |_| Ret::Void,
        )
    }

    /// # Safety
    ///
    /// Standard C `memalign` contract.
    #[no_mangle]
    pub unsafe extern "C" fn memalign(
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            return arena::alloc(size, alignment).cast();
        }
        let real = tracer().real();
        let rounded = arena::align_up(size, alignment.max(1));
        traced_call(
            Event::Memalign,
            rounded,
            format_args!("{alignment}, {size}"),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.memalign)(alignment, size) };
                forced_pgfault(p, size);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `posix_memalign` contract; `memptr` must be a valid
    /// out-pointer.
    #[no_mangle]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> c_int {
        ensure_init();
        if !tracer().initialized() {
            // SAFETY: caller guarantees `memptr` is writable.
            unsafe { *memptr = arena::alloc(size, alignment).cast() };
            return 0;
        }
        let real = tracer().real();
        let rounded = arena::align_up(size, alignment.max(1));
        let (rc, _) = traced_call(
            Event::PosixMemalign,
            rounded,
            format_args!("{alignment}, {size}"),
            || {
                // SAFETY: forwarding unchanged.
                let rc = unsafe { (real.posix_memalign)(memptr, alignment, size) };
                // SAFETY: on success the callee stored a valid pointer.
                let stored = if rc == 0 { unsafe { *memptr } } else { core::ptr::null_mut() };
                if rc == 0 {
                    forced_pgfault(stored, size);
                }
                (rc, stored)
            },
            // The record carries the stored pointer, not the status code.
            |(_, stored)| Ret::Ptr(*stored as usize),
        );
        rc
    }

    /// # Safety
    ///
    /// Standard C `aligned_alloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn aligned_alloc(
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            return arena::alloc(size, alignment).cast();
        }
        let real = tracer().real();
        let rounded = arena::align_up(size, alignment.max(1));
        traced_call(
            Event::AlignedAlloc,
            rounded,
            format_args!("{alignment}, {size}"),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.aligned_alloc)(alignment, size) };
                forced_pgfault(p, size);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `valloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
        ensure_init();
        let page = tracer().page_size();
        if !tracer().initialized() {
            return arena::alloc(size, page).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Valloc,
            arena::align_up(size, page),
            format_args!("{size}"),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.valloc)(size) };
                forced_pgfault(p, size);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `pvalloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn pvalloc(size: libc::size_t) -> *mut c_void {
        ensure_init();
        let page = tracer().page_size();
        if !tracer().initialized() {
            return arena::alloc(size, page).cast();
        }
        let real = tracer().real();
        let rounded = arena::align_up(size, page);
        traced_call(
            Event::Pvalloc,
            rounded,
            format_args!("{size}"),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.pvalloc)(size) };
                forced_pgfault(p, rounded);
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `memset` contract.
    #[no_mangle]
    pub unsafe extern "C" fn memset(s: *mut c_void, c: c_int, n: libc::size_t) -> *mut c_void {
        // Initialization cannot be triggered from here: resolving symbols
        // needs memset-free progress. Emulate until someone else inits.
        if !tracer().initialized() {
            return arena::fill(s.cast(), c as u8, n).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Memset,
            n,
            format_args!("0x{:x}, {}, {}", s as usize, c, n),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.memset)(s, c, n) }
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `memmove` contract.
    #[no_mangle]
    pub unsafe extern "C" fn memmove(
        dest: *mut c_void,
        src: *const c_void,
        n: libc::size_t,
    ) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            return arena::copy(dest.cast(), src.cast(), n).cast();
        }
        let real = tracer().real();
        traced_call(
            Event::Memmove,
            0,
            format_args!("0x{:x}, 0x{:x}, {}", dest as usize, src as usize, n),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.memmove)(dest, src, n) }
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `mmap` contract.
    #[no_mangle]
    pub unsafe extern "C" fn mmap(
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            // A mapping made this early cannot be emulated and silently
            // forwarding it is indistinguishable from missing it.
            output::fatal(format_args!("mmap before tracer initialization"));
        }
        let t = tracer();
        let real = t.real();
        traced_call(
            Event::Mmap,
            len,
            format_args!(
                "0x{:x}, {}, {}, {}, {}, {}",
                addr as usize, len, prot, flags, fd, offset
            ),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { (real.mmap)(addr, len, prot, flags, fd, offset) };
                if prot & libc::PROT_EXEC != 0 {
                    t.maps.mark_stale();
                }
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// `mmap2` contract (offset in 4096-byte units).
    #[cfg(any(target_arch = "x86", target_arch = "arm"))]
    #[no_mangle]
    pub unsafe extern "C" fn mmap2(
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        ensure_init();
        if !tracer().initialized() {
            output::fatal(format_args!("mmap2 before tracer initialization"));
        }
        let t = tracer();
        let real = t.real();
        let Some(real_mmap2) = real.mmap2 else {
            output::fatal(format_args!("no real mmap2 on this platform"));
        };
        traced_call(
            Event::Mmap2,
            len,
            format_args!(
                "0x{:x}, {}, {}, {}, {}, {}",
                addr as usize, len, prot, flags, fd, offset
            ),
            || {
                // SAFETY: forwarding unchanged.
                let p = unsafe { real_mmap2(addr, len, prot, flags, fd, offset) };
                if prot & libc::PROT_EXEC != 0 {
                    t.maps.mark_stale();
                }
                p
            },
            |p| Ret::Ptr(*p as usize),
        )
    }

    /// # Safety
    ///
    /// Standard C `munmap` contract.
    #[no_mangle]
    pub unsafe extern "C" fn munmap(addr: *mut c_void, len: libc::size_t) -> c_int {
        if !tracer().initialized() {
            output::fatal(format_args!("munmap before tracer initialization"));
        }
        let real = tracer().real();
        traced_call(
            Event::Munmap,
            0,
            format_args!("0x{:x}, {}", addr as usize, len),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.munmap)(addr, len) }
            },
            |n| Ret::Num(*n),
        )
    }

    /// # Safety
    ///
    /// Standard C `mlock` contract.
    #[no_mangle]
    pub unsafe extern "C" fn mlock(addr: *const c_void, len: libc::size_t) -> c_int {
        ensure_init();
        if !tracer().initialized() {
            output::fatal(format_args!("mlock before tracer initialization"));
        }
        let real = tracer().real();
        traced_call(
            Event::Mlock,
            len,
            format_args!("0x{:x}, {}", addr as usize, len),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.mlock)(addr, len) }
            },
            |n| Ret::Num(*n),
        )
    }

    /// # Safety
    ///
    /// Standard C `munlock` contract.
    #[no_mangle]
    pub unsafe extern "C" fn munlock(addr: *const c_void, len: libc::size_t) -> c_int {
        if !tracer().initialized() {
            output::fatal(format_args!("munlock before tracer initialization"));
        }
        let real = tracer().real();
        traced_call(
            Event::Munlock,
            len,
            format_args!("0x{:x}, {}", addr as usize, len),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.munlock)(addr, len) }
            },
            |n| Ret::Num(*n),
        )
    }

    /// # Safety
    ///
    /// Standard C `mlockall` contract.
    #[no_mangle]
    pub unsafe extern "C" fn mlockall(flags: c_int) -> c_int {
        ensure_init();
        if !tracer().initialized() {
            output::fatal(format_args!("mlockall before tracer initialization"));
        }
        let real = tracer().real();
        traced_call(
            Event::Mlockall,
            0,
            format_args!("{flags}"),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.mlockall)(flags) }
            },
            |n| Ret::Num(*n),
        )
    }

    /// # Safety
    ///
    /// Standard C `munlockall` contract.
    #[no_mangle]
    pub unsafe extern "C" fn munlockall() -> c_int {
        if !tracer().initialized() {
            output::fatal(format_args!("munlockall before tracer initialization"));
        }
        let real = tracer().real();
        traced_call(
            Event::Munlockall,
            0,
            format_args!(""),
            || {
                // SAFETY: forwarding unchanged.
                unsafe { (real.munlockall)() }
            },
            |n| Ret::Num(*n),
        )
    }

    /// # Safety
    ///
    /// Standard C `getenv` contract.
    #[no_mangle]
    pub unsafe extern "C" fn getenv(name: *const c_char) -> *mut c_char {
        if name.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: caller passes a NUL-terminated string.
        let key = unsafe { CStr::from_ptr(name) };

        #[cfg(feature = "legacy_arm_unwind")]
        if key.to_bytes() == b"UNW_ARM_UNWIND_METHOD" {
            // DWARF | EXIDX; the frame-pointer method crashes the unwinder
            // on these platforms.
            static METHOD: &CStr = c"5";
            return METHOD.as_ptr() as *mut c_char;
        }

        // Answering this one from inside the allocator's own early path
        // deadlocks: the lookup re-enters the allocator mid-resolution.
        if key.to_bytes() == b"MALLOC_OPTIONS" {
            return core::ptr::null_mut();
        }

        ensure_init();
        if !tracer().initialized() {
            output::fatal(format_args!("getenv before tracer initialization"));
        }
        // SAFETY: forwarding unchanged.
        unsafe { (tracer().real().getenv)(name) }
    }

    /// # Safety
    ///
    /// Standard `dlclose` contract.
    #[no_mangle]
    pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
        if !tracer().initialized() {
            output::fatal(format_args!("dlclose before tracer initialization"));
        }
        let t = tracer();
        // SAFETY: forwarding unchanged.
        let ret = unsafe { (t.real().dlclose)(handle) };

        // Unloading invalidates cached procedure info and the executable
        // layout; flush both with the gate held so any allocations the
        // flushes make are not themselves traced.
        let _g = gate::suppress();
        unwind::flush_cache();
        t.maps.mark_stale();
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fn_resolves_libc_and_rejects_nonsense() {
        // SAFETY: signature matches libc malloc/free.
        let malloc: Option<MallocFn> = unsafe { next_fn(c"malloc") };
        let free: Option<FreeFn> = unsafe { next_fn(c"free") };
        let p = unsafe { (malloc.unwrap())(16) };
        assert!(!p.is_null());
        unsafe { (free.unwrap())(p) };

        let missing: Option<MallocFn> = unsafe { next_fn(c"mtrace_no_such_symbol") };
        assert!(missing.is_none());
    }

    #[test]
    fn real_fns_resolve_completely() {
        // SAFETY: test binary links libc; signatures match.
        let real = unsafe { RealFns::resolve() };
        let p = unsafe { (real.calloc)(4, 8) };
        assert!(!p.is_null());
        unsafe { (real.free)(p) };
    }

    #[test]
    fn fresh_tracer_serves_fallback_options() {
        let t = Tracer::new();
        assert_eq!(t.opts().mode, Mode::Growth);
        assert_eq!(t.opts().backtrace_depth, options::DEFAULT_BACKTRACE_DEPTH);
        assert_eq!(t.page_size(), DEFAULT_PAGE_SIZE);
        assert!(!t.initialized());
    }
}
