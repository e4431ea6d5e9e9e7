//! Anti-detection ("transparent mode") filtering.
//!
//! While enabled, observable side channels are rewritten so the guest
//! cannot see the debugger: the hypervisor-present CPUID bits disappear,
//! `NtQuerySystemInformation` results are scrubbed on the way back to
//! user mode, and emulated TSC reads get bounded jitter.
//!
//! The syscall-side flow: a hidden breakpoint at the kernel syscall entry
//! reports every system call; for the watched ones the filter records
//! `(pid, tid, info class, output buffer)` and arms the trap flag in the
//! syscall-preserved R11 image. The #DB that fires when the call returns
//! to user mode looks the record up and scrubs the output buffer through
//! the memory mapper.

use crate::mapper::GuestMemory;
use crate::sync::SpinLock;
use core::sync::atomic::{AtomicBool, Ordering};
use vtx::cpuid::{CpuidResult, CPUID_HV_INTERFACE_LEAF, CPUID_HV_VENDOR_LEAF, CPUID_HYPERVISOR_PRESENT_BIT};
use vtx::{VirtAddr, PAGE_SIZE};

/// x64 system-call numbers the filter watches.
#[derive(Debug, Clone, Copy)]
pub struct WatchedSyscalls {
    pub nt_query_system_information: u32,
    pub nt_query_system_information_ex: u32,
}

impl Default for WatchedSyscalls {
    fn default() -> Self {
        Self {
            nt_query_system_information: 0x36,
            nt_query_system_information_ex: 0x16A,
        }
    }
}

/// `SYSTEM_INFORMATION_CLASS` values the scrubber understands.
pub const SYSTEM_PROCESS_INFORMATION: u32 = 5;
pub const SYSTEM_MODULE_INFORMATION: u32 = 11;
pub const SYSTEM_KERNEL_DEBUGGER_INFORMATION: u32 = 35;
pub const SYSTEM_CODE_INTEGRITY_INFORMATION: u32 = 103;

/// Driver-name substrings removed from `SystemModuleInformation`.
pub const HIDDEN_DRIVER_NAMES: &[&str] = &["kdhv.sys", "kdhv", "vtxhv"];

/// Debugger-tool image names whose display names get randomized in
/// `SystemProcessInformation`.
pub const HIDDEN_PROCESS_NAMES: &[&str] = &["kdctl.exe", "kdremote.exe"];

/// One tracked in-flight watched syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapContext {
    /// The system-call number observed in RAX.
    pub syscall_number: u32,
    /// The requested information class.
    pub info_class: u32,
    /// Captured output buffer pointer.
    pub buffer: u64,
    /// Captured output buffer size.
    pub buffer_len: u32,
}

/// Result of storing a trap record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StoreResult {
    Stored,
    /// The `(pid, tid)` key is already tracked; the caller must not arm
    /// a second trap flag for the same thread.
    AlreadyTracked,
    /// The array is full; arming is disabled until entries drain.
    Full,
}

/// Fixed-capacity sorted array of `(pid<<32)|tid` keys, giving
/// `O(log n)` lookup from the #DB path.
pub struct TrapTracker {
    keys: [u64; Self::CAPACITY],
    contexts: [TrapContext; Self::CAPACITY],
    len: usize,
}

impl TrapTracker {
    /// Compile-time ceiling on simultaneously trapped threads.
    pub const CAPACITY: usize = 256;

    pub const fn new() -> Self {
        Self {
            keys: [0; Self::CAPACITY],
            contexts: [TrapContext {
                syscall_number: 0,
                info_class: 0,
                buffer: 0,
                buffer_len: 0,
            }; Self::CAPACITY],
            len: 0,
        }
    }

    fn key(pid: u32, tid: u32) -> u64 {
        ((pid as u64) << 32) | tid as u64
    }

    /// Insert a record, keeping the array sorted.
    pub fn store(&mut self, pid: u32, tid: u32, context: TrapContext) -> StoreResult {
        let key = Self::key(pid, tid);
        match self.keys[..self.len].binary_search(&key) {
            Ok(_) => StoreResult::AlreadyTracked,
            Err(position) => {
                if self.len == Self::CAPACITY {
                    return StoreResult::Full;
                }
                self.keys[..self.len + 1].copy_within(position..self.len, position + 1);
                self.contexts[..self.len + 1].copy_within(position..self.len, position + 1);
                self.keys[position] = key;
                self.contexts[position] = context;
                self.len += 1;
                StoreResult::Stored
            }
        }
    }

    /// Look up and remove the record for a thread.
    pub fn take(&mut self, pid: u32, tid: u32) -> Option<TrapContext> {
        let key = Self::key(pid, tid);
        let position = self.keys[..self.len].binary_search(&key).ok()?;
        let context = self.contexts[position];
        self.keys.copy_within(position + 1..self.len, position);
        self.contexts.copy_within(position + 1..self.len, position);
        self.len -= 1;
        Some(context)
    }

    /// Number of tracked threads.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for TrapTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of the TSC jitter, caller-supplied when transparency is
/// enabled.
#[derive(Debug, Clone, Copy)]
pub struct TscJitterParams {
    pub mean: u64,
    pub stddev: u64,
    pub median: u64,
}

impl Default for TscJitterParams {
    fn default() -> Self {
        Self {
            mean: 5000,
            stddev: 1000,
            median: 5000,
        }
    }
}

/// Xorshift64 state for the jitter; seeded from the TSC at enable time.
struct Prng(u64);

impl Prng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// An integer approximation of a Gaussian sample: the sum of twelve
/// uniforms over `[0, 2*stddev)` is centered on `12*stddev`; recentering
/// on the mean gives bounded, non-zero entropy.
fn gaussian_offset(prng: &mut Prng, params: &TscJitterParams) -> i64 {
    let spread = (params.stddev.max(1)) * 2;
    let mut sum = 0i64;
    for _ in 0..12 {
        sum += (prng.next() % spread) as i64;
    }
    sum - (6 * spread as i64) + params.mean as i64 - params.median as i64
}

/// The transparent-mode filter.
pub struct Transparent {
    enabled: AtomicBool,
    pub syscalls: WatchedSyscalls,
    tracker: SpinLock<TrapTracker>,
    jitter: SpinLock<(TscJitterParams, Prng)>,
    /// Set while the tracker is full; no more trap flags are armed.
    arming_disabled: AtomicBool,
    /// Guest VA of the hidden breakpoint at the kernel syscall entry
    /// (LSTAR target plus the swapgs/stack preface), zero when absent.
    syscall_probe_va: core::sync::atomic::AtomicU64,
}

impl Transparent {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            syscalls: WatchedSyscalls::default(),
            tracker: SpinLock::new(TrapTracker::new()),
            jitter: SpinLock::new((TscJitterParams::default(), Prng(0x2545_F491_4F6C_DD1D))),
            arming_disabled: AtomicBool::new(false),
            syscall_probe_va: core::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Record where the syscall-entry probe breakpoint sits.
    pub fn set_syscall_probe(&self, va: u64) {
        self.syscall_probe_va.store(va, Ordering::Release);
    }

    /// Whether `va` is the syscall-entry probe.
    pub fn is_syscall_probe(&self, va: u64) -> bool {
        va != 0 && self.syscall_probe_va.load(Ordering::Acquire) == va
    }

    /// The probe address, if one is installed.
    pub fn syscall_probe(&self) -> Option<u64> {
        match self.syscall_probe_va.load(Ordering::Acquire) {
            0 => None,
            va => Some(va),
        }
    }

    /// Turn the filter on with the given jitter parameters.
    pub fn enable(&self, params: TscJitterParams, seed: u64) {
        {
            let mut jitter = self.jitter.lock();
            jitter.0 = params;
            jitter.1 = Prng(seed | 1);
        }
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// A watched syscall was observed. Records the thread and reports
    /// whether the caller should arm the trap flag in the saved R11.
    pub fn on_watched_syscall(&self, pid: u32, tid: u32, context: TrapContext) -> bool {
        if !self.is_enabled() || self.arming_disabled.load(Ordering::Acquire) {
            return false;
        }
        match self.tracker.lock().store(pid, tid, context) {
            StoreResult::Stored => true,
            StoreResult::AlreadyTracked => false,
            StoreResult::Full => {
                self.arming_disabled.store(true, Ordering::Release);
                false
            }
        }
    }

    /// The #DB fired for a tracked thread: fetch its record and re-enable
    /// arming if the full condition drained.
    pub fn take_trap(&self, pid: u32, tid: u32) -> Option<TrapContext> {
        let mut tracker = self.tracker.lock();
        let context = tracker.take(pid, tid);
        if context.is_some() && tracker.len() < TrapTracker::CAPACITY {
            self.arming_disabled.store(false, Ordering::Release);
        }
        context
    }

    /// Scrub the output buffer of a completed watched syscall in guest
    /// memory. Returns false when the guest buffer was unreadable.
    pub fn scrub_completed_syscall(
        &self,
        mem: &dyn GuestMemory,
        cr3: u64,
        context: &TrapContext,
    ) -> bool {
        let Some(buffer_va) = VirtAddr::new(context.buffer) else {
            return false;
        };
        let len = (context.buffer_len as usize).min(MAX_SCRUB_BYTES);
        if len == 0 {
            return false;
        }
        let mut scratch = alloc::vec![0u8; len];
        if !mem.read_virt(buffer_va, cr3, &mut scratch) {
            return false;
        }
        let modified = match context.info_class {
            SYSTEM_MODULE_INFORMATION => scrub_module_information(&mut scratch),
            SYSTEM_PROCESS_INFORMATION => {
                let mut prng_guard = self.jitter.lock();
                let prng = &mut prng_guard.1;
                scrub_process_information(&mut scratch, context.buffer, &mut || prng.next())
            }
            SYSTEM_KERNEL_DEBUGGER_INFORMATION => scrub_kernel_debugger_information(&mut scratch),
            SYSTEM_CODE_INTEGRITY_INFORMATION => scrub_code_integrity_information(&mut scratch),
            _ => false,
        };
        if modified {
            mem.write_virt(buffer_va, cr3, &scratch)
        } else {
            true
        }
    }

    /// Jittered value for an emulated RDTSC/RDTSCP.
    pub fn jittered_tsc(&self, tsc: u64) -> u64 {
        let mut guard = self.jitter.lock();
        let (params, prng) = &mut *guard;
        let offset = gaussian_offset(prng, params);
        tsc.saturating_add_signed(offset)
    }

    /// CPUID results as the guest should see them.
    pub fn filter_cpuid(&self, leaf: u32, result: CpuidResult) -> CpuidResult {
        if !self.is_enabled() {
            return result;
        }
        filter_cpuid_leaf(leaf, result)
    }
}

impl Default for Transparent {
    fn default() -> Self {
        Self::new()
    }
}

/// Cap on how much of a guest result buffer the scrubber will copy.
const MAX_SCRUB_BYTES: usize = 64 * PAGE_SIZE;

/// Bytes of syscall-entry preface (swapgs and the stack switch) skipped
/// before the probe breakpoint.
pub const SYSCALL_ENTRY_PROBE_OFFSET: u64 = 3;

/// Turn transparency on: install the hidden breakpoint at the kernel
/// syscall entry so every system call reports in, then enable the
/// filter. Runs from non-root at passive level.
pub fn activate(
    hv: &crate::Hypervisor<'_>,
    params: TscJitterParams,
) -> Result<(), wire::ErrorCode> {
    let lstar = lstar_target();
    if lstar == 0 {
        return Err(wire::ErrorCode::UnableToHideOrUnhideDebugger);
    }
    let probe = lstar + SYSCALL_ENTRY_PROBE_OFFSET;
    let Some(probe_va) = VirtAddr::new(probe) else {
        return Err(wire::ErrorCode::InvalidAddress);
    };
    {
        let mut ept = hv.ept.lock();
        crate::hooks::install_hidden_breakpoint(
            &mut ept,
            hv.platform,
            &hv.pools,
            &hv.mapper,
            probe_va,
            hv.mapper.kernel_cr3(),
        )?;
    }
    hv.transparent.set_syscall_probe(probe);
    hv.transparent.enable(params, seed());
    Ok(())
}

/// Turn transparency off and remove the syscall probe.
pub fn deactivate(hv: &crate::Hypervisor<'_>) -> Result<(), wire::ErrorCode> {
    if !hv.transparent.is_enabled() {
        return Err(wire::ErrorCode::DebuggerAlreadyUnhidden);
    }
    hv.transparent.disable();
    if let Some(probe) = hv.transparent.syscall_probe() {
        if let Some(probe_va) = VirtAddr::new(probe) {
            let mut ept = hv.ept.lock();
            let _ = crate::hooks::remove_hidden_breakpoint(
                &mut ept,
                hv.platform,
                &hv.pools,
                &hv.mapper,
                probe_va,
                hv.mapper.kernel_cr3(),
            );
        }
        hv.transparent.set_syscall_probe(0);
    }
    Ok(())
}

fn lstar_target() -> u64 {
    #[cfg(not(test))]
    {
        vtx::msr::Msr::<{ vtx::msr::IA32_LSTAR }>::read()
    }
    #[cfg(test)]
    {
        0
    }
}

fn seed() -> u64 {
    #[cfg(not(test))]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(test)]
    {
        0x5EED
    }
}

/// Hide the hypervisor from CPUID: clear the hypervisor-present bit in
/// leaf 1 and return zeros for the vendor and Hyper-V interface leaves.
pub fn filter_cpuid_leaf(leaf: u32, mut result: CpuidResult) -> CpuidResult {
    match leaf {
        1 => {
            result.ecx &= !CPUID_HYPERVISOR_PRESENT_BIT;
            result
        }
        CPUID_HV_VENDOR_LEAF | CPUID_HV_INTERFACE_LEAF => CpuidResult::default(),
        _ => result,
    }
}

// RTL_PROCESS_MODULES layout on x64: a ULONG count, 4 bytes of padding,
// then 0x128-byte entries whose FullPathName field sits at offset 0x28.
const MODULE_ENTRY_SIZE: usize = 0x128;
const MODULE_ENTRIES_OFFSET: usize = 8;
const MODULE_PATH_OFFSET: usize = 0x28;
const MODULE_PATH_SIZE: usize = 256;

/// Remove entries naming one of [`HIDDEN_DRIVER_NAMES`] from a
/// `SystemModuleInformation` result. Returns whether anything changed.
pub fn scrub_module_information(buffer: &mut [u8]) -> bool {
    if buffer.len() < MODULE_ENTRIES_OFFSET {
        return false;
    }
    let count = u32::from_le_bytes(buffer[0..4].try_into().unwrap()) as usize;
    let available = (buffer.len() - MODULE_ENTRIES_OFFSET) / MODULE_ENTRY_SIZE;
    let count = count.min(available);

    let mut kept = 0usize;
    let mut changed = false;
    for i in 0..count {
        let at = MODULE_ENTRIES_OFFSET + i * MODULE_ENTRY_SIZE;
        let path = &buffer[at + MODULE_PATH_OFFSET..at + MODULE_PATH_OFFSET + MODULE_PATH_SIZE];
        let hidden = HIDDEN_DRIVER_NAMES
            .iter()
            .any(|name| contains_ascii(path, name.as_bytes()));
        if hidden {
            changed = true;
            continue;
        }
        if kept != i {
            let dst = MODULE_ENTRIES_OFFSET + kept * MODULE_ENTRY_SIZE;
            buffer.copy_within(at..at + MODULE_ENTRY_SIZE, dst);
        }
        kept += 1;
    }
    if changed {
        buffer[0..4].copy_from_slice(&(kept as u32).to_le_bytes());
        // Zero the now-stale tail entries.
        let tail = MODULE_ENTRIES_OFFSET + kept * MODULE_ENTRY_SIZE;
        let end = MODULE_ENTRIES_OFFSET + count * MODULE_ENTRY_SIZE;
        buffer[tail..end].fill(0);
    }
    changed
}

// SYSTEM_PROCESS_INFORMATION on x64: NextEntryOffset at 0, the ImageName
// UNICODE_STRING at 0x38 (Length u16, MaximumLength u16, Buffer at 0x40).
const PROCESS_IMAGE_NAME_OFFSET: usize = 0x38;
const PROCESS_IMAGE_BUFFER_OFFSET: usize = 0x40;

/// Randomize the display names of known debugger processes in a
/// `SystemProcessInformation` result.
///
/// `buffer_va` is the guest virtual address the buffer was captured from;
/// name buffers pointing outside the captured region are left alone.
pub fn scrub_process_information(
    buffer: &mut [u8],
    buffer_va: u64,
    random: &mut dyn FnMut() -> u64,
) -> bool {
    let mut changed = false;
    let mut at = 0usize;
    loop {
        if at + PROCESS_IMAGE_BUFFER_OFFSET + 8 > buffer.len() {
            break;
        }
        let next = u32::from_le_bytes(buffer[at..at + 4].try_into().unwrap()) as usize;
        let name_len =
            u16::from_le_bytes(buffer[at + PROCESS_IMAGE_NAME_OFFSET..at + PROCESS_IMAGE_NAME_OFFSET + 2].try_into().unwrap())
                as usize;
        let name_ptr = u64::from_le_bytes(
            buffer[at + PROCESS_IMAGE_BUFFER_OFFSET..at + PROCESS_IMAGE_BUFFER_OFFSET + 8]
                .try_into()
                .unwrap(),
        );

        if name_len > 0 && name_ptr >= buffer_va {
            let name_offset = (name_ptr - buffer_va) as usize;
            if name_offset + name_len <= buffer.len() {
                if let Some(name) = utf16_to_ascii_lower(&buffer[name_offset..name_offset + name_len]) {
                    if HIDDEN_PROCESS_NAMES.iter().any(|h| name == h.as_bytes()) {
                        // Randomize every character, keeping valid ASCII.
                        for i in (0..name_len).step_by(2) {
                            let c = b'a' + (random() % 26) as u8;
                            buffer[name_offset + i] = c;
                            buffer[name_offset + i + 1] = 0;
                        }
                        changed = true;
                    }
                }
            }
        }

        if next == 0 {
            break;
        }
        at += next;
    }
    changed
}

/// Force `SystemKernelDebuggerInformation` to "no debugger present".
pub fn scrub_kernel_debugger_information(buffer: &mut [u8]) -> bool {
    if buffer.len() < 2 {
        return false;
    }
    buffer[0] = 0; // KernelDebuggerEnabled
    buffer[1] = 1; // KernelDebuggerNotPresent
    true
}

/// Force `SystemCodeIntegrityInformation.CodeIntegrityOptions` to the
/// enabled-only value.
pub fn scrub_code_integrity_information(buffer: &mut [u8]) -> bool {
    if buffer.len() < 8 {
        return false;
    }
    buffer[4..8].copy_from_slice(&1u32.to_le_bytes());
    true
}

fn contains_ascii(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Decode little-endian UTF-16 into lowercase ASCII bytes; `None` when
/// any unit is outside ASCII.
fn utf16_to_ascii_lower(bytes: &[u8]) -> Option<alloc::vec::Vec<u8>> {
    let mut out = alloc::vec::Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 || unit > 0x7F {
            return None;
        }
        out.push((unit as u8).to_ascii_lowercase());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_sorted_insert_lookup_remove() {
        let mut tracker = TrapTracker::new();
        let ctx = |n: u32| TrapContext {
            syscall_number: n,
            info_class: 0,
            buffer: 0,
            buffer_len: 0,
        };
        assert_eq!(tracker.store(30, 2, ctx(1)), StoreResult::Stored);
        assert_eq!(tracker.store(10, 5, ctx(2)), StoreResult::Stored);
        assert_eq!(tracker.store(20, 1, ctx(3)), StoreResult::Stored);
        assert_eq!(tracker.len(), 3);

        // Duplicate key is reported, not silently succeeded.
        assert_eq!(tracker.store(20, 1, ctx(9)), StoreResult::AlreadyTracked);

        assert_eq!(tracker.take(10, 5).unwrap().syscall_number, 2);
        assert!(tracker.take(10, 5).is_none());
        assert_eq!(tracker.take(30, 2).unwrap().syscall_number, 1);
        assert_eq!(tracker.take(20, 1).unwrap().syscall_number, 3);
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_overflow_reports_full() {
        let mut tracker = TrapTracker::new();
        for i in 0..TrapTracker::CAPACITY {
            assert_eq!(
                tracker.store(1, i as u32, TrapContext::default()),
                StoreResult::Stored
            );
        }
        assert_eq!(
            tracker.store(2, 0, TrapContext::default()),
            StoreResult::Full
        );
    }

    #[test]
    fn arming_disables_on_full_and_recovers() {
        let transparent = Transparent::new();
        transparent.enable(TscJitterParams::default(), 42);
        for i in 0..TrapTracker::CAPACITY {
            assert!(transparent.on_watched_syscall(1, i as u32, TrapContext::default()));
        }
        // Full: arming stops.
        assert!(!transparent.on_watched_syscall(2, 0, TrapContext::default()));
        assert!(!transparent.on_watched_syscall(2, 1, TrapContext::default()));
        // Draining one re-enables arming.
        assert!(transparent.take_trap(1, 0).is_some());
        assert!(transparent.on_watched_syscall(2, 0, TrapContext::default()));
    }

    #[test]
    fn cpuid_filter_hides_the_hypervisor() {
        let leaf1 = CpuidResult {
            eax: 0x000906EA,
            ebx: 0,
            ecx: CPUID_HYPERVISOR_PRESENT_BIT | 0x7FFA_FBBF,
            edx: 0xBFEB_FBFF,
        };
        let filtered = filter_cpuid_leaf(1, leaf1);
        assert_eq!(filtered.ecx & CPUID_HYPERVISOR_PRESENT_BIT, 0);
        assert_eq!(filtered.ecx, 0x7FFA_FBBF);

        let vendor = filter_cpuid_leaf(
            CPUID_HV_VENDOR_LEAF,
            CpuidResult {
                eax: 0x4000_0001,
                ebx: 0x7263_694D,
                ecx: 0x666F_736F,
                edx: 0x7620_7448,
            },
        );
        assert_eq!(vendor, CpuidResult::default());

        // Unrelated leaves pass through.
        let other = CpuidResult {
            eax: 0x17,
            ebx: 1,
            ecx: 2,
            edx: 3,
        };
        assert_eq!(filter_cpuid_leaf(7, other), other);
    }

    fn module_buffer(names: &[&str]) -> Vec<u8> {
        let mut buffer = vec![0u8; MODULE_ENTRIES_OFFSET + names.len() * MODULE_ENTRY_SIZE];
        buffer[0..4].copy_from_slice(&(names.len() as u32).to_le_bytes());
        for (i, name) in names.iter().enumerate() {
            let at = MODULE_ENTRIES_OFFSET + i * MODULE_ENTRY_SIZE + MODULE_PATH_OFFSET;
            buffer[at..at + name.len()].copy_from_slice(name.as_bytes());
        }
        buffer
    }

    #[test]
    fn module_scrub_drops_hidden_drivers_and_fixes_count() {
        let mut buffer = module_buffer(&[
            r"\SystemRoot\system32\ntoskrnl.exe",
            r"\SystemRoot\system32\drivers\kdhv.sys",
            r"\SystemRoot\system32\hal.dll",
        ]);
        assert!(scrub_module_information(&mut buffer));
        let count = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        assert_eq!(count, 2);

        let path_at = |i: usize| {
            let at = MODULE_ENTRIES_OFFSET + i * MODULE_ENTRY_SIZE + MODULE_PATH_OFFSET;
            &buffer[at..at + MODULE_PATH_SIZE]
        };
        assert!(contains_ascii(path_at(0), b"ntoskrnl.exe"));
        assert!(contains_ascii(path_at(1), b"hal.dll"));
        // The stale third slot is wiped.
        assert!(path_at(2).iter().all(|b| *b == 0));
    }

    #[test]
    fn module_scrub_without_matches_changes_nothing() {
        let mut buffer = module_buffer(&[r"\SystemRoot\system32\ntoskrnl.exe"]);
        let before = buffer.clone();
        assert!(!scrub_module_information(&mut buffer));
        assert_eq!(buffer, before);
    }

    fn process_buffer(base_va: u64, names: &[&str]) -> Vec<u8> {
        // Each entry: 0x100 header + inline UTF-16 name at +0x100.
        let entry_size = 0x180usize;
        let mut buffer = vec![0u8; names.len() * entry_size];
        for (i, name) in names.iter().enumerate() {
            let at = i * entry_size;
            let next = if i + 1 == names.len() { 0 } else { entry_size as u32 };
            buffer[at..at + 4].copy_from_slice(&next.to_le_bytes());
            let name_bytes: Vec<u8> = name
                .bytes()
                .flat_map(|b| [b, 0])
                .collect();
            let name_off = at + 0x100;
            buffer[name_off..name_off + name_bytes.len()].copy_from_slice(&name_bytes);
            buffer[at + PROCESS_IMAGE_NAME_OFFSET..at + PROCESS_IMAGE_NAME_OFFSET + 2]
                .copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            buffer[at + PROCESS_IMAGE_BUFFER_OFFSET..at + PROCESS_IMAGE_BUFFER_OFFSET + 8]
                .copy_from_slice(&(base_va + name_off as u64).to_le_bytes());
        }
        buffer
    }

    #[test]
    fn process_scrub_randomizes_only_debugger_names() {
        let base = 0x7FF6_0000_0000u64;
        let mut buffer = process_buffer(base, &["svchost.exe", "kdctl.exe", "notepad.exe"]);
        let mut counter = 0u64;
        let mut rng = move || {
            counter += 7;
            counter
        };
        assert!(scrub_process_information(&mut buffer, base, &mut rng));

        let name_at = |buffer: &[u8], i: usize| {
            let off = i * 0x180 + 0x100;
            let len = u16::from_le_bytes(
                buffer[i * 0x180 + PROCESS_IMAGE_NAME_OFFSET..i * 0x180 + PROCESS_IMAGE_NAME_OFFSET + 2]
                    .try_into()
                    .unwrap(),
            ) as usize;
            utf16_to_ascii_lower(&buffer[off..off + len]).unwrap()
        };
        assert_eq!(name_at(&buffer, 0), b"svchost.exe");
        assert_ne!(name_at(&buffer, 1), b"kdctl.exe");
        assert_eq!(name_at(&buffer, 1).len(), b"kdctl.exe".len());
        assert_eq!(name_at(&buffer, 2), b"notepad.exe");
    }

    #[test]
    fn kernel_debugger_information_reports_absent() {
        let mut buffer = [1u8, 0];
        assert!(scrub_kernel_debugger_information(&mut buffer));
        assert_eq!(buffer, [0, 1]);
    }

    #[test]
    fn code_integrity_options_forced_to_enabled() {
        let mut buffer = [8u8, 0, 0, 0, 0xFF, 0xFF, 0, 0];
        assert!(scrub_code_integrity_information(&mut buffer));
        assert_eq!(&buffer[4..8], &1u32.to_le_bytes());
    }

    #[test]
    fn tsc_jitter_is_bounded_and_nonzero() {
        let transparent = Transparent::new();
        let params = TscJitterParams {
            mean: 1000,
            stddev: 100,
            median: 1000,
        };
        transparent.enable(params, 0xDEAD_BEEF);
        let base = 1_000_000_000u64;
        let mut saw_difference = false;
        for _ in 0..64 {
            let v = transparent.jittered_tsc(base);
            // Bounded: twelve uniforms over [0, 2s) stay within 12s of
            // either side of the center.
            let bound = 12 * 2 * params.stddev;
            assert!(v >= base - bound && v <= base + bound);
            if v != base {
                saw_difference = true;
            }
        }
        assert!(saw_difference);
    }
}
