//! Per-CPU process table, scheduler, and lifecycle operations — the heart
//! of spec.md §§3-4. Grounded in the teacher's `kernel/src/proc.rs`
//! (`CpuTable`/`ProcTable`, `Proc { id, inner: SpinLock<ProcInner>, data:
//! UnsafeCell<ProcData> }`, `Pid`, `Channel`, static singletons via
//! `OnceLock`) for the idiom, and in
//! `original_source/OS_ASS2/kernel/proc.c` for the extension the teacher's
//! single-shared-list xv6 port never needed: per-CPU runnable lists,
//! hand-over-hand list locking, CAS admission/size counters, affinity, and
//! load balancing/work stealing (see `list.rs`).
//!
//! Per Design Notes §9, `next` is an arena index (`Option<usize>`) behind
//! its own per-slot link lock, not a raw pointer, and `parent` is a slot
//! index behind the single global `wait_lock` — exactly the alternative
//! spec.md's Design Notes recommend, and exactly what the teacher's own
//! `ProcTable.parents: SpinLock<[Option<usize>; NPROC]>` already does for
//! vanilla xv6's single shared list.

use alloc::boxed::Box;
use alloc::string::String;

use crate::error::KernelError;
use crate::file::File;
use crate::fs::{self, Inode};
use crate::hal;
use crate::list::{CasCounter, LinkTable, List};
use crate::param::{BALANCE, NCPU, NOFILE, NPROC, PGSIZE, STEAL, kstack};
use crate::spinlock::{self, SpinLock, SpinLockGuard};
use crate::sync::OnceLock;
use crate::vm::UserMemory;

/// Saved kernel register state for a context switch. A real deployment's
/// `swtch` (hand-written assembly, explicitly out of scope per spec.md
/// §1/§6) saves/restores exactly these callee-saved registers plus the
/// return address and stack pointer — the shape the teacher's own
/// `Context` uses.
#[cfg(not(test))]
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

#[cfg(not(test))]
impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Under test there is no hart to save registers on; every simulated CPU
/// and process body is a genuine `std::thread`, and a "context switch" is
/// a [`crate::baton::Baton`] rendezvous (see `baton.rs`).
#[cfg(test)]
#[derive(Debug, Default)]
pub struct Context {
    pub baton: crate::baton::Baton,
}

#[cfg(test)]
impl Context {
    pub const fn new() -> Self {
        Self {
            baton: crate::baton::Baton::new(),
        }
    }
}

#[cfg(not(test))]
unsafe extern "Rust" {
    /// The real `swtch(save_ctx, load_ctx)` primitive (spec.md §6): saves
    /// the caller's registers into `save` and loads `load`'s into the
    /// hart. Supplied by the deployed kernel's assembly, the same way
    /// `hal.rs` expects its own extern hooks.
    fn corvid_swtch(save: *mut Context, load: *const Context);
}

/// Switches from `leaving`'s saved context to `entering`'s. Called
/// symmetrically by both sides of a context switch: the scheduler
/// dispatching a process (`leaving` = `cpu.context`, `entering` =
/// `proc.context`), and a process returning to its scheduler through
/// [`sched`] (reversed).
#[cfg(not(test))]
pub fn swtch(leaving: &mut Context, entering: &Context) {
    unsafe { corvid_swtch(leaving as *mut Context, entering as *const Context) }
}

#[cfg(test)]
pub fn swtch(leaving: &mut Context, entering: &Context) {
    crate::baton::swtch(&leaving.baton, &entering.baton)
}

/// Per-CPU state (spec.md §3 "CPU record"). `runnable` is this CPU's slice
/// of the `RUNNABLE` list family (one per CPU, spec.md §3); `proc_list_size`
/// and `admitted_process_count` are the two per-CPU CAS counters spec.md
/// §4.1 names. `noff`/`intena` belong to the cpu-kernel-thread, not the CPU
/// itself (spec.md §3's own parenthetical), and already live in
/// `spinlock.rs`'s per-hart `PUSH_OFF` table instead of here.
pub struct Cpu {
    /// Slot index of the process currently dispatched on this CPU, if any.
    pub proc: Option<usize>,
    /// This CPU's saved scheduler context; `swtch` into it returns control
    /// to the top of the scheduler loop.
    pub context: Context,
    pub runnable: List,
    pub proc_list_size: CasCounter,
    pub admitted_process_count: CasCounter,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            runnable: List::new("runnable"),
            proc_list_size: CasCounter::new(0),
            admitted_process_count: CasCounter::new(0),
        }
    }
}

/// Table of per-CPU records, one static singleton per spec.md Design
/// Notes ("model them as a single owned kernel value... or equivalent
/// singleton discipline").
pub struct CpuTable([core::cell::UnsafeCell<Cpu>; NCPU]);

unsafe impl Sync for CpuTable {}

impl CpuTable {
    const fn new() -> Self {
        Self([const { core::cell::UnsafeCell::new(Cpu::new()) }; NCPU])
    }

    pub fn get(&self, idx: usize) -> &Cpu {
        unsafe { &*self.0[idx].get() }
    }

    /// # Safety
    /// The caller must be the single kernel thread bound to hart `idx` —
    /// the only code that may ever mutate that CPU's `proc`/`context`.
    unsafe fn get_mut(&self, idx: usize) -> &mut Cpu {
        unsafe { &mut *self.0[idx].get() }
    }
}

pub static CPU_TABLE: CpuTable = CpuTable::new();
pub static PROC_TABLE: ProcTable = ProcTable::new();
/// Slot index of `init`, set once by [`userinit`]. `reparent`/`exit` hand
/// orphaned children to it.
pub static INIT_PROC: OnceLock<usize> = OnceLock::new();

static UNUSED: List = List::new("unused");
static SLEEPING: List = List::new("sleeping");
static ZOMBIE: List = List::new("zombie");

type ParentTable = [Option<usize>; NPROC];
/// spec.md §3's `wait_lock`: guards the table-wide parent/child mapping
/// (slot index of each process's parent, if any), per Design Notes'
/// "avoid pointer-back references to parents: store a parent slot index
/// under `wait_lock`" and the teacher's own `ProcTable.parents`.
static WAIT_LOCK: SpinLock<ParentTable> = SpinLock::new([None; NPROC], "wait_lock");

static NEXT_PID: CasCounter = CasCounter::new(1);

/// spec.md §4.1: `allocpid` is one CAS-retried increment returning the
/// pre-increment value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    fn alloc() -> Self {
        Self(NEXT_PID.incr())
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;
    fn deref(&self) -> &usize {
        &self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque, address-valued wait-channel identity (spec.md GLOSSARY).
/// `sleep`/`wakeup` compare channels for equality only; nothing inspects
/// their value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(usize);

impl Channel {
    /// An arbitrary channel, for waiting on something other than another
    /// process (the teacher's `Channel` enum has variants for ticks, I/O
    /// buffers, locks; this core has no such collaborators in scope, but
    /// callers outside this core may still want to wait on their own
    /// tokens).
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// `wait`/`exit` sleep/wake on a process's own identity. Offset away
    /// from `usize`'s low range so an arbitrary `Channel::new(addr)` never
    /// collides with one of these by accident.
    fn of_proc(idx: usize) -> Self {
        Self(usize::MAX - idx)
    }
}

/// spec.md §3/§4.4 process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    /// `procdump`'s abbreviation (spec.md §6 Debug surface).
    fn abbrev(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Used => "used",
            ProcState::Sleeping => "sleep",
            ProcState::Runnable => "runble",
            ProcState::Running => "run",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Trapframe (spec.md GLOSSARY): per-process page saving user-mode
/// registers across kernel entry. Real trap handling is out of scope per
/// §1; the one field this core's own tests exercise is `a0`, the
/// register `fork` forces to 0 so the child observes its own fork call
/// returning 0 (P7).
#[derive(Debug, Clone, Default)]
pub struct TrapFrame {
    pub a0: usize,
}

/// Fields protected by `p.lock` (spec.md §3's `lock`, I5).
#[derive(Debug)]
pub struct ProcInner {
    pub state: ProcState,
    pub channel: Option<Channel>,
    pub killed: bool,
    pub xstate: isize,
    pub pid: Pid,
    /// CPU binding (spec.md §3 `cpu_num`); `-1` if unbound (only true
    /// transiently between `allocproc` and the first dispatch-list add).
    pub cpu_num: isize,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            channel: None,
            killed: false,
            xstate: 0,
            pid: Pid(0),
            cpu_num: -1,
        }
    }
}

/// Fields a process's own kernel thread (or `allocproc`/`freeproc`, which
/// hold exclusive access before the slot is visible on any list) may
/// touch without `p.lock` (spec.md §3's remaining fields).
pub struct ProcData {
    pub kstack: usize,
    pub sz: usize,
    pub pagetable: Option<UserMemory>,
    pub trapframe: Option<Box<TrapFrame>>,
    pub context: Context,
    pub ofile: [Option<File>; NOFILE],
    pub cwd: Option<Inode>,
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pagetable: None,
            trapframe: None,
            context: Context::new(),
            ofile: [const { None }; NOFILE],
            cwd: None,
            name: String::new(),
        }
    }

    pub fn trapframe(&self) -> &TrapFrame {
        self.trapframe.as_ref().expect("trapframe not allocated")
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        self.trapframe.as_mut().expect("trapframe not allocated")
    }

    pub fn pagetable(&self) -> &UserMemory {
        self.pagetable.as_ref().expect("pagetable not allocated")
    }

    pub fn pagetable_mut(&mut self) -> &mut UserMemory {
        self.pagetable.as_mut().expect("pagetable not allocated")
    }
}

unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

/// A process-table slot (spec.md §3 "Process record"). `id` is the fixed
/// arena index (distinct from `pid`, which is reassigned fresh on every
/// `allocproc`); `link` is the per-slot `link_lock` I2-I4 require, held to
/// read or write this slot's `next` pointer wherever it currently lives.
pub struct Proc {
    pub id: usize,
    pub inner: SpinLock<ProcInner>,
    link: SpinLock<Option<usize>>,
    data: core::cell::UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new(id: usize) -> Self {
        Self {
            id,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            link: SpinLock::new(None, "proc_link"),
            data: core::cell::UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// The caller must have exclusive access to this slot: either it is
    /// the current process, or the slot's state hasn't yet been published
    /// as `Runnable`/`Sleeping` (`allocproc`, `freeproc`, `fork`'s setup of
    /// the not-yet-runnable child).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }
}

impl LinkTable for Proc {
    fn link(&self, idx: usize) -> &SpinLock<Option<usize>> {
        // Only ever called through `ProcTable`, which redirects `idx` to
        // the right slot; this impl exists so `list.rs` can stay
        // `Proc`-agnostic, not so a bare `Proc` is itself a link table.
        debug_assert_eq!(idx, self.id);
        &self.link
    }
}

/// Fixed-size process table (spec.md §3: "a fixed-size array of process
/// slots (bounded pool)").
pub struct ProcTable([core::cell::UnsafeCell<Proc>; NPROC]);

unsafe impl Sync for ProcTable {}

impl ProcTable {
    const fn new() -> Self {
        let mut table: [core::mem::MaybeUninit<core::cell::UnsafeCell<Proc>>; NPROC] =
            unsafe { core::mem::MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NPROC {
            table[i] = core::mem::MaybeUninit::new(core::cell::UnsafeCell::new(Proc::new(i)));
            i += 1;
        }
        Self(unsafe { core::mem::transmute::<_, [core::cell::UnsafeCell<Proc>; NPROC]>(table) })
    }

    pub fn get(&self, idx: usize) -> &Proc {
        unsafe { &*self.0[idx].get() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        (0..NPROC).map(|i| self.get(i))
    }
}

impl LinkTable for ProcTable {
    fn link(&self, idx: usize) -> &SpinLock<Option<usize>> {
        self.get(idx).link(idx)
    }
}

fn current_cpu_id() -> usize {
    hal::hart_id()
}

pub fn cpuid() -> usize {
    current_cpu_id()
}

pub fn current_cpu() -> &'static Cpu {
    CPU_TABLE.get(current_cpu_id())
}

/// Returns the slot currently dispatched on this CPU, if any. Brackets the
/// read with `push_off`/`pop_off` so it can't race a hart migration — the
/// same protection the teacher's `lock_current_cpu` gives `current_proc`.
pub fn myproc() -> Option<&'static Proc> {
    spinlock::push_off();
    let idx = current_cpu().proc;
    spinlock::pop_off();
    idx.map(|i| PROC_TABLE.get(i))
}

fn current_proc() -> &'static Proc {
    myproc().expect("no current process")
}

fn is_init_proc(proc: &Proc) -> bool {
    INIT_PROC.get() == Some(&proc.id)
}

fn least_loaded_cpu() -> usize {
    (0..NCPU)
        .min_by_key(|&c| CPU_TABLE.get(c).admitted_process_count.get())
        .expect("NCPU > 0")
}

/// Transitions `proc` to `Runnable` on `target_cpu` and performs the
/// matching list/counter updates. Only an admission (`USED→RUNNABLE`,
/// `SLEEPING→RUNNABLE`) bumps `proc_list_size[target]` and
/// `admitted_process_count[target]`; the scheduler's dispatch
/// (`RUNNABLE→RUNNING`, via plain `remove_head`) makes no counter change,
/// so a plain `yield` (`RUNNING→RUNNABLE`, not an admission) must not bump
/// `proc_list_size` either, or the two drift apart — matching the original
/// source, whose `scheduler` and `yield` both leave the counter alone.
fn make_runnable(proc: &Proc, inner: &mut ProcInner, target_cpu: usize, is_admission: bool) {
    inner.cpu_num = target_cpu as isize;
    inner.state = ProcState::Runnable;
    let cpu = CPU_TABLE.get(target_cpu);
    cpu.runnable.add(&PROC_TABLE, proc.id);
    if is_admission {
        cpu.proc_list_size.incr();
        cpu.admitted_process_count.incr();
    }
    log::debug!("pid {} runnable on cpu {}", *inner.pid, target_cpu);
}

/// Initializes the process table: every slot is born on `UNUSED`
/// (spec.md §3 "Lifecycle"), with its fixed kernel-stack address assigned
/// once and for all (spec.md §5 "Kernel stacks are permanently bound to
/// process-table slots").
///
/// # Safety
/// Must be called exactly once, before any other `proc` entry point, with
/// no concurrent access to `PROC_TABLE`.
pub unsafe fn init() {
    for proc in PROC_TABLE.iter() {
        // Safety: boot-time, single-threaded, slot not yet reachable from
        // any list.
        unsafe { proc.data_mut() }.kstack = kstack(proc.id);
        UNUSED.add(&PROC_TABLE, proc.id);
    }
    log::debug!("proc table initialized: {} slots", NPROC);
}

/// spec.md §4.3 `allocproc`: pops a slot off `UNUSED`, assigns a fresh
/// PID, and asks the VM collaborator for a trapframe page and user page
/// table. Returns the slot with `p.lock` held, as the teacher's own
/// `ProcTable::alloc` does.
fn allocproc() -> Result<(&'static Proc, SpinLockGuard<'static, ProcInner>), KernelError> {
    let idx = UNUSED.remove_head(&PROC_TABLE).ok_or(KernelError::OutOfProcs)?;
    let proc = PROC_TABLE.get(idx);
    let mut inner = proc.inner.lock();

    inner.pid = Pid::alloc();
    inner.state = ProcState::Used;
    inner.cpu_num = -1;

    // Safety: state == Used, on no list; exclusive to us until a caller
    // publishes this slot as Runnable.
    let data = unsafe { proc.data_mut() };

    let trapframe = match Box::try_new(TrapFrame::default()) {
        Ok(tf) => tf,
        Err(_) => {
            log::warn!("allocproc: out of memory for trapframe");
            freeproc(proc, inner);
            return Err(KernelError::AllocError);
        }
    };
    data.trapframe = Some(trapframe);

    match UserMemory::uvmcreate() {
        Ok(pt) => data.pagetable = Some(pt),
        Err(err) => {
            log::warn!("allocproc: failed to create user page table");
            freeproc(proc, inner);
            return Err(err);
        }
    }

    data.context = Context::new();
    #[cfg(not(test))]
    {
        data.context.ra = fork_ret as usize;
        data.context.sp = data.kstack + PGSIZE;
    }

    log::debug!("allocproc: slot {} pid {}", idx, *inner.pid);
    Ok((proc, inner))
}

/// spec.md §4.3 `freeproc`: releases VM resources, zeroes the
/// user-visible fields, and returns the slot to `UNUSED`. Called both for
/// a slot that never made it past `allocproc` (not on any list yet — the
/// `ZOMBIE.remove` below is then simply a no-op) and for a reaped zombie.
fn freeproc(proc: &Proc, mut inner: SpinLockGuard<'_, ProcInner>) {
    // Safety: called with p.lock held, and the caller is either still
    // setting this slot up (allocproc failure path) or the slot's only
    // remaining list membership is ZOMBIE, about to be removed below.
    let data = unsafe { proc.data_mut() };

    data.trapframe = None;
    if let Some(mut pt) = data.pagetable.take() {
        pt.uvmfree(data.sz);
    }
    data.sz = 0;
    inner.pid = Pid::default();
    data.name.clear();
    inner.channel = None;
    inner.killed = false;
    inner.xstate = 0;
    inner.cpu_num = -1;

    ZOMBIE.remove(&PROC_TABLE, proc.id);
    inner.state = ProcState::Unused;
    UNUSED.add(&PROC_TABLE, proc.id);
    log::debug!("freeproc: slot {} returned to unused", proc.id);
}

/// spec.md §8 scenario 1: sets up the first user process, runnable on
/// CPU 0.
///
/// # Safety
/// Must be called exactly once, after `init`, before any CPU's
/// `scheduler` loop starts.
pub unsafe fn userinit() {
    let (proc, mut inner) = allocproc().expect("userinit: out of process slots");
    INIT_PROC.initialize(|| proc.id);

    // Safety: not yet runnable, exclusive to us.
    let data = unsafe { proc.data_mut() };
    data.cwd = Some(fs::namei("/"));
    data.name = String::from("init");
    if let Some(pt) = data.pagetable.as_mut() {
        pt.uvminit(&[]);
    }
    data.sz = PGSIZE;

    make_runnable(proc, &mut inner, 0, true);
    log::debug!("userinit: pid {} runnable on cpu 0", *inner.pid);
}

/// `growproc`: grows or shrinks the current process's user memory by `n`
/// bytes, returning the new size.
pub fn growproc(n: isize) -> Result<usize, KernelError> {
    let proc = current_proc();
    // Safety: current process, no concurrent access to its own memory.
    let data = unsafe { proc.data_mut() };
    let mut size = data.sz;

    if n > 0 {
        size = data.pagetable_mut().uvmalloc(size, size + n as usize)?;
    } else if n < 0 {
        let shrink = (-n) as usize;
        if shrink > size {
            return Err(KernelError::InvalidPageError);
        }
        size = data.pagetable_mut().uvmdealloc(size, size - shrink);
    }

    data.sz = size;
    Ok(size)
}

/// spec.md §4.5 `fork`: allocates a child slot, copies the parent's user
/// memory/trapframe/open files/cwd, and finally admits the child onto a
/// CPU's runnable list. The child's trapframe `a0` is forced to 0 so it
/// observes its own fork call returning 0 (P7); the single
/// `make_runnable` call below is this port's fix for the "double-bump"
/// ambiguity spec.md §9 flags (the source increments the admission
/// counter twice).
pub fn fork() -> Result<Pid, KernelError> {
    let proc = current_proc();
    // Safety: current process.
    let data = unsafe { proc.data_mut() };

    let (child, mut child_inner) = allocproc()?;
    // Safety: child not yet runnable, exclusive to us.
    let child_data = unsafe { child.data_mut() };

    if let (Some(src), Some(dst)) = (data.pagetable.as_ref(), child_data.pagetable.as_mut()) {
        if let Err(err) = src.uvmcopy(dst, data.sz) {
            freeproc(child, child_inner);
            return Err(err);
        }
    }
    child_data.sz = data.sz;

    if let Some(tf) = data.trapframe.as_ref() {
        let child_tf = child_data.trapframe_mut();
        child_tf.clone_from(tf);
        child_tf.a0 = 0;
    }

    for (parent_file, child_file) in data.ofile.iter().zip(child_data.ofile.iter_mut()) {
        if let Some(f) = parent_file {
            *child_file = Some(f.dup());
        }
    }
    if let Some(cwd) = data.cwd.as_ref() {
        child_data.cwd = Some(cwd.dup());
    }
    child_data.name = data.name.clone();

    let pid = child_inner.pid;
    drop(child_inner);

    {
        let mut parents = WAIT_LOCK.lock();
        parents[child.id] = Some(proc.id);
    }

    let parent_cpu = proc.inner.lock().cpu_num;
    let target = if BALANCE {
        least_loaded_cpu()
    } else {
        parent_cpu.max(0) as usize
    };

    let mut child_inner = child.inner.lock();
    make_runnable(child, &mut child_inner, target, true);
    log::debug!("fork: pid {} -> child pid {}", *proc.inner.lock().pid, pid);

    Ok(pid)
}

/// Reassigns every child of `exiting` to `init` and wakes it, in case it
/// is already blocked in `wait` (spec.md §4.5 `reparent`). Caller holds
/// `wait_lock`.
fn reparent(exiting: usize, parents: &mut ParentTable) {
    let init_id = *INIT_PROC.get().expect("init not set");
    for slot in parents.iter_mut() {
        if *slot == Some(exiting) {
            *slot = Some(init_id);
        }
    }
    wakeup(Channel::of_proc(init_id));
}

/// spec.md §4.5 `exit`: never returns. `init` may not exit (a fatal
/// condition per spec.md §7).
pub fn exit(status: isize) -> ! {
    let proc = current_proc();
    assert!(!is_init_proc(proc), "init exiting");

    // Safety: current process.
    let data = unsafe { proc.data_mut() };
    for file in data.ofile.iter_mut() {
        if let Some(f) = file.take() {
            f.close();
        }
    }
    {
        let _op = fs::Operation::begin();
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }
    }

    let mut parents = WAIT_LOCK.lock();
    reparent(proc.id, &mut parents);
    let parent_id = parents[proc.id].expect("exit: no parent");
    wakeup(Channel::of_proc(parent_id));

    let mut inner = proc.inner.lock();
    inner.xstate = status;
    let cpu = inner.cpu_num;
    inner.state = ProcState::Zombie;
    ZOMBIE.add(&PROC_TABLE, proc.id);
    if cpu >= 0 {
        CPU_TABLE.get(cpu as usize).proc_list_size.decr();
    }
    log::debug!("exit: pid {} status {}", *inner.pid, status);

    drop(parents);

    sched(inner, &mut data.context);
    unreachable!("zombie process resumed");
}

/// spec.md §4.5 `wait`: reaps the first zombie child found, or blocks on
/// the caller's own channel until one appears.
pub fn wait(out_addr: Option<usize>) -> Option<Pid> {
    let current = current_proc();
    let mut parents = WAIT_LOCK.lock();

    loop {
        let mut have_kids = false;

        for child in PROC_TABLE.iter() {
            if parents[child.id] != Some(current.id) {
                continue;
            }
            have_kids = true;

            let inner = child.inner.lock();
            if inner.state == ProcState::Zombie {
                let pid = inner.pid;
                if let Some(addr) = out_addr {
                    // Safety: current process's own memory.
                    let data = unsafe { current.data_mut() };
                    if let Some(pt) = data.pagetable.as_mut() {
                        let _ = pt.copyout(addr, &inner.xstate.to_le_bytes());
                    }
                }
                parents[child.id] = None;
                freeproc(child, inner);
                return Some(pid);
            }
        }

        if !have_kids || current.inner.lock().killed {
            return None;
        }

        parents = sleep(Channel::of_proc(current.id), parents);
    }
}

/// spec.md §4.7 `sleep`: atomically releases `cond_lock` and blocks on
/// `channel`, reacquiring `cond_lock` on wakeup. Acquiring `p.lock` before
/// releasing `cond_lock` is what rules out a missed wakeup: any
/// concurrent `wakeup`/`kill` must also acquire `p.lock` and so observes
/// either the not-yet-asleep state or the fully committed `Sleeping` one.
pub fn sleep<'a, T>(channel: Channel, cond_lock: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let proc = current_proc();
    let mut inner = proc.inner.lock();

    let cond = cond_lock.unlock();

    inner.channel = Some(channel);
    let cpu = inner.cpu_num;
    inner.state = ProcState::Sleeping;
    SLEEPING.add(&PROC_TABLE, proc.id);
    if cpu >= 0 {
        CPU_TABLE.get(cpu as usize).proc_list_size.decr();
    }

    // Safety: current process.
    let data = unsafe { proc.data_mut() };
    inner = sched(inner, &mut data.context);

    inner.channel = None;
    drop(inner);

    cond.lock()
}

/// spec.md §4.7 `wakeup`: makes every process sleeping on `channel`
/// runnable. Must be called with no `p.lock` held by the caller.
pub fn wakeup(channel: Channel) {
    let me = myproc().map(|p| p.id);

    for proc in PROC_TABLE.iter() {
        if me == Some(proc.id) {
            continue;
        }

        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
            SLEEPING.remove(&PROC_TABLE, proc.id);
            let target = if BALANCE {
                least_loaded_cpu()
            } else {
                inner.cpu_num.max(0) as usize
            };
            make_runnable(proc, &mut inner, target, true);
        }
    }
}

/// spec.md §4.7 `kill`: sets the victim's sticky `killed` flag and, if it
/// is sleeping, makes it runnable on its current CPU so it can observe
/// the flag at its next trap-to-user return (spec.md §5).
pub fn kill(pid: Pid) -> Result<(), KernelError> {
    for proc in PROC_TABLE.iter() {
        let mut inner = proc.inner.lock();
        if inner.pid == pid {
            inner.killed = true;
            if inner.state == ProcState::Sleeping {
                SLEEPING.remove(&PROC_TABLE, proc.id);
                let target = inner.cpu_num.max(0) as usize;
                make_runnable(proc, &mut inner, target, true);
            }
            log::debug!("kill: pid {}", *pid);
            return Ok(());
        }
    }
    Err(KernelError::NoSuchPid)
}

/// spec.md §4.6 `steal_process`: scans the other CPUs in index order for a
/// runnable process and, if found, rebinds it to the stealer. Spec.md §9
/// notes the reference source rewrites `cpu_num` "under the stolen
/// process's `link_lock`"; this port instead protects `cpu_num` with
/// `p.lock` uniformly (the same lock every other `cpu_num` mutation in
/// this module uses), since `cpu_num` lives in `ProcInner`, not behind the
/// link lock, in this arena-by-index layout.
fn steal_process(self_id: usize) -> Option<usize> {
    for victim in 0..NCPU {
        if victim == self_id {
            continue;
        }
        if let Some(idx) = CPU_TABLE.get(victim).runnable.remove_head(&PROC_TABLE) {
            let proc = PROC_TABLE.get(idx);
            {
                let mut inner = proc.inner.lock();
                inner.cpu_num = self_id as isize;
            }
            CPU_TABLE.get(victim).proc_list_size.decr();
            CPU_TABLE.get(self_id).admitted_process_count.incr();
            log::trace!("steal_process: cpu {} took pid slot {} from cpu {}", self_id, idx, victim);
            return Some(idx);
        }
    }
    None
}

/// spec.md §4.6: one scheduling loop per CPU, never returns.
///
/// # Safety
/// Must be called exactly once per CPU, by the kernel thread permanently
/// bound to that hart.
pub unsafe fn scheduler() -> ! {
    let cpu_id = current_cpu_id();

    loop {
        // Liveness: re-enable interrupts so devices can still cause a
        // reschedule while this CPU is idling, then disable them again
        // before touching `cpu.proc` (spec.md §4.6 step 1).
        hal::enable();
        hal::disable();

        let mut idx = CPU_TABLE.get(cpu_id).runnable.remove_head(&PROC_TABLE);
        if idx.is_none() && STEAL {
            idx = steal_process(cpu_id);
        }
        let Some(idx) = idx else {
            continue;
        };

        let proc = PROC_TABLE.get(idx);
        let mut inner = proc.inner.lock();
        assert_eq!(
            inner.state,
            ProcState::Runnable,
            "scheduler: dispatching a non-runnable process"
        );
        inner.state = ProcState::Running;

        // Safety: only this hart's thread touches its own Cpu record.
        let cpu = unsafe { CPU_TABLE.get_mut(cpu_id) };
        cpu.proc = Some(idx);

        // Safety: proc is Running, and this hart is the only one dispatching it.
        let data = unsafe { proc.data_mut() };
        swtch(&mut cpu.context, &data.context);

        // Safety: same as above.
        let cpu = unsafe { CPU_TABLE.get_mut(cpu_id) };
        cpu.proc = None;
        drop(inner);
    }
}

/// spec.md §4.6 `sched`: hands control back to this CPU's scheduler loop.
/// Asserts the preconditions spec.md §7 lists as fatal if violated:
/// exactly one spinlock held (the caller's `p.lock`), state not
/// `Running`, interrupts disabled.
pub fn sched(inner: SpinLockGuard<'_, ProcInner>, ctx: &mut Context) -> SpinLockGuard<'_, ProcInner> {
    assert_eq!(spinlock::depth(), 1, "sched: must hold exactly one lock");
    assert_ne!(inner.state, ProcState::Running, "sched: process is still running");
    assert!(!hal::get(), "sched: interruptible");

    // Safety: this hart's own scheduler context.
    let cpu = unsafe { CPU_TABLE.get_mut(current_cpu_id()) };
    swtch(ctx, &cpu.context);

    // Under test, "returning from swtch" can mean a *different* simulated
    // hart resumed us than the one we left on (the scheduler that dispatches
    // us next need not be the one we yielded to, e.g. after `steal_process`
    // or a balanced wakeup). A real hart never changes identity mid-instruction
    // stream, so this has no counterpart in a deployed build; it only exists
    // to keep the `std::thread`-per-process simulation's notion of "current
    // hart" (hal.rs's thread-local) truthful across a migration. `cpu_num` is
    // always updated by `make_runnable`/`steal_process` before the dispatching
    // scheduler's `swtch` call, so it is already the right answer once we
    // wake back up here.
    #[cfg(test)]
    hal::bind_this_thread_to_cpu(inner.cpu_num.max(0) as usize);

    inner
}

/// spec.md §4.6 `yield`: gives up the CPU for one scheduling round.
pub fn yield_now() {
    let proc = current_proc();
    let mut inner = proc.inner.lock();
    let target = inner.cpu_num.max(0) as usize;
    make_runnable(proc, &mut inner, target, false);

    // Safety: current process.
    let data = unsafe { proc.data_mut() };
    sched(inner, &mut data.context);
}

/// Entry point for a freshly forked/init child's first dispatch. Resumes
/// at the fork-return trampoline address `allocproc` seeded into the
/// child's context, still holding the scheduler-handed `p.lock`, and
/// releases it before returning to user space.
///
/// # Safety
/// Never called directly; used only as a context's `ra` by `allocproc`.
#[cfg(not(test))]
pub unsafe extern "C" fn fork_ret() {
    // Safety: the scheduler handed us this process's lock, still held.
    unsafe { current_proc().inner.force_unlock() };
    crate::trap::usertrapret();
}

/// spec.md §4.8 affinity API. `set_cpu` only rewrites `cpu_num` and defers
/// every list/counter update to the `yield_now()` it triggers — spec.md
/// §9 flags the reference source's direct `proc_list_size`
/// increment/decrement here as wrong (the caller isn't on any CPU's list
/// while `Running`, so there is nothing to decrement, and the increment
/// would double-count the one `yield_now`'s `RUNNING→RUNNABLE` transition
/// already performs); this port removes both, per that REDESIGN FLAG.
pub fn set_cpu(n: isize) -> Result<(), KernelError> {
    if n < 0 || n as usize >= NCPU {
        return Err(KernelError::InvalidCpu);
    }
    current_proc().inner.lock().cpu_num = n;
    yield_now();
    Ok(())
}

pub fn get_cpu() -> isize {
    current_proc().inner.lock().cpu_num
}

pub fn cpu_process_count(n: usize) -> Result<usize, KernelError> {
    if n >= NCPU {
        return Err(KernelError::InvalidCpu);
    }
    Ok(CPU_TABLE.get(n).admitted_process_count.get())
}

/// Copies from user space into `dst`, choosing between a real user
/// pagetable copy and... there is no "kernel-direct" source in this core's
/// narrowed model (spec.md §1 excludes real kernel/user address spaces),
/// so `user_src = false` is always a contract failure.
pub fn either_copyin(user_src: bool, dst: &mut [u8], src: usize) -> Result<(), KernelError> {
    if !user_src {
        return Err(KernelError::CopyFault);
    }
    // Safety: current process's own memory.
    let data = unsafe { current_proc().data_mut() };
    data.pagetable().copyin(src, dst)
}

pub fn either_copyout(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), KernelError> {
    if !user_dst {
        return Err(KernelError::CopyFault);
    }
    // Safety: current process's own memory.
    let data = unsafe { current_proc().data_mut() };
    data.pagetable_mut().copyout(dst, src)
}

/// spec.md §6 Debug surface: one line per non-`Unused` process, without
/// locking (a stuck lock must never wedge a debug dump).
pub fn procdump() {
    for proc in PROC_TABLE.iter() {
        // Safety: debug-only; the spec explicitly calls for no locking here.
        let inner = unsafe { proc.inner.get_mut_unchecked() };
        if inner.state == ProcState::Unused {
            continue;
        }
        let data = unsafe { proc.data_mut() };
        log::info!("{} {} {}", *inner.pid, inner.state.abbrev(), data.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_cpu<R>(id: usize, f: impl FnOnce() -> R) -> R {
        hal::bind_this_thread_to_cpu(id);
        f()
    }

    #[test]
    fn allocpid_is_strictly_increasing() {
        let a = Pid::alloc();
        let b = Pid::alloc();
        assert!(*b > *a);
    }

    #[test]
    fn cpu_new_has_no_process_and_empty_runnable_list() {
        with_cpu(0, || {
            let cpu = Cpu::new();
            assert!(cpu.proc.is_none());
            assert_eq!(cpu.runnable.debug_len(&PROC_TABLE), 0);
        });
    }

    #[test]
    fn proc_inner_default_state_is_unused() {
        let inner = ProcInner::new();
        assert_eq!(inner.state, ProcState::Unused);
        assert_eq!(inner.cpu_num, -1);
    }

    #[test]
    fn channel_of_proc_does_not_collide_with_small_addresses() {
        assert_ne!(Channel::of_proc(0), Channel::new(0));
        assert_ne!(Channel::of_proc(1), Channel::new(1));
    }

    #[test]
    fn state_abbreviations_match_debug_surface_contract() {
        assert_eq!(ProcState::Unused.abbrev(), "unused");
        assert_eq!(ProcState::Sleeping.abbrev(), "sleep");
        assert_eq!(ProcState::Runnable.abbrev(), "runble");
        assert_eq!(ProcState::Running.abbrev(), "run");
        assert_eq!(ProcState::Zombie.abbrev(), "zombie");
    }
}
