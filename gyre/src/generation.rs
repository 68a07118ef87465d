/*
   gyre, a concurrent cycle-collecting smart pointer library for Rust.
   Copyright (C) 2024 The gyre contributors.

   This program is free software: you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation, either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Generations: the unit of cycle collection.
//!
//! A generation owns a set of control blocks that are marked and swept
//! together.
//! Edges *within* a generation hold no strong reference, so a cycle confined
//! to one generation is visible to the collector as a set of members whose
//! entire strong count is supplied by internal edges.
//! Edges *between* generations each hold one strong reference, and are only
//! permitted from lower sequence numbers to higher ones; an assignment that
//! would break that order either slides the owner's sequence downward or
//! merges the two generations into one.
//!
//! The collector is a partitioned tri-colour mark–sweep over the member
//! list, run concurrently with mutators: only weak-promotion is excluded
//! (and only during the closure phase), everything else proceeds under the
//! hazard protocol and single-word colour transitions.

use std::{
    ptr::NonNull,
    sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use once_cell::sync::Lazy;
use parking_lot::{
    lock_api::RawRwLock as _,
    Mutex, RawRwLock, RwLock,
};
use tracing::{debug, trace};

use crate::{
    control::{Colour, ControlBlock},
    hazard::{Counted, RefPtr},
};

/// The low sequence bit: set while the generation's sequence may still slide
/// downward.
const MOVEABLE: u64 = 1;

/// Source of fresh sequence numbers.
///
/// Starts at 3 and advances in steps of 2, so every created sequence is odd
/// (moveable) and the values 0, 1 and 2 are never handed out: 0 belongs to
/// the unowned singleton and slid sequences stop at 3.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(3);

/// The collection unit: a set of control blocks marked and swept together.
pub(crate) struct Generation {
    /// The ordering key for inter-generation edges (low bit: moveable).
    seq: AtomicU64,
    /// Counted references to the generation: one per member control block
    /// (through its generation cell) plus transient hazard-held ones.
    refs: AtomicUsize,
    /// The member list; the mutex doubles as the structure lock, held by
    /// the collector across its marking phases and by merges while splicing.
    controls: Mutex<Vec<NonNull<ControlBlock>>>,
    /// Excludes merges of this generation (shared: an edge assignment is in
    /// flight; exclusive: this generation is being merged away).
    merge_order: RawRwLock,
    /// Excludes weak red-promotion while the collector closes over its
    /// wavefront and condemns the remainder.
    promotions: RawRwLock,
    /// Set when a collection has been requested and not yet started.
    gc_flag: AtomicBool,
}

unsafe impl Send for Generation {}
unsafe impl Sync for Generation {}

/// Holder for the process-wide unowned generation.
struct Unowned(NonNull<Generation>);

unsafe impl Send for Unowned {}
unsafe impl Sync for Unowned {}

/// The singleton generation for allocations that never participate in
/// cycles, permanently at sequence 0.
///
/// Every other sequence number is at least 3, so the singleton orders below
/// all of them and is never the target of a slide or a merge.
static UNOWNED: Lazy<Unowned> = Lazy::new(|| {
    let gen = Box::new(Generation {
        seq: AtomicU64::new(0),
        refs: AtomicUsize::new(1),
        controls: Mutex::new(Vec::new()),
        merge_order: RawRwLock::INIT,
        promotions: RawRwLock::INIT,
        gc_flag: AtomicBool::new(false),
    });
    Unowned(NonNull::from(Box::leak(gen)))
});

impl Generation {
    /// Create a fresh generation with a unique, moveable sequence number.
    pub fn fresh() -> RefPtr<Generation> {
        let gen = Box::new(Generation {
            seq: AtomicU64::new(NEXT_SEQ.fetch_add(2, Ordering::Relaxed)),
            refs: AtomicUsize::new(1),
            controls: Mutex::new(Vec::new()),
            merge_order: RawRwLock::INIT,
            promotions: RawRwLock::INIT,
            gc_flag: AtomicBool::new(false),
        });
        RefPtr::from_raw(NonNull::from(Box::leak(gen)))
    }

    /// The unowned singleton (sequence 0).
    pub fn unowned() -> RefPtr<Generation> {
        unsafe { RefPtr::acquire(UNOWNED.0) }
    }

    /// The current sequence number, moveable bit included.
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Clear the moveable bit and return the pinned sequence.
    ///
    /// An edge into this generation is about to rely on its order; once
    /// pinned, the sequence can never slide downward and invalidate that
    /// certificate.
    pub fn pin_sequence(&self) -> u64 {
        self.seq.fetch_and(!MOVEABLE, Ordering::SeqCst) & !MOVEABLE
    }

    /// Try to slide this generation's sequence below `dseq` (a pinned target
    /// sequence), avoiding a merge.
    ///
    /// Returns true if the order `self < dseq` now holds.
    /// Only moveable generations slide, the result stays odd (still
    /// moveable), and the floor of 3 keeps slid sequences clear of the
    /// unowned singleton.
    pub fn try_slide(&self, dseq: u64) -> bool {
        if dseq < 4 {
            return false;
        }
        let mut seq = self.seq.load(Ordering::SeqCst);
        loop {
            if seq < dseq {
                return true;
            }
            if seq & MOVEABLE == 0 {
                return false;
            }
            match self.seq.compare_exchange_weak(
                seq,
                dseq - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => seq = actual,
            }
        }
    }

    /// Add a control block to the member list.
    pub fn adopt(&self, ctrl: NonNull<ControlBlock>) {
        self.controls.lock().push(ctrl);
    }

    /// Remove a control block from the member list, if present.
    ///
    /// Used when an allocation is torn down before its value ever existed.
    pub fn expel(&self, ctrl: NonNull<ControlBlock>) {
        let mut controls = self.controls.lock();
        if let Some(at) = controls.iter().position(|&c| c == ctrl) {
            controls.swap_remove(at);
        }
    }

    /// The number of member control blocks.
    pub fn len(&self) -> usize {
        self.controls.lock().len()
    }

    /// Take the weak-promotion lock, shared side.
    pub fn lock_promotions_shared(&self) {
        self.promotions.lock_shared();
    }

    /// Release the shared weak-promotion lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the shared side.
    pub unsafe fn unlock_promotions_shared(&self) {
        self.promotions.unlock_shared();
    }

    /// Request a collection of this generation.
    ///
    /// The first requester after the flag was clear becomes responsible for
    /// running the collection; it is handed to the delay hook if one is
    /// installed and run inline otherwise.
    pub fn request(this: &RefPtr<Generation>) {
        if this.gc_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(seq = this.sequence(), "collection requested");
        let op = GcOperation {
            gen: this.clone(),
            ran: AtomicBool::new(false),
        };
        let hook = DELAY_GC.read();
        match &*hook {
            Some(f) => f(op),
            None => {
                drop(hook);
                op.run();
            }
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        debug_assert!(
            self.controls.get_mut().is_empty(),
            "generation dropped with live members"
        );
    }
}

unsafe impl Counted for Generation {
    unsafe fn incr(ptr: NonNull<Self>) {
        ptr.as_ref().refs.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn decr(ptr: NonNull<Self>) {
        if ptr.as_ref().refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            trace!(seq = ptr.as_ref().sequence(), "generation retired");
            drop(Box::from_raw(ptr.as_ptr()));
        }
    }
}

// ---------------------------------------------------------------------------
// Edge ordering
// ---------------------------------------------------------------------------

/// A shared hold on a generation's merge lock, pinning the owner's
/// generation membership for the duration of an edge assignment.
pub(crate) struct OrderGuard {
    /// The generation of the edge's owner, merge-locked shared.
    gen: RefPtr<Generation>,
}

impl OrderGuard {
    /// The owner's generation.
    pub fn generation(&self) -> &RefPtr<Generation> {
        &self.gen
    }

    /// The owner's generation as a raw address, for membership comparisons.
    pub fn generation_ptr(&self) -> *mut Generation {
        self.gen.as_ptr().as_ptr()
    }
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        unsafe { self.gen.merge_order.unlock_shared() };
    }
}

impl Generation {
    /// Establish the order invariant for an edge `owner → target` and pin
    /// the owner's generation against merges.
    ///
    /// On return the owner's generation is merge-locked shared and either
    /// the target is null, or it lives in the same generation, or it lives
    /// in a generation with a strictly higher pinned sequence.
    /// While the guard is held, the target's generation can only move to
    /// higher sequences (merges move members upward and its own sequence is
    /// pinned), so the certificate cannot rot.
    pub fn fix_ordering(owner: &ControlBlock, target: Option<&ControlBlock>) -> OrderGuard {
        loop {
            let src = owner
                .generation
                .get()
                .expect("control block without a generation");
            src.merge_order.lock_shared();
            // The owner may have been merged away between the read and the
            // lock; re-read under the lock.
            if owner.generation.load_raw() != src.as_ptr().as_ptr() {
                unsafe { src.merge_order.unlock_shared() };
                continue;
            }
            let guard = OrderGuard { gen: src };

            let Some(target) = target else {
                return guard;
            };
            if target.generation.load_raw() == guard.generation_ptr() {
                return guard;
            }
            let Some(dst) = target.generation.get() else {
                return guard;
            };
            if dst.as_ptr() == guard.gen.as_ptr() {
                return guard;
            }

            let dseq = dst.pin_sequence();
            if guard.gen.sequence() < dseq {
                return guard;
            }
            // Order violated. A slide fixes it without giving up the lock;
            // merges need it released.
            if guard.gen.try_slide(dseq) {
                return guard;
            }
            drop(guard);
            let src = owner
                .generation
                .get()
                .expect("control block without a generation");
            Generation::merge_towards(&src, &dst);
        }
    }

    /// Attempt to merge two generations into one, whichever direction their
    /// pinned `(sequence, address)` order dictates.
    ///
    /// A single attempt: it may complete, or find nothing to do, or abandon
    /// because the destination was itself merged away mid-flight.
    /// Callers always re-derive the generations involved from the edge they
    /// are fixing and retry from fresh state, so an abandoned attempt never
    /// spins against a stale destination — the merge that drained it already
    /// made global progress.
    pub fn merge_towards(a: &RefPtr<Generation>, b: &RefPtr<Generation>) {
        if a.as_ptr() == b.as_ptr() {
            return;
        }
        let (sa, sb) = (a.pin_sequence(), b.pin_sequence());
        let key_a = (sa, a.as_ptr().as_ptr() as usize);
        let key_b = (sb, b.as_ptr().as_ptr() as usize);
        let (src, dst) = if key_a < key_b { (a, b) } else { (b, a) };
        Generation::merge(src, dst);
    }

    /// Merge `src` into `dst`.
    ///
    /// Precondition: both sequences pinned and `(src.seq, src) < (dst.seq,
    /// dst)`.
    /// Returns false if the attempt was abandoned because `dst` was emptied
    /// by a recursive merge; the caller re-derives from the edge it is
    /// fixing, which by then lives somewhere fresher.
    fn merge(src: &RefPtr<Generation>, dst: &RefPtr<Generation>) -> bool {
        src.merge_order.lock_exclusive();
        let outcome = Self::merge_locked(src, dst);
        unsafe { src.merge_order.unlock_exclusive() };
        match outcome {
            None => false,
            Some(want_gc) => {
                // A request that was pending against the (now empty) source
                // is trivially satisfied; its promise carries over to `dst`,
                // as do references stage 1 dropped to zero.
                if src.gc_flag.swap(false, Ordering::SeqCst) || want_gc {
                    Generation::request(dst);
                }
                true
            }
        }
    }

    /// The body of [`Generation::merge`], run with `src`'s merge lock held
    /// exclusively.
    ///
    /// Returns `None` if the merge was abandoned, and otherwise whether
    /// stage 1 dropped some target to zero references (the caller requests a
    /// collection of `dst` once the locks are gone).
    fn merge_locked(src: &RefPtr<Generation>, dst: &RefPtr<Generation>) -> Option<bool> {
        let mut src_controls = src.controls.lock();

        // Closure: an edge out of `src` whose target sits in a third
        // generation that would order at or below `dst` must have that
        // generation folded into `dst` first, or the move of `src`'s members
        // would break the order invariant for it.
        loop {
            let mut violators: Vec<RefPtr<Generation>> = Vec::new();
            for &ctrl in src_controls.iter() {
                let ctrl = unsafe { ctrl.as_ref() };
                ctrl.with_edges(|edges| {
                    for &vertex in edges.iter() {
                        let vertex = unsafe { vertex.as_ref() };
                        // The merge lock freezes this edge; a raw read of
                        // its target is fine.
                        let Some(target) = (unsafe { vertex.target() }) else {
                            continue;
                        };
                        let g_raw = target.generation.load_raw();
                        if g_raw == src.as_ptr().as_ptr() || g_raw == dst.as_ptr().as_ptr() {
                            continue;
                        }
                        let Some(third) = target.generation.get() else {
                            continue;
                        };
                        if third.as_ptr() == src.as_ptr() || third.as_ptr() == dst.as_ptr() {
                            continue;
                        }
                        if dst.sequence() >= third.pin_sequence() {
                            violators.push(third);
                        }
                    }
                });
            }
            if violators.is_empty() {
                break;
            }
            for third in violators {
                Generation::merge_towards(&third, dst);
            }
            // A recursive merge may have dissolved `dst` itself; splicing
            // into an abandoned generation would strand our members.
            if dst.controls.lock().is_empty() {
                return None;
            }
        }

        let mut dst_controls = dst.controls.lock();

        // Stage 1: edges from src into dst are about to become internal and
        // must stop counting.
        let mut dropped_to_zero = false;
        for &ctrl in src_controls.iter() {
            let ctrl = unsafe { ctrl.as_ref() };
            ctrl.with_edges(|edges| {
                for &vertex in edges.iter() {
                    let vertex = unsafe { vertex.as_ref() };
                    let Some(target) = (unsafe { vertex.target() }) else {
                        continue;
                    };
                    if target.generation.load_raw() == dst.as_ptr().as_ptr()
                        && target.release(true) == 0
                    {
                        dropped_to_zero = true;
                    }
                }
            });
        }

        // Stage 2: repoint every member's generation cell. Kept strictly
        // after stage 1 so no edge is classified against a half-moved list.
        for &ctrl in src_controls.iter() {
            let ctrl = unsafe { ctrl.as_ref() };
            ctrl.generation.store(Some(dst.clone()));
        }

        let moved = src_controls.len();
        dst_controls.extend(src_controls.drain(..));

        trace!(
            src_seq = src.sequence(),
            dst_seq = dst.sequence(),
            moved,
            "generations merged"
        );

        drop(dst_controls);
        drop(src_controls);

        Some(dropped_to_zero)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Swap two members of the list, keeping their scan indices current.
fn swap_members(list: &mut [NonNull<ControlBlock>], a: usize, b: usize) {
    list.swap(a, b);
    unsafe {
        list[a].as_ref().scan_index.store(a, Ordering::Relaxed);
        list[b].as_ref().scan_index.store(b, Ordering::Relaxed);
    }
}

impl Generation {
    /// Run one collection over this generation.
    pub fn collect(this: &RefPtr<Generation>) {
        // Clear the request flag first: anything released from here on must
        // be able to request a fresh run.
        this.gc_flag.store(false, Ordering::SeqCst);

        let mut controls = this.controls.lock();
        let n = controls.len();
        if n == 0 {
            return;
        }
        trace!(seq = this.sequence(), members = n, "collection started");

        for (i, ctrl) in controls.iter().enumerate() {
            unsafe { ctrl.as_ref() }.scan_index.store(i, Ordering::Relaxed);
        }

        // Phase 1, initial mark: members with references are grey roots and
        // go to the front; the rest are tentatively unreachable.
        let mut wave_end = 0;
        for i in 0..n {
            if unsafe { controls[i].as_ref() }.mark_from_white() == Colour::Grey {
                swap_members(&mut controls, i, wave_end);
                wave_end += 1;
            }
        }
        if wave_end == n {
            // Nothing is even a candidate; undo the grey marks.
            for ctrl in controls.iter() {
                unsafe { ctrl.as_ref() }.promote_grey_to_white();
            }
            return;
        }

        // Phase 1, sweep.
        let mut wave_begin = 0;
        Self::sweep(this, &mut controls, &mut wave_begin, &mut wave_end);
        if wave_end == n {
            return;
        }

        // Phase 2: with weak promotion excluded, pick up members that a
        // concurrent strong acquisition resurrected during phase 1 and close
        // over them. Whatever is still red afterwards is unreachable.
        this.promotions.lock_exclusive();
        for i in wave_end..n {
            if unsafe { controls[i].as_ref() }.colour() == Colour::Grey {
                swap_members(&mut controls, i, wave_end);
                wave_end += 1;
            }
        }
        Self::sweep(this, &mut controls, &mut wave_begin, &mut wave_end);
        if wave_end == n {
            unsafe { this.promotions.unlock_exclusive() };
            return;
        }

        // Phase 3: condemn the red tail, transferring each member out of the
        // list into a local queue.
        // The member list's control reference moves with each entry; the
        // destruction loop below releases it.
        let mut unreachable: Vec<NonNull<ControlBlock>> = Vec::new();
        for i in (wave_end..n).rev() {
            let ctrl = controls[i];
            if unsafe { ctrl.as_ref() }.blacken() {
                // `i` is the current last index, so this is a plain pop.
                controls.swap_remove(i);
                unreachable.push(ctrl);
            } else {
                unsafe { ctrl.as_ref() }.promote_grey_to_white();
            }
        }
        unsafe { this.promotions.unlock_exclusive() };
        drop(controls);

        debug!(
            seq = this.sequence(),
            collected = unreachable.len(),
            "collection finished"
        );

        // Destruction, unlocked: clearing a cross-generation edge releases a
        // reference and may start a collection elsewhere, inline.
        let self_raw = this.as_ptr().as_ptr();
        for &ctrl in &unreachable {
            let block = unsafe { ctrl.as_ref() };
            block.with_edges(|edges| {
                for &vertex in edges.iter() {
                    let vertex = unsafe { vertex.as_ref() };
                    if let Some(old) = vertex.clear() {
                        if old.generation.load_raw() != self_raw {
                            old.release(false);
                        }
                    }
                }
            });
            unsafe {
                ControlBlock::drop_value(ctrl);
                ControlBlock::decr(ctrl);
            }
        }
    }

    /// Process the wavefront `[wave_begin, wave_end)`: whiten each grey
    /// member and pull its same-generation red targets into the wavefront.
    fn sweep(
        this: &RefPtr<Generation>,
        controls: &mut Vec<NonNull<ControlBlock>>,
        wave_begin: &mut usize,
        wave_end: &mut usize,
    ) {
        let self_raw = this.as_ptr().as_ptr();
        while *wave_begin < *wave_end {
            let member = controls[*wave_begin];
            let member = unsafe { member.as_ref() };
            member.promote_grey_to_white();
            member.with_edges(|edges| {
                for &vertex in edges.iter() {
                    let vertex = unsafe { vertex.as_ref() };
                    let Some(target) = vertex.load_target() else {
                        continue;
                    };
                    if target.generation.load_raw() != self_raw {
                        continue;
                    }
                    if target.promote_red_to_grey() {
                        let at = target.scan_index.load(Ordering::Relaxed);
                        if at >= *wave_end {
                            swap_members(controls, at, *wave_end);
                            *wave_end += 1;
                        }
                    }
                }
            });
            *wave_begin += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred collection
// ---------------------------------------------------------------------------

/// A pending collection of one generation.
///
/// Handed to the delay hook installed with [`set_delay_gc`]; calling
/// [`GcOperation::run`] performs the collection.
/// The handle is idempotent, and a handle dropped without ever being run
/// performs the collection at that point, so a scheduled collection cannot
/// be lost.
pub struct GcOperation {
    /// The generation to collect.
    gen: RefPtr<Generation>,
    /// Whether the collection has been performed.
    ran: AtomicBool,
}

impl GcOperation {
    /// Collect the generation this handle was issued for.
    ///
    /// Subsequent calls (and the drop) are no-ops.
    pub fn run(&self) {
        if !self.ran.swap(true, Ordering::SeqCst) {
            Generation::collect(&self.gen);
        }
    }
}

impl Drop for GcOperation {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for GcOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcOperation")
            .field("seq", &self.gen.sequence())
            .field("ran", &self.ran)
            .finish()
    }
}

/// The signature of a delay hook: receives pending collections and must see
/// that each is eventually run.
pub type DelayGcFn = dyn Fn(GcOperation) + Send + Sync;

/// The installed delay hook, behind a reader-writer lock so installation
/// excludes in-flight invocations.
static DELAY_GC: RwLock<Option<Box<DelayGcFn>>> = RwLock::new(None);

/// Install (or, with `None`, remove) the process-wide delay hook and return
/// the previous one.
///
/// With a hook installed, a thread whose release triggers a collection hands
/// the [`GcOperation`] to the hook instead of collecting inline, allowing
/// collection to be deferred onto an executor.
pub fn set_delay_gc(hook: Option<Box<DelayGcFn>>) -> Option<Box<DelayGcFn>> {
    std::mem::replace(&mut *DELAY_GC.write(), hook)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sequences_are_odd_and_increasing() {
        let a = Generation::fresh();
        let b = Generation::fresh();
        assert_eq!(a.sequence() & MOVEABLE, 1);
        assert_eq!(b.sequence() & MOVEABLE, 1);
        assert!(a.sequence() < b.sequence());
        assert!(a.sequence() >= 3);
    }

    #[test]
    fn unowned_is_sequence_zero() {
        let unowned = Generation::unowned();
        assert_eq!(unowned.sequence(), 0);
        // Pinning the singleton is a no-op.
        assert_eq!(unowned.pin_sequence(), 0);
    }

    #[test]
    fn pin_clears_the_moveable_bit() {
        let gen = Generation::fresh();
        let seq = gen.sequence();
        assert_eq!(gen.pin_sequence(), seq & !MOVEABLE);
        assert_eq!(gen.sequence(), seq & !MOVEABLE);
    }

    #[test]
    fn slide_respects_pin_and_floor() {
        // Burn a few sequence numbers so the slide target stays above the
        // floor no matter which test allocates first.
        let _pad = (Generation::fresh(), Generation::fresh());

        // Sliding below a pinned target succeeds and stays moveable.
        let b = Generation::fresh();
        let a = Generation::fresh(); // a orders after b
        let bseq = b.pin_sequence();
        assert!(a.sequence() > bseq);
        assert!(a.try_slide(bseq));
        assert!(a.sequence() < bseq);
        assert_eq!(a.sequence() & MOVEABLE, 1);

        // A pinned generation refuses to slide below an older one.
        let d = Generation::fresh();
        let c = Generation::fresh();
        c.pin_sequence();
        assert!(c.sequence() > d.sequence());
        assert!(!c.try_slide(d.pin_sequence()));

        // Nothing slides below the floor.
        let e = Generation::fresh();
        assert!(!e.try_slide(2));
    }

    #[test]
    fn collect_on_an_empty_generation_is_a_no_op() {
        let gen = Generation::fresh();
        Generation::collect(&gen);
        assert_eq!(gen.len(), 0);
    }

    #[test]
    fn request_consumes_the_flag_once() {
        let gen = Generation::fresh();
        Generation::request(&gen);
        // The inline run cleared the flag again; a second request is fine.
        Generation::request(&gen);
        assert!(!gen.gc_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn gc_operation_is_idempotent() {
        let gen = Generation::fresh();
        let op = GcOperation {
            gen: gen.clone(),
            ran: AtomicBool::new(false),
        };
        op.run();
        op.run();
        drop(op);
        assert_eq!(gen.len(), 0);
    }
}
