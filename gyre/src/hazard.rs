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

//! Hazard-protected reads of reference-counted pointer cells.
//!
//! A [`HazardCell`] is an atomic pointer whose pointee carries an intrusive
//! reference count (the [`Counted`] trait).
//! The cell owns one count on whatever it currently points to.
//! The problem this module solves is the classic one: a reader loads the
//! pointer and wants to increment the pointee's count, but between the load
//! and the increment a writer may have swapped the cell and dropped the last
//! count.
//!
//! Readers solve it by publishing the loaded pointer in a process-wide slot
//! table before re-checking the cell.
//! Writers, after swapping a cell, walk the table and *donate* a reference to
//! every slot still advertising the old value, so that no reader ever ends up
//! holding a pointer whose count it cannot claim.
//! The fast path is wait-free; contention on a slot degrades to bounded
//! spinning.

use std::{
    cell::Cell,
    marker::PhantomData,
    mem::forget,
    ops::Deref,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// The number of hazard slots in the process-wide table.
///
/// Must be a power of two so that round-robin assignment reduces to a mask.
const SLOT_COUNT: usize = 64;

/// The process-wide hazard slot table.
///
/// Each slot is cache-line padded so that two readers publishing into
/// neighbouring slots do not false-share.
static SLOTS: [CachePadded<AtomicPtr<()>>; SLOT_COUNT] =
    [const { CachePadded::new(AtomicPtr::new(null_mut())) }; SLOT_COUNT];

/// Round-robin source for slot assignment.
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The slot index this thread publishes into, assigned on first use.
    static SLOT_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Get the hazard slot assigned to the calling thread.
///
/// Assignment is round-robin, so distinct threads may share a slot; the
/// publication loop in [`HazardCell::get`] spins while the slot is occupied.
fn my_slot() -> &'static AtomicPtr<()> {
    let idx = SLOT_INDEX.with(|i| match i.get() {
        Some(idx) => idx,
        None => {
            let idx = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) & (SLOT_COUNT - 1);
            i.set(Some(idx));
            idx
        }
    });
    &SLOTS[idx]
}

/// A type with an intrusive reference count that hazard cells know how to
/// manipulate.
///
/// # Safety
///
/// `incr` and `decr` must behave like strong-count operations on a shared
/// allocation: the pointee must stay valid while the count is positive, and
/// `decr` must be callable exactly once per successful `incr` (plus once per
/// count the pointee was created with).
pub(crate) unsafe trait Counted {
    /// Add one count to the pointee.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live value whose count is positive.
    unsafe fn incr(ptr: NonNull<Self>);

    /// Remove one count from the pointee, destroying it if this was the last.
    ///
    /// # Safety
    ///
    /// The caller must own the count being released.
    unsafe fn decr(ptr: NonNull<Self>);
}

/// An owning pointer to a [`Counted`] value.
///
/// Holds exactly one count; cloning takes another, dropping releases it.
pub(crate) struct RefPtr<T: Counted> {
    /// The counted pointee.
    ptr: NonNull<T>,
}

unsafe impl<T: Counted + Send + Sync> Send for RefPtr<T> {}
unsafe impl<T: Counted + Send + Sync> Sync for RefPtr<T> {}

impl<T: Counted> RefPtr<T> {
    /// Take ownership of one already-held count on `ptr`.
    pub fn from_raw(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Acquire a fresh count on `ptr` and own it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live value whose count is positive.
    pub unsafe fn acquire(ptr: NonNull<T>) -> Self {
        T::incr(ptr);
        Self { ptr }
    }

    /// The raw pointee address.
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Give up ownership without releasing the count.
    pub fn into_raw(self) -> NonNull<T> {
        let ptr = self.ptr;
        forget(self);
        ptr
    }
}

impl<T: Counted> Clone for RefPtr<T> {
    fn clone(&self) -> Self {
        unsafe { Self::acquire(self.ptr) }
    }
}

impl<T: Counted> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Counted> Drop for RefPtr<T> {
    fn drop(&mut self) {
        unsafe { T::decr(self.ptr) };
    }
}

/// An atomic pointer cell owning one count on its pointee, readable through
/// the hazard protocol.
pub(crate) struct HazardCell<T: Counted> {
    /// The current pointee, or null.
    cell: AtomicPtr<T>,
    /// The cell logically owns a count on `*cell`.
    _marker: PhantomData<RefPtr<T>>,
}

impl<T: Counted> HazardCell<T> {
    /// A cell holding null.
    pub fn null() -> Self {
        Self {
            cell: AtomicPtr::new(null_mut()),
            _marker: PhantomData,
        }
    }

    /// A cell initially holding `ptr`, taking over its count.
    pub fn new(ptr: RefPtr<T>) -> Self {
        Self {
            cell: AtomicPtr::new(ptr.into_raw().as_ptr()),
            _marker: PhantomData,
        }
    }

    /// Unprotected load of the current pointee address.
    ///
    /// The result may be dangling by the time the caller looks at it; it is
    /// only good for identity comparisons under external locking.
    pub fn load_raw(&self) -> *mut T {
        self.cell.load(Ordering::SeqCst)
    }

    /// Read the cell and acquire a count on the pointee.
    ///
    /// Returns `None` if the cell holds null.
    /// This is the reader half of the hazard protocol: publish the loaded
    /// pointer in our slot, re-check the cell, and only then claim a count.
    /// A writer that swapped the cell in between either lets our retraction
    /// succeed (we retry) or donates us a count we immediately discard,
    /// because reusing it would be unsound if the cell has meanwhile been
    /// set back to the same address by an unrelated assignment.
    pub fn get(&self) -> Option<RefPtr<T>> {
        let slot = my_slot();
        loop {
            let tgt = self.cell.load(Ordering::SeqCst);
            let Some(nn) = NonNull::new(tgt) else {
                return None;
            };

            // Publish. The slot may be busy with another thread's read.
            while slot
                .compare_exchange_weak(
                    null_mut(),
                    tgt.cast(),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                std::hint::spin_loop();
            }

            if self.cell.load(Ordering::SeqCst) == tgt {
                // The pointee was live at the instant our publication was
                // visible, so its count is still claimable.
                unsafe { T::incr(nn) };
                if slot
                    .compare_exchange(tgt.cast(), null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // A writer sold us a count through the slot; we now hold
                    // two and owe one back.
                    unsafe { T::decr(nn) };
                }
                return Some(RefPtr::from_raw(nn));
            }

            // The cell moved on. Retract the publication; if retraction
            // fails, a writer donated a count for the stale value.
            if slot
                .compare_exchange(tgt.cast(), null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                unsafe { T::decr(nn) };
            }
        }
    }

    /// Replace the cell's pointee, returning the cell's count on the old one.
    ///
    /// This is the writer half of the protocol: after the exchange, every
    /// slot still advertising the old value is sold a freshly minted count,
    /// so a reader whose re-check already passed can complete its claim.
    pub fn swap(&self, new: Option<RefPtr<T>>) -> Option<RefPtr<T>> {
        let new_raw = new.map_or(null_mut(), |p| p.into_raw().as_ptr());
        let old = self.cell.swap(new_raw, Ordering::SeqCst);
        let old = NonNull::new(old)?;
        let old = RefPtr::from_raw(old);
        donate(&old);
        Some(old)
    }

    /// Store a new pointee, releasing the old one's count.
    pub fn store(&self, new: Option<RefPtr<T>>) {
        drop(self.swap(new));
    }
}

impl<T: Counted> Drop for HazardCell<T> {
    fn drop(&mut self) {
        // No reader can still be mid-protocol on a cell being dropped, so
        // the count can be released without the donation walk.
        if let Some(old) = NonNull::new(*self.cell.get_mut()) {
            drop(RefPtr::from_raw(old));
        }
    }
}

/// Offer a count on `old` to every hazard slot still advertising it.
///
/// For each such slot a count is minted and then sold by nulling the slot;
/// if the reader retracts first, the unsold count is released again.
fn donate<T: Counted>(old: &RefPtr<T>) {
    let raw: *mut () = old.as_ptr().as_ptr().cast();
    for slot in &SLOTS {
        if slot.load(Ordering::SeqCst) == raw {
            unsafe { T::incr(old.as_ptr()) };
            if slot
                .compare_exchange(raw, null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                unsafe { T::decr(old.as_ptr()) };
            }
        }
    }
}
