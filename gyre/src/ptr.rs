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

//! The public pointer types.
//!
//! [`Strong<T>`] is the shared-ownership handle: it keeps its target alive
//! outright, like an `Arc`.
//! [`Member<T>`] is an *edge*: it lives inside a managed object and points
//! at another managed object, and it is what the cycle collector traces —
//! a graph knotted together out of members is collected even when it is
//! cyclic.
//! [`Weak<T>`] observes without keeping alive, and [`Anchor<T>`] is an
//! embedded field through which an object can mint pointers to itself.
//!
//! Members and anchors must be reachable from their containing value's
//! [`Cyclic::accept`]; construction visits them once to bind each to the
//! control block whose published storage range covers it.

use std::{
    fmt,
    marker::PhantomData,
    mem::size_of,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    control::{Colour, ControlBlock, Repr},
    generation::Generation,
    hazard::{Counted as _, RefPtr},
    publish::{self, Publication},
    vertex::Vertex,
    Cyclic, Error, Visitor,
};

// ---------------------------------------------------------------------------
// Strong
// ---------------------------------------------------------------------------

/// A shared-ownership pointer to a managed allocation.
///
/// Keeps the target alive: the pointee is not destroyed while any `Strong`
/// to it exists.
/// Unlike [`Member`], a `Strong` is invisible to the cycle collector — a
/// cycle closed through a `Strong` field leaks exactly the way an `Arc`
/// cycle does, so objects should refer to each other through members.
pub struct Strong<T> {
    /// The control block; this pointer owns one strong and one control
    /// reference on it.
    ctrl: NonNull<ControlBlock>,
    /// The referent; equal to the managed object unless aliased.
    value: NonNull<T>,
    /// Own-a-`T` semantics for the drop checker.
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for Strong<T> {}
unsafe impl<T: Send + Sync> Sync for Strong<T> {}

impl<T: Cyclic + 'static> Strong<T> {
    /// Allocate a new managed object.
    ///
    /// The value's members and anchors are bound as part of construction.
    ///
    /// # Panics
    ///
    /// Panics if binding fails, which indicates an `accept` implementation
    /// visiting fields it does not own; see [`Strong::try_new_with`] for the
    /// recoverable form.
    pub fn new(value: T) -> Strong<T> {
        Strong::new_with(|| value)
    }

    /// Allocate a new managed object produced by a closure.
    ///
    /// The closure may itself allocate managed objects and prepare member
    /// fields pointing at them.
    ///
    /// # Panics
    ///
    /// Panics if binding fails; see [`Strong::try_new_with`].
    pub fn new_with(f: impl FnOnce() -> T) -> Strong<T> {
        match Strong::try_new_with(f) {
            Ok(strong) => strong,
            Err(e) => panic!("construction of a managed object failed: {e}"),
        }
    }

    /// Allocate a managed object into the shared unowned generation.
    ///
    /// For objects known not to participate in cycles: they skip the cost of
    /// a generation of their own and never cause merges through their
    /// outgoing edges (the unowned generation orders below every other).
    /// The marking is an optimisation, not an obligation — an edge *into*
    /// such an object folds it back into the pointing object's generation,
    /// and even a cycle formed against the marking is still collected.
    ///
    /// # Panics
    ///
    /// Panics if binding fails; see [`Strong::try_new_with`].
    pub fn new_acyclic(value: T) -> Strong<T> {
        match Strong::construct(Generation::unowned(), || value) {
            Ok(strong) => strong,
            Err(e) => panic!("construction of a managed object failed: {e}"),
        }
    }

    /// Allocate a new managed object, surfacing binding failures.
    ///
    /// On failure the partially-bound value is torn down through the
    /// collector and the storage is reclaimed; the control block never
    /// leaves its under-construction state, so no pointer to the dead value
    /// can have escaped through an anchor.
    ///
    /// # Errors
    ///
    /// Whatever binding reports: [`Error::NoPublishedOwner`] for a member or
    /// anchor outside the value's own storage, [`Error::MistypedAnchor`] for
    /// an anchor that is not an `Anchor<T>` of the allocated type, and
    /// [`Error::Inaccessible`] for fields `accept` could not reach.
    pub fn try_new_with(f: impl FnOnce() -> T) -> Result<Strong<T>, Error> {
        Strong::construct(Generation::fresh(), f)
    }

    /// The allocation pipeline: allocate, publish, produce, write, bind.
    fn construct(gen: RefPtr<Generation>, f: impl FnOnce() -> T) -> Result<Strong<T>, Error> {
        let repr: NonNull<Repr<T>> = ControlBlock::allocate(gen.clone());
        let ctrl = unsafe { NonNull::from(&(*repr.as_ptr()).ctrl) };
        gen.adopt(ctrl);
        let value_ptr: NonNull<T> = unsafe { ctrl.as_ref() }.object_ptr();

        // Declared before the publication so that an unwind tears the entry
        // out of the publisher map first.
        let mut abort = AbortConstruction {
            gen,
            ctrl,
            armed: true,
        };
        let publication = Publication::new(value_ptr.as_ptr() as usize, size_of::<T>(), ctrl);

        let value = f();
        unsafe { value_ptr.as_ptr().write(value) };
        // The value exists now; failure handling moves from raw teardown to
        // the collector.
        abort.armed = false;
        drop(abort);

        let bound = unsafe { value_ptr.as_ref() }.accept(&mut Binder);
        drop(publication);

        match bound {
            Ok(()) => {
                unsafe { ctrl.as_ref() }.finish_construction();
                Ok(Strong {
                    ctrl,
                    value: value_ptr,
                    _marker: PhantomData,
                })
            }
            Err(e) => {
                unsafe {
                    ctrl.as_ref().release(false);
                    ControlBlock::decr(ctrl);
                }
                Err(e)
            }
        }
    }
}

/// Unwind protection for [`Strong::try_new_with`]: if the value never came
/// to exist, the allocation is unpicked by hand.
struct AbortConstruction {
    /// The generation that adopted the stillborn control block.
    gen: RefPtr<Generation>,
    /// The stillborn control block.
    ctrl: NonNull<ControlBlock>,
    /// Cleared once the value has been written.
    armed: bool,
}

impl Drop for AbortConstruction {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.gen.expel(self.ctrl);
        unsafe {
            // The member list's control reference and the initial strong
            // pointer's.
            ControlBlock::decr(self.ctrl);
            ControlBlock::decr(self.ctrl);
        }
    }
}

impl<T> Strong<T> {
    /// Assemble a `Strong` from a control reference and an already-acquired
    /// strong count.
    pub(crate) fn from_parts(ctrl: RefPtr<ControlBlock>, value: NonNull<T>) -> Strong<T> {
        Strong {
            ctrl: ctrl.into_raw(),
            value,
            _marker: PhantomData,
        }
    }

    /// The control block.
    fn ctrl(&self) -> &ControlBlock {
        unsafe { self.ctrl.as_ref() }
    }

    /// Whether this pointer's referent is not the managed object itself.
    pub(crate) fn is_aliased(&self) -> bool {
        self.ctrl().object_ptr::<T>() != self.value
    }

    /// The control block pointer, for edge assignment.
    pub(crate) fn control(&self) -> NonNull<ControlBlock> {
        self.ctrl
    }

    /// Create a [`Weak`] observing the same allocation.
    pub fn downgrade(this: &Strong<T>) -> Weak<T> {
        Weak {
            ctrl: unsafe { RefPtr::acquire(this.ctrl) }.into_raw(),
            value: this.value,
            _marker: PhantomData,
        }
    }

    /// An aliasing pointer: shares ownership of this allocation but refers
    /// to a part of it.
    pub fn project<U>(this: &Strong<T>, f: impl FnOnce(&T) -> &U) -> Strong<U> {
        this.ctrl().acquire_no_red();
        let ctrl = unsafe { RefPtr::acquire(this.ctrl) };
        let value = NonNull::from(f(this));
        Strong::from_parts(ctrl, value)
    }

    /// Whether two pointers share one allocation, referents aside.
    pub fn ptr_eq(this: &Strong<T>, other: &Strong<T>) -> bool {
        this.ctrl == other.ctrl
    }
}

impl<T> Clone for Strong<T> {
    fn clone(&self) -> Self {
        self.ctrl().acquire_no_red();
        let ctrl = unsafe { RefPtr::acquire(self.ctrl) };
        Strong::from_parts(ctrl, self.value)
    }
}

impl<T> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

impl<T> AsRef<T> for Strong<T> {
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T> Drop for Strong<T> {
    fn drop(&mut self) {
        // Order matters: the release may run a whole collection inline, and
        // the control block must outlive it.
        self.ctrl().release(false);
        unsafe { ControlBlock::decr(self.ctrl) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> fmt::Pointer for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.value, f)
    }
}

impl<T: PartialEq> PartialEq for Strong<T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for Strong<T> {}

impl<T: std::hash::Hash> std::hash::Hash for Strong<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (**self).hash(state);
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// An edge field: a pointer from one managed object to another, traced by
/// the cycle collector.
///
/// A member is declared as a field of a managed value and visited by that
/// value's [`Cyclic::accept`]; construction binds it to its owner.
/// Reads and writes go through [`Member::get`] and [`Member::set`] — a
/// member is always usable through a shared reference, and reads are safe
/// against concurrent assignment from other threads.
///
/// Once the owning object has been condemned by the collector, its members
/// are expired: reads return `None` and writes do nothing.
pub struct Member<T> {
    /// The underlying edge.
    vertex: Vertex,
    /// Members behave like they own a share of the target.
    _marker: PhantomData<Strong<T>>,
}

unsafe impl<T: Send + Sync> Send for Member<T> {}
unsafe impl<T: Send + Sync> Sync for Member<T> {}

impl<T> Member<T> {
    /// A member pointing at nothing.
    pub fn null() -> Member<T> {
        Member {
            vertex: Vertex::unbound(),
            _marker: PhantomData,
        }
    }

    /// A member pointing at `source`'s allocation.
    ///
    /// The reference is parked until the containing value is bound, at which
    /// point the edge is accounted like any other assignment.
    ///
    /// # Panics
    ///
    /// Panics if `source` is aliased; member edges always target whole
    /// managed objects.
    pub fn new(source: &Strong<T>) -> Member<T> {
        assert!(
            !source.is_aliased(),
            "aliased pointers cannot be stored in member edges"
        );
        Member {
            vertex: Vertex::unbound_with(donated(source)),
            _marker: PhantomData,
        }
    }

    /// Read the edge, taking shared ownership of the target.
    ///
    /// Returns `None` for a null edge and for any edge whose owner has been
    /// collected.
    pub fn get(&self) -> Option<Strong<T>> {
        if let Some(owner) = self.vertex.owner() {
            if owner.colour() == Colour::Black {
                return None;
            }
        }
        let target = self.vertex.load_target()?;
        target.acquire();
        let value = target.object_ptr::<T>();
        Some(Strong::from_parts(target, value))
    }

    /// Point the edge at `source`'s allocation.
    ///
    /// A no-op if the owner has been collected.
    ///
    /// # Panics
    ///
    /// Panics if `source` is aliased; member edges always target whole
    /// managed objects.
    pub fn set(&self, source: &Strong<T>) {
        assert!(
            !source.is_aliased(),
            "aliased pointers cannot be stored in member edges"
        );
        self.vertex.reset(Some(donated(source)), true, true);
    }

    /// Point the edge at nothing.
    pub fn clear(&self) {
        self.vertex.reset(None, false, true);
    }

    /// Whether the edge currently points at nothing.
    ///
    /// Racy by nature: a concurrent assignment may change the answer before
    /// it is returned.
    pub fn is_null(&self) -> bool {
        self.vertex.load_target().is_none()
    }

    /// Bind this member's edge to the control block covering its address.
    fn bind_at(&self, addr: usize) -> Result<(), Error> {
        if self.vertex.is_bound() {
            return Ok(());
        }
        let ctrl = publish::lookup(addr, size_of::<Self>())
            .ok_or(Error::NoPublishedOwner { addr })?;
        self.vertex.bind(ctrl);
        Ok(())
    }
}

/// Clone the references a strong pointer donates to an edge assignment: one
/// strong count and one control reference.
fn donated<T>(source: &Strong<T>) -> RefPtr<ControlBlock> {
    source.ctrl().acquire_no_red();
    unsafe { RefPtr::acquire(source.control()) }
}

impl<T> Default for Member<T> {
    fn default() -> Self {
        Member::null()
    }
}

impl<T> From<&Strong<T>> for Member<T> {
    fn from(source: &Strong<T>) -> Self {
        Member::new(source)
    }
}

unsafe impl<T> Cyclic for Member<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        visitor.visit_member(self)
    }
}

impl<T> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("null", &self.is_null())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Weak
// ---------------------------------------------------------------------------

/// A non-owning observer of a managed allocation.
///
/// Holds the control block, not the value: upgrading fails once the
/// collector has condemned the allocation.
pub struct Weak<T> {
    /// The control block; this pointer owns one control reference.
    ctrl: NonNull<ControlBlock>,
    /// The referent recorded at downgrade time.
    value: NonNull<T>,
    /// Observers carry no `T` ownership.
    _marker: PhantomData<NonNull<T>>,
}

unsafe impl<T: Send + Sync> Send for Weak<T> {}
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T> Weak<T> {
    /// Attempt to take shared ownership of the allocation.
    ///
    /// Returns `None` once the target is condemned.
    /// An upgrade racing the collector either pins the target live or
    /// observes it expired; it never produces a dangling pointer.
    pub fn upgrade(&self) -> Option<Strong<T>> {
        let ctrl = unsafe { self.ctrl.as_ref() };
        if !ctrl.weak_acquire() {
            return None;
        }
        Some(Strong::from_parts(
            unsafe { RefPtr::acquire(self.ctrl) },
            self.value,
        ))
    }

    /// Whether two weak pointers observe one allocation.
    pub fn ptr_eq(this: &Weak<T>, other: &Weak<T>) -> bool {
        this.ctrl == other.ctrl
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Weak {
            ctrl: unsafe { RefPtr::acquire(self.ctrl) }.into_raw(),
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Weak<T> {
    fn drop(&mut self) {
        unsafe { ControlBlock::decr(self.ctrl) };
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

// ---------------------------------------------------------------------------
// Anchor
// ---------------------------------------------------------------------------

/// An embedded field through which a managed object refers to itself.
///
/// Declare an `Anchor<Self>` field, visit it from `accept`, and the object
/// can mint [`Strong`] or [`Weak`] pointers to itself after construction —
/// the `shared_from_this` of this library.
pub struct Anchor<T> {
    /// The owning control block; null until bound, then holds one control
    /// reference.
    ctrl: AtomicPtr<ControlBlock>,
    /// Anchors carry no `T` ownership.
    _marker: PhantomData<NonNull<T>>,
}

unsafe impl<T: Send + Sync> Send for Anchor<T> {}
unsafe impl<T: Send + Sync> Sync for Anchor<T> {}

impl<T> Anchor<T> {
    /// An unbound anchor.
    pub fn new() -> Anchor<T> {
        Anchor {
            ctrl: AtomicPtr::new(std::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// A strong pointer to the containing object.
    ///
    /// # Errors
    ///
    /// [`Error::UnderConstruction`] while the containing object has not
    /// finished construction, [`Error::Unanchored`] if the anchor was never
    /// bound, and [`Error::Expired`] once the object is condemned (an anchor
    /// can observe that from the object's own destructor).
    pub fn strong(&self) -> Result<Strong<T>, Error> {
        let ctrl = self.bound()?;
        let block = unsafe { ctrl.as_ref() };
        if block.is_under_construction() {
            return Err(Error::UnderConstruction);
        }
        if !block.weak_acquire() {
            return Err(Error::Expired);
        }
        Ok(Strong::from_parts(
            unsafe { RefPtr::acquire(ctrl) },
            block.object_ptr::<T>(),
        ))
    }

    /// A weak pointer to the containing object.
    ///
    /// # Errors
    ///
    /// As for [`Anchor::strong`], except that expiry is representable and
    /// returns a weak pointer that will fail to upgrade.
    pub fn weak(&self) -> Result<Weak<T>, Error> {
        let ctrl = self.bound()?;
        let block = unsafe { ctrl.as_ref() };
        if block.is_under_construction() {
            return Err(Error::UnderConstruction);
        }
        Ok(Weak {
            ctrl: unsafe { RefPtr::acquire(ctrl) }.into_raw(),
            value: block.object_ptr::<T>(),
            _marker: PhantomData,
        })
    }

    /// The bound control block.
    fn bound(&self) -> Result<NonNull<ControlBlock>, Error> {
        NonNull::new(self.ctrl.load(Ordering::Acquire)).ok_or(Error::Unanchored)
    }

    /// Bind this anchor to the control block covering its address.
    ///
    /// The anchor's parameter must be the very type the covering allocation
    /// manages; an anchor buried in a sub-structure (or declared with the
    /// wrong type) is refused rather than allowed to hand out mistyped
    /// pointers later.
    fn bind_at(&self, addr: usize) -> Result<(), Error>
    where
        T: 'static,
    {
        if !self.ctrl.load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let ctrl = publish::lookup(addr, size_of::<Self>())
            .ok_or(Error::NoPublishedOwner { addr })?;
        if unsafe { ctrl.as_ref() }.object_type() != std::any::TypeId::of::<T>() {
            return Err(Error::MistypedAnchor);
        }
        unsafe { ControlBlock::incr(ctrl) };
        self.ctrl.store(ctrl.as_ptr(), Ordering::Release);
        Ok(())
    }
}

impl<T> Default for Anchor<T> {
    fn default() -> Self {
        Anchor::new()
    }
}

impl<T> Drop for Anchor<T> {
    fn drop(&mut self) {
        if let Some(ctrl) = NonNull::new(*self.ctrl.get_mut()) {
            unsafe { ControlBlock::decr(ctrl) };
        }
    }
}

unsafe impl<T: 'static> Cyclic for Anchor<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        visitor.visit_anchor(self)
    }
}

impl<T> fmt::Debug for Anchor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Anchor)")
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// The construction-time visitor: binds every member and anchor of a value
/// to the control block whose published range covers it.
pub(crate) struct Binder;

impl Visitor for Binder {
    fn visit_member<T>(&mut self, member: &Member<T>) -> Result<(), Error> {
        member.bind_at(member as *const Member<T> as usize)
    }

    fn visit_anchor<T: 'static>(&mut self, anchor: &Anchor<T>) -> Result<(), Error> {
        anchor.bind_at(anchor as *const Anchor<T> as usize)
    }
}
