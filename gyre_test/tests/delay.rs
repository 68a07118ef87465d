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

//! The delay hook: collections handed to an external executor.
//!
//! The hook is process-wide state, so everything here runs as one test in
//! its own binary.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use gyre::{set_delay_gc, Cyclic, Error, GcOperation, Member, Strong, Visitor};

struct DropCount(Arc<AtomicUsize>);

impl Drop for DropCount {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

struct Node {
    next: Member<Node>,
    _drops: DropCount,
}

unsafe impl Cyclic for Node {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.next.accept(visitor)
    }
}

#[test]
fn delayed_collections_run_when_the_executor_says_so() {
    let queue: Arc<Mutex<Vec<GcOperation>>> = Arc::new(Mutex::new(Vec::new()));
    let enqueue = Arc::clone(&queue);
    let previous = set_delay_gc(Some(Box::new(move |op| {
        enqueue.lock().unwrap().push(op);
    })));
    assert!(previous.is_none());

    let drops = Arc::new(AtomicUsize::new(0));

    // An orphaned cycle is not collected until the queue is drained.
    let a = Strong::new(Node {
        next: Member::null(),
        _drops: DropCount(Arc::clone(&drops)),
    });
    a.next.set(&a);
    drop(a);

    assert_eq!(drops.load(Ordering::Relaxed), 0);
    assert!(!queue.lock().unwrap().is_empty());

    let pending = std::mem::take(&mut *queue.lock().unwrap());
    for op in &pending {
        // The handle is idempotent: running it twice collects once.
        op.run();
        op.run();
    }
    drop(pending);
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    // A handle dropped without being run still performs its collection.
    let b = Strong::new(Node {
        next: Member::null(),
        _drops: DropCount(Arc::clone(&drops)),
    });
    b.next.set(&b);
    drop(b);

    assert_eq!(drops.load(Ordering::Relaxed), 1);
    // Take the handles out before dropping them: a drop-triggered
    // collection may enqueue follow-up work through the hook.
    let unrun = std::mem::take(&mut *queue.lock().unwrap());
    drop(unrun);
    assert_eq!(drops.load(Ordering::Relaxed), 2);

    // Uninstall and fall back to inline collection.
    let hook = set_delay_gc(None);
    assert!(hook.is_some());
    let c = Strong::new(Node {
        next: Member::null(),
        _drops: DropCount(Arc::clone(&drops)),
    });
    c.next.set(&c);
    drop(c);
    assert_eq!(drops.load(Ordering::Relaxed), 3);
}
