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

//! [`Cyclic`] implementations for common standard-library types.
//!
//! Types that cannot contain a member or anchor accept trivially; container
//! types delegate to their elements.
//! Note that delegation does not lift the placement rule: members must live
//! directly in the managed value's storage, so a `Vec<Member<T>>` will fail
//! to bind (its buffer is not part of the published range), while a
//! `Vec<String>` is perfectly fine.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
    time::{Duration, Instant, SystemTime},
};

use crate::{Cyclic, Error, Visitor};

/// Implement a trivial [`Cyclic`] acceptance for types which can contain no
/// members or anchors.
macro_rules! cyclic_trivial {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Cyclic for $t {
                #[inline]
                fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), Error> {
                    Ok(())
                }
            }
        )*
    };
}

cyclic_trivial!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    str,
    String,
    OsStr,
    OsString,
    Path,
    PathBuf,
    Duration,
    Instant,
    SystemTime,
);

unsafe impl<T: Cyclic> Cyclic for Option<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        if let Some(inner) = self {
            inner.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<T: Cyclic, E: Cyclic> Cyclic for Result<T, E> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        match self {
            Ok(inner) => inner.accept(visitor),
            Err(inner) => inner.accept(visitor),
        }
    }
}

unsafe impl<T: Cyclic + ?Sized> Cyclic for Box<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        (**self).accept(visitor)
    }
}

unsafe impl<T: Cyclic> Cyclic for [T] {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for element in self {
            element.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<T: Cyclic, const N: usize> Cyclic for [T; N] {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.as_slice().accept(visitor)
    }
}

unsafe impl<T: Cyclic> Cyclic for Vec<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.as_slice().accept(visitor)
    }
}

unsafe impl<T: Cyclic> Cyclic for VecDeque<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for element in self {
            element.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<K: Cyclic, S> Cyclic for HashSet<K, S> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for key in self {
            key.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<K: Cyclic, W: Cyclic, S> Cyclic for HashMap<K, W, S> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for (key, value) in self {
            key.accept(visitor)?;
            value.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<K: Cyclic> Cyclic for BTreeSet<K> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for key in self {
            key.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<K: Cyclic, W: Cyclic> Cyclic for BTreeMap<K, W> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        for (key, value) in self {
            key.accept(visitor)?;
            value.accept(visitor)?;
        }
        Ok(())
    }
}

unsafe impl<T: Cyclic> Cyclic for RefCell<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.try_borrow()
            .map_err(|_| Error::Inaccessible)?
            .accept(visitor)
    }
}

unsafe impl<T: Cyclic> Cyclic for Mutex<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.try_lock()
            .map_err(|_| Error::Inaccessible)?
            .accept(visitor)
    }
}

unsafe impl<T: Cyclic> Cyclic for RwLock<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.try_read()
            .map_err(|_| Error::Inaccessible)?
            .accept(visitor)
    }
}

/// Implement delegating [`Cyclic`] acceptance for tuples of a given arity.
macro_rules! cyclic_tuple {
    ($(($($name:ident),+)),* $(,)?) => {
        $(
            unsafe impl<$($name: Cyclic),+> Cyclic for ($($name,)+) {
                fn accept<Vis: Visitor>(&self, visitor: &mut Vis) -> Result<(), Error> {
                    #[allow(non_snake_case)]
                    let ($($name,)+) = self;
                    $($name.accept(visitor)?;)+
                    Ok(())
                }
            }
        )*
    };
}

cyclic_tuple!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
);
