//! Hand-off markers.
//!
//! [`AssertSend`] and [`AssertSync`] do nothing at runtime. Wrapping a value at
//! the point it crosses a thread boundary makes the crossing visible in the code
//! and easy to find in review. The constructors require the matching auto trait,
//! so the assertion is also checked by the compiler; neither wrapper changes the
//! auto-trait status of what it holds.

use std::ops::{Deref, DerefMut};

/// A value being handed to another thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AssertSend<T>(T);

impl<T: Send> AssertSend<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> AssertSend<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    pub const fn get(&self) -> &T {
        &self.0
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> Deref for AssertSend<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for AssertSend<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A value being shared between threads at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AssertSync<T>(T);

impl<T: Sync> AssertSync<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> AssertSync<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    pub const fn get(&self) -> &T {
        &self.0
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> Deref for AssertSync<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for AssertSync<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
