use core::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LaunchError, Result};
use crate::native::NativeApi;

/// A raw OS handle value. Pointer sized, as `HANDLE` is.
pub type RawHandle = isize;

/// The pseudo-value returned by some primitives on failure.
pub const INVALID_HANDLE_VALUE: RawHandle = -1;

/// Returns true for values that can never refer to an owned kernel object.
pub fn is_invalid(raw: RawHandle) -> bool {
    raw == 0 || raw == INVALID_HANDLE_VALUE
}

/// What a handle refers to. Only used to make log events meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Process,
    Thread,
    Token,
    PipeRead,
    PipeWrite,
    File,
}

/// Ownership state of a [`NativeHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The wrapper owns the value and will release it.
    Open,
    /// The value was handed to someone else with [`NativeHandle::detach`].
    Detached,
    /// The value was released.
    Closed,
}

/// Exclusive owner of one OS handle.
///
/// The handle is released exactly once: by [`close`](Self::close) or, failing
/// that, when the wrapper is dropped. [`detach`](Self::detach) transfers the
/// value out and leaves the wrapper inert. The type is deliberately not
/// `Clone`; a second owner of the same value would double-close it.
pub struct NativeHandle {
    raw: RawHandle,
    kind: HandleKind,
    state: HandleState,
    api: Arc<dyn NativeApi>,
}

impl NativeHandle {
    /// Takes ownership of a value freshly returned by a native call.
    /// Invalid values produce an inert (closed) wrapper.
    pub(crate) fn owned(api: Arc<dyn NativeApi>, raw: RawHandle, kind: HandleKind) -> Self {
        let state = if is_invalid(raw) {
            HandleState::Closed
        } else {
            HandleState::Open
        };
        Self {
            raw,
            kind,
            state,
            api,
        }
    }

    /// Wraps a raw handle obtained outside this crate.
    ///
    /// # Safety
    ///
    /// `raw` must be a handle the caller owns and that no other wrapper
    /// (in this crate or elsewhere) will release.
    pub unsafe fn from_raw(api: Arc<dyn NativeApi>, raw: RawHandle, kind: HandleKind) -> Self {
        Self::owned(api, raw, kind)
    }

    /// What the handle refers to. Only used in diagnostics.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Whether the handle is still owned, was closed, or was detached.
    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Borrows the raw value without giving up ownership.
    pub fn as_raw(&self) -> Result<RawHandle> {
        if self.is_open() {
            Ok(self.raw)
        } else {
            Err(LaunchError::HandleAlreadyClosed)
        }
    }

    /// Gives up ownership and returns the raw value. The caller becomes
    /// responsible for releasing it.
    pub fn detach(&mut self) -> Result<RawHandle> {
        if !self.is_open() {
            return Err(LaunchError::HandleAlreadyClosed);
        }
        self.state = HandleState::Detached;
        debug!(kind = ?self.kind, raw = self.raw, "detached handle");
        Ok(self.raw)
    }

    /// Releases the handle. Closing an inert handle is a no-op.
    ///
    /// The wrapper becomes inert even if the native release fails, so the
    /// value is never released twice.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.state = HandleState::Closed;
        debug!(kind = ?self.kind, raw = self.raw, "closing handle");
        self.api
            .close_handle(self.raw)
            .map_err(|code| LaunchError::CloseFailure { code })
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(kind = ?self.kind, raw = self.raw, %error, "failed to release handle");
        }
    }
}
