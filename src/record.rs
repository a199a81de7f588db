use std::sync::Arc;

use crate::error::Result;
use crate::handle::{HandleKind, NativeHandle};
use crate::native::{NativeApi, ProcessInformation};

/// The handles and identifiers produced by a successful creation call.
///
/// Both handles are owned. Whatever is still open when the record is
/// released or dropped gets closed.
#[derive(Debug)]
pub struct ProcessRecord {
    process: NativeHandle,
    thread: NativeHandle,
    process_id: u32,
    thread_id: u32,
}

impl ProcessRecord {
    pub(crate) fn from_information(api: Arc<dyn NativeApi>, info: ProcessInformation) -> Self {
        Self {
            process: NativeHandle::owned(api.clone(), info.process, HandleKind::Process),
            thread: NativeHandle::owned(api, info.thread, HandleKind::Thread),
            process_id: info.process_id,
            thread_id: info.thread_id,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn process(&self) -> &NativeHandle {
        &self.process
    }

    /// Mutable access, for closing the process handle early.
    pub fn process_mut(&mut self) -> &mut NativeHandle {
        &mut self.process
    }

    pub fn thread(&self) -> &NativeHandle {
        &self.thread
    }

    /// The thread handle is closed once the process has been resumed.
    pub fn thread_mut(&mut self) -> &mut NativeHandle {
        &mut self.thread
    }

    /// Closes whichever handles are still open. Both are attempted even if
    /// the first fails; the first failure is returned.
    pub fn release(mut self) -> Result<()> {
        let thread = self.thread.close();
        let process = self.process.close();
        thread.and(process)
    }
}
