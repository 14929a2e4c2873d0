use rustc_hash::FxHashSet;
use tracing::{trace, warn};
use crate::buffer_pages::BufferPageSet;

/// Book-keeping for the buffer fragments the kernel handed to the application on one socket.
///
/// The kernel is the authority on page ownership; this is the application side's view of it,
///  used to catch protocol violations early (recycling a fragment twice, or one that was never
///  handed out) and to report pool usage.
///
/// Ownership is tracked per offset rather than per pool page: the tail fragments of several
///  messages can share a pool page, and the kernel holds one reference on that page for each of
///  them. Every one of these offsets has to be recycled on its own.
#[derive(Debug, Default)]
pub struct PageLedger {
    owned: FxHashSet<u32>,
}

impl PageLedger {
    pub fn new() -> PageLedger {
        PageLedger::default()
    }

    /// Record fragments handed out by a receive
    pub fn acquire(&mut self, pages: &BufferPageSet) {
        for offset in pages.iter() {
            if !self.owned.insert(offset) {
                warn!("buffer offset {} handed out while already owned by the application", offset);
            }
        }
        trace!("acquired {:?}, {} fragments outstanding", pages, self.outstanding());
    }

    /// Record fragments handed back to the kernel. Returns the subset of `pages` that was
    ///  actually owned - offsets that are not owned are dropped with a warning, since passing
    ///  them to the kernel would make it reject the whole call.
    pub fn release(&mut self, pages: &BufferPageSet) -> BufferPageSet {
        let mut valid = Vec::with_capacity(pages.count() as usize);
        for offset in pages.iter() {
            if self.owned.remove(&offset) {
                valid.push(offset);
            }
            else {
                warn!("attempting to recycle buffer offset {} which is not owned by the application - ignoring", offset);
            }
        }
        BufferPageSet::from_offsets(&valid)
    }

    pub fn is_owned(&self, offset: u32) -> bool {
        self.owned.contains(&offset)
    }

    /// number of fragments currently owned by the application
    pub fn outstanding(&self) -> usize {
        self.owned.len()
    }

    /// Forget everything, e.g. when the socket is closed and the pool goes away with it
    pub fn clear(&mut self) {
        self.owned.clear();
    }
}
