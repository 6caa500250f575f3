use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::RingBuffer;

mod buffer_tests;
mod wrap_tests;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A shared-memory name no other test or test run uses.
pub(crate) fn unique_name(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// A freshly created buffer whose shared objects are removed when dropped.
pub(crate) struct TestBuffer {
    pub name: String,
    pub buffer: RingBuffer,
}

impl TestBuffer {
    pub fn with_capacity(capacity: usize) -> TestBuffer {
        let name = unique_name("test buffer");
        let buffer = RingBuffer::open_or_create_with_capacity(&name, capacity).unwrap();
        TestBuffer { name, buffer }
    }

    /// A second, independent handle on the same buffer.
    pub fn reopen(&self) -> RingBuffer {
        RingBuffer::open_or_create(&self.name).unwrap()
    }
}

impl Drop for TestBuffer {
    fn drop(&mut self) {
        let _ = RingBuffer::remove(&self.name);
    }
}
