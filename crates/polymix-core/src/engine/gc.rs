//! RT-safe deferred deallocation for chunk PCM
//!
//! Channels hold `basedrop::Shared<ChunkData>` clones while playing. When the
//! last reference is dropped on the audio thread (channel finishes after the
//! application already released its handle), the PCM is not freed there:
//! the drop enqueues a pointer and a background collector thread reclaims it.
//! Freeing a multi-minute decoded buffer involves munmap-scale work that does
//! not fit in a buffer-period deadline.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Interval between collection sweeps
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Initialize the collector on its own thread and return a handle
fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("polymix-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread
            let mut collector = Collector::new();

            let handle = collector.handle();
            tx.send(handle).expect("failed to send GC handle");

            log::info!("chunk GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .expect("failed to spawn chunk GC thread");

    rx.recv().expect("failed to receive GC handle")
}

/// Get a handle for creating `Shared<T>` allocations
///
/// The handle is lightweight and can be cloned freely. The first call spawns
/// the collector thread.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
