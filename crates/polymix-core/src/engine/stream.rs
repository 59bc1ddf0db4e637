//! Streaming playback source - prefetch thread plus lock-free block rings
//!
//! Long-form audio (the music slot, or a channel playing from a decoder
//! cursor) is never decoded on the audio thread. A dedicated prefetch thread
//! owns the decoder and resampler and fills fixed-size sample blocks into an
//! SPSC ring; the mixdown tick only drains ready blocks. If the ring runs
//! empty before end of stream the tick substitutes silence and counts an
//! underrun - it never waits.
//!
//! Spent blocks travel back on a second ring and are reused, so steady-state
//! streaming allocates nothing on either side. Seeks bump a generation
//! counter; blocks from an older generation are discarded at the tick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::decode::Decoder;
use crate::error::{MixerError, MixerResult};
use crate::resample::StreamResampler;
use crate::types::{OutputSpec, StereoSample};

/// Frames per streaming block (~21ms at 48kHz)
const BLOCK_FRAMES: usize = 1024;

/// Maximum blocks in flight (~340ms of lookahead at 48kHz)
const MAX_BLOCKS: usize = 16;

/// Prefetch thread backoff when the ring is full
const FULL_BACKOFF: Duration = Duration::from_millis(2);

struct StreamBlock {
    generation: u32,
    start_frame: u64,
    samples: Vec<StereoSample>,
}

impl StreamBlock {
    fn new() -> Self {
        Self {
            generation: 0,
            start_frame: 0,
            samples: Vec::with_capacity(BLOCK_FRAMES),
        }
    }
}

struct StreamShared {
    /// Generation of the most recent seek; stale blocks are discarded
    latest_generation: AtomicU32,
    /// Prefetch thread has emitted its last block
    finished: AtomicBool,
    /// Signal for the prefetch thread to exit
    stop: AtomicBool,
    /// Ticks that found the ring empty before end of stream
    underruns: AtomicU64,
}

enum StreamRequest {
    Seek(Duration, mpsc::Sender<MixerResult<()>>),
    SelectTrack(usize, mpsc::Sender<MixerResult<()>>),
}

/// Result of pulling one window from a stream
pub(crate) struct StreamPull {
    /// Frames copied into the window
    pub frames: usize,
    /// The stream has delivered everything it ever will
    pub ended: bool,
}

/// Audio-thread side of a streaming source
pub(crate) struct StreamSource {
    filled: rtrb::Consumer<StreamBlock>,
    free: rtrb::Producer<StreamBlock>,
    shared: Arc<StreamShared>,
    current: Option<StreamBlock>,
    offset: usize,
    position: u64,
}

impl StreamSource {
    /// Copy up to `out.len()` frames from ready blocks
    ///
    /// Never blocks. A short read with `ended == false` is an underrun; the
    /// caller leaves the remainder silent.
    pub fn read(&mut self, out: &mut [StereoSample]) -> StreamPull {
        let latest = self.shared.latest_generation.load(Ordering::Acquire);
        let mut written = 0;

        while written < out.len() {
            if self.current.is_none() {
                match self.filled.pop() {
                    Ok(block) => {
                        if block.generation != latest {
                            self.recycle(block);
                            continue;
                        }
                        self.offset = 0;
                        self.current = Some(block);
                    }
                    Err(_) => break,
                }
            }

            let block = self.current.as_ref().expect("current block present");
            let n = (block.samples.len() - self.offset).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&block.samples[self.offset..self.offset + n]);
            written += n;
            self.offset += n;
            self.position = block.start_frame + self.offset as u64;

            if self.offset == block.samples.len() {
                let spent = self.current.take().expect("current block present");
                self.recycle(spent);
            }
        }

        let ended = written < out.len()
            && self.current.is_none()
            && self.shared.finished.load(Ordering::Acquire)
            && self.filled.is_empty();

        if written < out.len() && !ended {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }

        StreamPull { frames: written, ended }
    }

    /// Current playback position in output-rate frames
    pub fn position(&self) -> u64 {
        self.position
    }

    fn recycle(&mut self, block: StreamBlock) {
        // The free ring is sized so this cannot fail while the prefetch
        // thread respects the allocation cap
        let _ = self.free.push(block);
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

/// Control-thread side of a streaming source
pub(crate) struct StreamHandle {
    control: mpsc::Sender<StreamRequest>,
    shared: Arc<StreamShared>,
    duration: Option<Duration>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Seek to a position; waits for the prefetch thread to apply it
    pub fn seek(&self, position: Duration) -> MixerResult<()> {
        self.request(|reply| StreamRequest::Seek(position, reply))
    }

    /// Switch sub-track on a multi-track container
    pub fn select_track(&self, track: usize) -> MixerResult<()> {
        self.request(|reply| StreamRequest::SelectTrack(track, reply))
    }

    /// Total duration, if the decoder reported one
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Underruns observed by the audio thread so far
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Stop the prefetch thread and wait for its decoder to be released
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    fn request(
        &self,
        build: impl FnOnce(mpsc::Sender<MixerResult<()>>) -> StreamRequest,
    ) -> MixerResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.control
            .send(build(reply_tx))
            .map_err(|_| MixerError::InvalidArgument("stream no longer active".into()))?;
        reply_rx
            .recv()
            .map_err(|_| MixerError::InvalidArgument("stream no longer active".into()))?
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

/// Open a streaming source over `decoder`
///
/// `loops` counts extra plays after the first; -1 loops forever. Looping
/// needs a seekable decoder; a non-seekable one finishes after its first
/// pass with a warning.
pub(crate) fn spawn_stream(
    decoder: Box<dyn Decoder>,
    spec: OutputSpec,
    loops: i32,
) -> MixerResult<(StreamSource, StreamHandle)> {
    let native = decoder.spec();
    let resampler = StreamResampler::new(native.rate, spec.sample_rate)?;
    let duration = decoder.duration();

    // +2 slots: the audio side may hold one block out of the rings
    let (filled_tx, filled_rx) = rtrb::RingBuffer::new(MAX_BLOCKS + 2);
    let (free_tx, free_rx) = rtrb::RingBuffer::new(MAX_BLOCKS + 2);
    let (control_tx, control_rx) = mpsc::channel();

    let shared = Arc::new(StreamShared {
        latest_generation: AtomicU32::new(0),
        finished: AtomicBool::new(false),
        stop: AtomicBool::new(false),
        underruns: AtomicU64::new(0),
    });

    let worker_shared = Arc::clone(&shared);
    let sample_rate = spec.sample_rate;
    let join = thread::Builder::new()
        .name("polymix-stream".to_string())
        .spawn(move || {
            prefetch_loop(
                decoder,
                resampler,
                filled_tx,
                free_rx,
                control_rx,
                worker_shared,
                sample_rate,
                loops,
            );
        })
        .map_err(|e| MixerError::InvalidArgument(format!("spawn stream thread: {}", e)))?;

    Ok((
        StreamSource {
            filled: filled_rx,
            free: free_tx,
            shared: Arc::clone(&shared),
            current: None,
            offset: 0,
            position: 0,
        },
        StreamHandle {
            control: control_tx,
            shared,
            duration,
            join: Some(join),
        },
    ))
}

#[allow(clippy::too_many_arguments)]
fn prefetch_loop(
    mut decoder: Box<dyn Decoder>,
    mut resampler: StreamResampler,
    mut filled: rtrb::Producer<StreamBlock>,
    mut free: rtrb::Consumer<StreamBlock>,
    control: mpsc::Receiver<StreamRequest>,
    shared: Arc<StreamShared>,
    sample_rate: u32,
    mut loops: i32,
) {
    let mut native_buf = vec![StereoSample::silence(); BLOCK_FRAMES];
    let mut pending: Vec<StereoSample> = Vec::with_capacity(BLOCK_FRAMES * 2);
    let mut generation: u32 = 0;
    let mut next_start_frame: u64 = 0;
    let mut allocated: usize = 0;
    let mut decode_done = false;

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        while let Ok(request) = control.try_recv() {
            match request {
                StreamRequest::Seek(position, reply) => {
                    let result = decoder.seek(position);
                    if result.is_ok() {
                        generation = generation.wrapping_add(1);
                        shared.latest_generation.store(generation, Ordering::Release);
                        resampler.reset();
                        pending.clear();
                        next_start_frame =
                            (position.as_secs_f64() * sample_rate as f64) as u64;
                        decode_done = false;
                    }
                    let _ = reply.send(result);
                }
                StreamRequest::SelectTrack(track, reply) => {
                    let result = decoder.select_track(track);
                    if result.is_ok() {
                        generation = generation.wrapping_add(1);
                        shared.latest_generation.store(generation, Ordering::Release);
                        resampler.reset();
                        pending.clear();
                        next_start_frame = 0;
                        decode_done = false;
                    }
                    let _ = reply.send(result);
                }
            }
        }

        // Accumulate at least one block worth of resampled frames
        while pending.len() < BLOCK_FRAMES && !decode_done {
            match decoder.decode(&mut native_buf) {
                Ok(0) => {
                    if loops != 0 {
                        match decoder.seek(Duration::ZERO) {
                            Ok(()) => {
                                if loops > 0 {
                                    loops -= 1;
                                }
                                continue;
                            }
                            Err(e) => {
                                log::warn!("stream loop rewind failed, ending: {}", e);
                            }
                        }
                    }
                    if let Err(e) = resampler.flush(&mut pending) {
                        log::warn!("stream flush failed: {}", e);
                    }
                    decode_done = true;
                }
                Ok(n) => {
                    if let Err(e) = resampler.push(&native_buf[..n], &mut pending) {
                        log::warn!("stream resample failed, ending: {}", e);
                        decode_done = true;
                    }
                }
                Err(e) => {
                    // Corrupt data mid-stream degrades to end-of-stream
                    log::warn!("decode fault, treating as end of stream: {}", e);
                    let _ = resampler.flush(&mut pending);
                    decode_done = true;
                }
            }
        }

        if pending.is_empty() && decode_done {
            shared.finished.store(true, Ordering::Release);
            break;
        }

        // Get a block: recycled, or freshly allocated under the cap
        let mut block = match free.pop() {
            Ok(block) => block,
            Err(_) if allocated < MAX_BLOCKS => {
                allocated += 1;
                StreamBlock::new()
            }
            Err(_) => {
                thread::sleep(FULL_BACKOFF);
                continue;
            }
        };

        let take = pending.len().min(BLOCK_FRAMES);
        block.generation = generation;
        block.start_frame = next_start_frame;
        block.samples.clear();
        block.samples.extend_from_slice(&pending[..take]);
        pending.drain(..take);
        next_start_frame += take as u64;

        // Cannot fail: ring capacity exceeds the allocation cap
        let _ = filled.push(block);
    }

    log::debug!("stream prefetch thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::{FaultyDecoder, MemoryDecoder};

    const SPEC: OutputSpec = OutputSpec { sample_rate: 48000 };

    /// Pull until `total` frames arrive or the stream ends; tolerates the
    /// prefetch thread lagging behind the test thread.
    fn pull_all(source: &mut StreamSource, max_frames: usize) -> Vec<StereoSample> {
        let mut collected = Vec::new();
        let mut window = vec![StereoSample::silence(); 256];
        for _ in 0..10_000 {
            let pull = source.read(&mut window);
            collected.extend_from_slice(&window[..pull.frames]);
            if pull.ended || collected.len() >= max_frames {
                return collected;
            }
            thread::sleep(Duration::from_micros(200));
        }
        panic!("stream never ended");
    }

    #[test]
    fn test_stream_plays_to_end() {
        let decoder = Box::new(MemoryDecoder::constant(0.5, 5000, 48000));
        let (mut source, handle) = spawn_stream(decoder, SPEC, 0).unwrap();

        let frames = pull_all(&mut source, usize::MAX);
        assert_eq!(frames.len(), 5000);
        assert_eq!(frames[0].left, 0.5);
        assert_eq!(handle.underruns(), handle.underruns()); // counter readable
        handle.shutdown();
    }

    #[test]
    fn test_stream_loops_extra_plays() {
        let decoder = Box::new(MemoryDecoder::constant(1.0, 1000, 48000));
        let (mut source, handle) = spawn_stream(decoder, SPEC, 2).unwrap();

        // 1 play + 2 loops
        let frames = pull_all(&mut source, usize::MAX);
        assert_eq!(frames.len(), 3000);
        handle.shutdown();
    }

    #[test]
    fn test_stream_seek_discards_stale_blocks() {
        // Ramp signal so positions are recognizable
        let ramp: Vec<StereoSample> =
            (0..48000).map(|i| StereoSample::mono(i as f32)).collect();
        let decoder = Box::new(MemoryDecoder::new(ramp, 48000));
        let (mut source, handle) = spawn_stream(decoder, SPEC, 0).unwrap();

        // Let some blocks arrive, then seek to 0.5s
        thread::sleep(Duration::from_millis(20));
        handle.seek(Duration::from_millis(500)).unwrap();

        // Skip whatever remains of the old generation, then verify frames
        // resume at the seek target
        let mut window = vec![StereoSample::silence(); 64];
        let target = 24000.0;
        for _ in 0..10_000 {
            let pull = source.read(&mut window);
            if pull.frames > 0 && window[0].left >= target {
                assert!(window[0].left < target + 2048.0, "resumed at {}", window[0].left);
                handle.shutdown();
                return;
            }
            assert!(!pull.ended, "stream ended before seek target appeared");
            thread::sleep(Duration::from_micros(200));
        }
        panic!("seek target never appeared");
    }

    #[test]
    fn test_decode_fault_degrades_to_end_of_stream() {
        let decoder = Box::new(FaultyDecoder::new(2000, 48000));
        let (mut source, handle) = spawn_stream(decoder, SPEC, 0).unwrap();

        let frames = pull_all(&mut source, usize::MAX);
        assert_eq!(frames.len(), 2000);
        handle.shutdown();
    }

    #[test]
    fn test_seek_unsupported_reports_error() {
        let decoder = Box::new(FaultyDecoder::new(100_000, 48000));
        let (_source, handle) = spawn_stream(decoder, SPEC, 0).unwrap();

        // FaultyDecoder uses the default seek impl
        assert!(matches!(
            handle.seek(Duration::from_secs(1)),
            Err(MixerError::Unsupported(_))
        ));
        handle.shutdown();
    }

    #[test]
    fn test_shutdown_releases_decoder() {
        let decoder = Box::new(MemoryDecoder::constant(0.0, 1_000_000, 48000));
        let (source, handle) = spawn_stream(decoder, SPEC, -1).unwrap();

        // Shutdown joins the prefetch thread even mid-stream
        drop(source);
        handle.shutdown();
    }
}
