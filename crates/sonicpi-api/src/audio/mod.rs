//! Audio-to-spectrum pipeline.
//!
//! The audio producer calls [`AudioPipeline::feed`] with interleaved stereo
//! samples. A worker thread turns each frame into a [`ProcessedAudio`]
//! snapshot and publishes it for the host.
//!
//! # Handoff
//!
//! `feed` never blocks and never allocates: it copies into one of a fixed set
//! of input buffers that circulate between the producer and the worker over
//! bounded channels. When the worker falls behind, the oldest pending frame is
//! reclaimed and overwritten.
//!
//! # Snapshot discipline
//!
//! [`AudioPipeline::latest`] returns the most recent snapshot as an
//! `Arc<ProcessedAudio>`. A snapshot is immutable and stays valid for as long
//! as the host holds it. A newer snapshot replaces an unacknowledged one
//! (overwrite, never hold). [`AudioPipeline::acknowledge_consumed`] retires
//! the current snapshot; `latest` then returns `None` until the next one is
//! published. Snapshot storage comes from a fixed pool and is recycled once
//! the host has dropped every reference to it; if the host holds on to the
//! whole pool, new frames are dropped rather than allocating more.

mod spectrum;

pub use spectrum::{quantize, SpectrumAnalyzer};

use crate::client::ApiClient;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

const INPUT_BUFFERS: usize = 3;
const SNAPSHOT_POOL: usize = 4;

/// One processed audio frame.
///
/// `samples` and `mono_samples` are always filled. The spectra are empty when
/// spectrum generation is disabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedAudio {
    /// Left and right channel samples.
    pub samples: [Vec<f32>; 2],
    /// Full-resolution magnitude spectrum per channel.
    pub spectrum: [Vec<f32>; 2],
    /// Log-bucketed spectrum per channel, at most `max_buckets` long.
    pub spectrum_quantized: [Vec<f32>; 2],
    /// Average of both channels.
    pub mono_samples: Vec<f32>,
}

impl ProcessedAudio {
    /// Preallocate storage for `frame_size` samples per channel and up to
    /// `bucket_capacity` buckets.
    pub fn with_capacity(frame_size: usize, bucket_capacity: usize) -> Self {
        let bins = frame_size / 2;
        Self {
            samples: [Vec::with_capacity(frame_size), Vec::with_capacity(frame_size)],
            spectrum: [Vec::with_capacity(bins), Vec::with_capacity(bins)],
            spectrum_quantized: [
                Vec::with_capacity(bucket_capacity),
                Vec::with_capacity(bucket_capacity),
            ],
            mono_samples: Vec::with_capacity(frame_size),
        }
    }

    /// Number of frames in this snapshot.
    pub fn frames(&self) -> usize {
        self.mono_samples.len()
    }
}

/// Shared configuration, read by the worker for every frame.
struct Config {
    enabled: AtomicBool,
    spectrum: AtomicBool,
    max_buckets: AtomicUsize,
}

/// Audio processing pipeline with its own worker thread.
pub struct AudioPipeline {
    config: Arc<Config>,
    frame_size: usize,
    free_rx: Receiver<Vec<f32>>,
    filled_tx: Sender<Vec<f32>>,
    filled_rx: Receiver<Vec<f32>>,
    published: Arc<Mutex<Option<Arc<ProcessedAudio>>>>,
    dropped: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioPipeline {
    /// Create a pipeline analysing `frame_size` samples per channel and
    /// start its worker. Processing is disabled until [`AudioPipeline::enable`].
    pub fn new(frame_size: usize, max_buckets: usize, client: Option<Arc<dyn ApiClient>>) -> Self {
        let frame_size = frame_size.max(2);
        let config = Arc::new(Config {
            enabled: AtomicBool::new(false),
            spectrum: AtomicBool::new(false),
            max_buckets: AtomicUsize::new(max_buckets),
        });

        let (free_tx, free_rx) = bounded(INPUT_BUFFERS);
        let (filled_tx, filled_rx) = bounded(INPUT_BUFFERS);
        for _ in 0..INPUT_BUFFERS {
            let _ = free_tx.try_send(Vec::with_capacity(frame_size * 2));
        }

        let published = Arc::new(Mutex::new(None));
        let dropped = Arc::new(AtomicU64::new(0));
        let processed = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = bounded(0);

        let worker = Worker {
            config: Arc::clone(&config),
            analyzer: SpectrumAnalyzer::new(frame_size),
            pool: (0..SNAPSHOT_POOL)
                .map(|_| Arc::new(ProcessedAudio::with_capacity(frame_size, frame_size / 2)))
                .collect(),
            published: Arc::clone(&published),
            dropped: Arc::clone(&dropped),
            processed: Arc::clone(&processed),
            client,
        };
        let worker_filled_rx = filled_rx.clone();
        let handle = thread::Builder::new()
            .name("audio-pipeline".to_string())
            .spawn(move || worker.run(worker_filled_rx, free_tx, stop_rx));
        let worker = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("[AUDIO] Failed to start audio worker: {}", e);
                None
            }
        };

        Self {
            config,
            frame_size,
            free_rx,
            filled_tx,
            filled_rx,
            published,
            dropped,
            processed,
            stop_tx: Some(stop_tx),
            worker,
        }
    }

    /// Turn processing on or off. Disabling also retires the current snapshot.
    pub fn enable(&self, enable: bool) {
        self.config.enabled.store(enable, Ordering::Release);
        if !enable {
            self.lock_published().take();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled.load(Ordering::Acquire)
    }

    /// Turn spectrum generation on or off for subsequent frames.
    pub fn enable_spectrum(&self, enable: bool) {
        self.config.spectrum.store(enable, Ordering::Release);
    }

    /// Set the maximum number of quantized buckets for subsequent frames.
    pub fn set_max_buckets(&self, buckets: usize) {
        self.config.max_buckets.store(buckets, Ordering::Release);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Hand new interleaved stereo samples to the pipeline.
    ///
    /// Only the last `frame_size` frames are kept. Never blocks.
    pub fn feed(&self, interleaved: &[f32]) {
        let usable = interleaved.len() - interleaved.len() % 2;
        if usable == 0 || !self.is_enabled() {
            return;
        }

        let mut buf = match self.free_rx.try_recv() {
            Ok(buf) => buf,
            Err(_) => match self.filled_rx.try_recv() {
                Ok(stale) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    stale
                }
                // Worker holds every buffer right now.
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

        let keep = usable.min(self.frame_size * 2);
        buf.clear();
        buf.extend_from_slice(&interleaved[usable - keep..usable]);

        if self.filled_tx.try_send(buf).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Most recent unacknowledged snapshot, if any. Never blocks on the
    /// producer.
    pub fn latest(&self) -> Option<Arc<ProcessedAudio>> {
        if !self.is_enabled() {
            return None;
        }
        self.lock_published().clone()
    }

    /// The host is done with the current snapshot; its storage may be reused.
    pub fn acknowledge_consumed(&self) {
        self.lock_published().take();
    }

    /// Frames dropped because the worker was behind or the snapshot pool was
    /// exhausted.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshots published so far.
    pub fn processed_frames(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Stop and join the worker. Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[AUDIO] Audio worker panicked");
            }
        }
        self.lock_published().take();
    }

    fn lock_published(&self) -> MutexGuard<'_, Option<Arc<ProcessedAudio>>> {
        match self.published.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    config: Arc<Config>,
    analyzer: SpectrumAnalyzer,
    pool: Vec<Arc<ProcessedAudio>>,
    published: Arc<Mutex<Option<Arc<ProcessedAudio>>>>,
    dropped: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
    client: Option<Arc<dyn ApiClient>>,
}

impl Worker {
    fn run(mut self, filled_rx: Receiver<Vec<f32>>, free_tx: Sender<Vec<f32>>, stop_rx: Receiver<()>) {
        loop {
            select! {
                recv(filled_rx) -> buf => {
                    let Ok(buf) = buf else { break };
                    self.process(&buf);
                    let _ = free_tx.try_send(buf);
                }
                recv(stop_rx) -> _ => break,
            }
        }
        log::debug!("[AUDIO] Worker stopped");
    }

    fn process(&mut self, interleaved: &[f32]) {
        if !self.config.enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(slot) = self.pool.iter_mut().position(|a| Arc::get_mut(a).is_some()) else {
            log::trace!("[AUDIO] Snapshot pool exhausted, dropping frame");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let with_spectrum = self.config.spectrum.load(Ordering::Acquire);
        let max_buckets = self.config.max_buckets.load(Ordering::Acquire);
        let Some(out) = Arc::get_mut(&mut self.pool[slot]) else {
            return;
        };

        let [left, right] = &mut out.samples;
        left.clear();
        right.clear();
        out.mono_samples.clear();
        for frame in interleaved.chunks_exact(2) {
            left.push(frame[0]);
            right.push(frame[1]);
            out.mono_samples.push((frame[0] + frame[1]) * 0.5);
        }

        for ch in 0..2 {
            if with_spectrum {
                self.analyzer.magnitudes(&out.samples[ch], &mut out.spectrum[ch]);
                quantize(&out.spectrum[ch], max_buckets, &mut out.spectrum_quantized[ch]);
            } else {
                out.spectrum[ch].clear();
                out.spectrum_quantized[ch].clear();
            }
        }

        let snapshot = Arc::clone(&self.pool[slot]);
        {
            let mut published = match self.published.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            *published = Some(Arc::clone(&snapshot));
        }
        self.processed.fetch_add(1, Ordering::Relaxed);

        if let Some(client) = &self.client {
            client.audio_data_available(&snapshot);
        }
    }
}
