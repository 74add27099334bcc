// src/media/binder.rs - Output media handles and the ring buffer consumer
//
// Core features:
// - One `Media` per declared output rendition, typed once the input format is known
// - One binder thread per channel: sole consumer of the channel's ring buffer
// - Lossy fan-out: a full output queue drops the chunk for that output only
// - Outputs declared after attachment join the live binding
// - The binder parks while the ring is empty; the producer side unparks it after a put

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};
use ringbuf::traits::Consumer;

use crate::error::{Error, Result};
use crate::media::{Conversion, MediaType, OutputFamily, RingConsumer};

const BINDER_CHUNK_SIZE: usize = 64 * 1024;

const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

/// Output media object for one rendition.
///
/// The downstream transcoder reads chunks through [`Media::subscribe`].
pub struct Media {
    url: String,
    family: OutputFamily,
    source: MediaType,
    output: MediaType,
    conversion: Option<Conversion>,
    sender: Sender<Bytes>,
    receiver: Receiver<Bytes>,
}

impl Media {
    /// Creates an untyped media object with a bounded chunk queue.
    pub fn create(source: MediaType, output: MediaType, queue_depth: usize) -> Media {
        let (sender, receiver) = crossbeam_channel::bounded(queue_depth.max(1));
        let family = match output {
            MediaType::Ts => OutputFamily::Ts,
            _ => OutputFamily::Flv,
        };
        Media {
            url: String::new(),
            family,
            source,
            output,
            conversion: Conversion::between(source, output),
            sender,
            receiver,
        }
    }

    /// Creates the media object an output URL asks for.
    pub fn for_output(url: &str, queue_depth: usize) -> Result<Media> {
        let family = OutputFamily::classify(url)?;
        let mut media = Media::create(MediaType::Unknown, family.media_type(), queue_depth);
        media.url = url.to_string();
        media.family = family;
        Ok(media)
    }

    /// Fixes the conversion and source container once the input is sniffed.
    pub fn set_types(&mut self, conversion: Conversion, source: MediaType) {
        self.conversion = Some(conversion);
        self.source = source;
    }

    /// Types this media for `source` input, if the combination is known.
    pub(crate) fn bind_source(&mut self, source: MediaType) {
        if let Some(conversion) = Conversion::between(source, self.output) {
            self.set_types(conversion, source);
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn family(&self) -> OutputFamily {
        self.family
    }

    pub fn source(&self) -> MediaType {
        self.source
    }

    pub fn output(&self) -> MediaType {
        self.output
    }

    pub fn conversion(&self) -> Option<Conversion> {
        self.conversion
    }

    /// Receiver for the chunks fanned out to this output.
    pub fn subscribe(&self) -> Receiver<Bytes> {
        self.receiver.clone()
    }

    pub(crate) fn sender(&self) -> Sender<Bytes> {
        self.sender.clone()
    }
}

/// Live attachment of a ring buffer to its outputs.
///
/// Dropping the binding stops and joins the consumer thread.
pub struct Binding {
    targets: Arc<Mutex<Vec<Sender<Bytes>>>>,
    status: Arc<AtomicUsize>,
    dropped_chunks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Binding {
    /// Moves `consumer` onto a binder thread that fans it out to every target.
    ///
    /// `idle` bounds how long the thread parks on an empty ring without a
    /// [`notify`](Self::notify).
    pub fn attach(
        channel_name: &str,
        mut consumer: RingConsumer,
        targets: Vec<Sender<Bytes>>,
        idle: Duration,
    ) -> Result<Binding> {
        let targets = Arc::new(Mutex::new(targets));
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let dropped_chunks = Arc::new(AtomicU64::new(0));

        let worker_targets = Arc::clone(&targets);
        let worker_status = Arc::clone(&status);
        let worker_dropped = Arc::clone(&dropped_chunks);
        let name = channel_name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("relay-binder-{}", channel_name))
            .spawn(move || {
                drain_buffer(
                    &name,
                    &mut consumer,
                    &worker_targets,
                    &worker_status,
                    &worker_dropped,
                    idle,
                )
            })
            .map_err(Error::BinderSpawn)?;

        info!("Channel {} attached to its outputs", channel_name);

        Ok(Binding {
            targets,
            status,
            dropped_chunks,
            handle: Some(handle),
        })
    }

    /// Wakes the binder after new bytes were put into the ring.
    pub fn notify(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Adds an output to the running fan-out.
    pub fn add_target(&self, target: Sender<Bytes>) {
        self.targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(target);
    }

    pub fn target_count(&self) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Chunks dropped because an output queue was full
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.status.store(STATUS_END, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Media binder thread panicked");
            }
        }
    }
}

fn drain_buffer(
    channel_name: &str,
    consumer: &mut RingConsumer,
    targets: &Mutex<Vec<Sender<Bytes>>>,
    status: &AtomicUsize,
    dropped_chunks: &AtomicU64,
    idle: Duration,
) {
    let mut chunk = vec![0u8; BINDER_CHUNK_SIZE];

    while status.load(Ordering::Acquire) == STATUS_RUN {
        let n = consumer.pop_slice(&mut chunk);
        if n == 0 {
            std::thread::park_timeout(idle);
            continue;
        }

        let data = Bytes::copy_from_slice(&chunk[..n]);
        let mut targets = targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        targets.retain(|target| match target.try_send(data.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped_chunks.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Channel {} output went away, detaching it", channel_name);
                false
            }
        });
    }

    debug!("Media binder for channel {} stopped", channel_name);
}
