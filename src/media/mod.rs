//! Media types, output classification, and the bridge from the ingest ring
//! buffer to output renditions.
//!
//! The transcode graph itself (FLV <-> TS conversion) lives outside this crate.
//! What lives here is the wiring: a [`Media`] handle per declared output, typed
//! with the [`Conversion`] it needs once the input format is known, and a
//! [`Binding`] that drains a channel's ring buffer into every attached output.
//!
//! | Output URL | Family |
//! |------------|--------|
//! | contains `_flv` | FLV |
//! | starts with `rtmp:` | FLV |
//! | contains `_ts` | TS |
//! | contains `.m3u8` | TS (HLS reuses the TS container) |

pub mod binder;
pub mod ring_buffer;

pub use binder::{Binding, Media};
pub use ring_buffer::{byte_ring, ByteSink, RingConsumer, RingProducer};

use std::fmt;

use crate::error::{Error, Result};

/// Container format of an input or output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    #[default]
    Unknown,
    Flv,
    Ts,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Unknown => write!(f, "unknown"),
            MediaType::Flv => write!(f, "FLV"),
            MediaType::Ts => write!(f, "MPEGTS"),
        }
    }
}

/// Conversion an output transcoder performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    TsToFlv,
    TsToTs,
    FlvToFlv,
    FlvToTs,
}

impl Conversion {
    /// Conversion from `source` into `target`, if both are known.
    pub fn between(source: MediaType, target: MediaType) -> Option<Conversion> {
        match (source, target) {
            (MediaType::Ts, MediaType::Flv) => Some(Conversion::TsToFlv),
            (MediaType::Ts, MediaType::Ts) => Some(Conversion::TsToTs),
            (MediaType::Flv, MediaType::Flv) => Some(Conversion::FlvToFlv),
            (MediaType::Flv, MediaType::Ts) => Some(Conversion::FlvToTs),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Conversion::TsToTs | Conversion::FlvToFlv)
    }
}

/// Output rendition family, decided from the output URL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFamily {
    /// HTTP-FLV and RTMP push
    Flv,
    /// HTTP-TS and HLS
    Ts,
}

impl OutputFamily {
    /// Classifies an output URL. The first matching rule wins.
    pub fn classify(url: &str) -> Result<OutputFamily> {
        if url.contains("_flv") || url.starts_with("rtmp:") {
            Ok(OutputFamily::Flv)
        } else if url.contains("_ts") || url.contains(".m3u8") {
            Ok(OutputFamily::Ts)
        } else {
            Err(Error::UnsupportedOutput(url.to_string()))
        }
    }

    /// Container this family produces.
    pub fn media_type(&self) -> MediaType {
        match self {
            OutputFamily::Flv => MediaType::Flv,
            OutputFamily::Ts => MediaType::Ts,
        }
    }
}
