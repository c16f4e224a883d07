//! Precomputed container initialization segments.
//!
//! A decoder needs the container's init bytes before it can interpret chunk
//! data. Waiting for the capture source to emit them costs one probe
//! interval, so for known container/codec pairs a canned init segment is
//! substituted instead and the source's own first chunk is discarded.

use crate::audio::capture::MimeType;
use base64::Engine;
use tracing::warn;

/// Init segments outside this range are anomalous for the webm/ogg codec
/// family and risk decode errors downstream.
pub const HEADER_MIN_BYTES: usize = 100;
pub const HEADER_MAX_BYTES: usize = 900;

/// Minimal EBML/webm init segment for an Opus audio track.
const WEBM_OPUS_INIT_SEGMENT: &str = "GkXfo59ChoEBQveBAULygQRC84EIQoKEd2VibUKHgQRChYECGFOAZwH/////////FUmpZpkq17GDD0JATYCGQ2hyb21lV0GGQ2hyb21lFlSua7+uvdeBAXPFh7o5nyc1kHqDgQKGhkFfT1BVU2Oik09wdXNIZWFkAQIAAIC7AAAAAADhjbWERzuAAJ+BAmJkgSAfQ7Z1Af/////////ngQCjjIEAAID/A//+//7//qM=";

/// Return the canned init segment for a mime type, if one exists.
pub fn precomputed(mime: &MimeType) -> Option<Vec<u8>> {
    if *mime == MimeType::WEBM_OPUS {
        base64::engine::general_purpose::STANDARD
            .decode(WEBM_OPUS_INIT_SEGMENT)
            .ok()
    } else {
        None
    }
}

/// Log a diagnostic when an init segment falls outside the expected size
/// range. The stream usually still decodes, so this never aborts.
pub fn check_header_size(len: usize) -> bool {
    if len < HEADER_MIN_BYTES || len > HEADER_MAX_BYTES {
        warn!(
            "Init segment is {} bytes (expected {}-{}); downstream decode \
             errors are more likely",
            len, HEADER_MIN_BYTES, HEADER_MAX_BYTES
        );
        return false;
    }
    true
}
