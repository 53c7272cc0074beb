//! Jobs and the two in-flight job slots.

use std::sync::Arc;

use bytes::Bytes;
use sha2::digest::generic_array::GenericArray;

/// Length of a serialized block header.
pub const HEADER_LEN: usize = 80;

const SHA256_IV: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

/// One unit of search work.
///
/// Fields are kept as the host handed them over; the codec checks their
/// lengths against the frame layout in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Host-assigned identifier, echoed back with candidates.
    pub id: u64,
    pub target: Bytes,
    /// SHA-256 state after the first 64 header bytes.
    pub midstate: Bytes,
    /// Full block header; nonce at bytes 76..80.
    pub header: Bytes,
}

impl Job {
    /// Build a job from a header, deriving the midstate.
    pub fn from_header(id: u64, header: [u8; HEADER_LEN], target: [u8; 32]) -> Self {
        Self {
            id,
            target: Bytes::copy_from_slice(&target),
            midstate: Bytes::copy_from_slice(&midstate(&header)),
            header: Bytes::copy_from_slice(&header),
        }
    }

    /// The twelve header bytes following the first SHA-256 block: the end of
    /// the merkle root, ntime and nbits.
    pub fn header_tail(&self) -> Option<&[u8]> {
        self.header.get(64..76)
    }

    /// Copy of the header with `nonce` written in place.
    pub fn header_with_nonce(&self, nonce: u32) -> Option<[u8; HEADER_LEN]> {
        let mut header: [u8; HEADER_LEN] = self.header.as_ref().try_into().ok()?;
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        Some(header)
    }
}

/// SHA-256 state after the first block of `header`, words little-endian.
pub fn midstate(header: &[u8; HEADER_LEN]) -> [u8; 32] {
    let mut state = SHA256_IV;
    let block = GenericArray::clone_from_slice(&header[..64]);
    sha2::compress256(&mut state, &[block]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// The current job and the one before it.
///
/// A reply can belong to either: the device may still be reporting on the
/// older job after the newer one was written.
#[derive(Debug, Default, Clone)]
pub struct JobSlots {
    current: Option<Arc<Job>>,
    previous: Option<Arc<Job>>,
}

impl JobSlots {
    pub fn current(&self) -> Option<&Arc<Job>> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Arc<Job>> {
        self.previous.as_ref()
    }

    /// Shift `current` into `previous` and install `job`, dropping the oldest.
    pub fn rotate(&mut self, job: Arc<Job>) {
        self.previous = self.current.replace(job);
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}
