//! Startup checks: the golden-nonce test and work-division detection.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;

use super::reply::{ReadOutcome, ReplyReader};
use crate::config::{DeviceConfig, DeviceVariant, WorkDivision, NONCE_SIZE, TICK};
use crate::serial::LinkStream;
use crate::tracing::prelude::*;

/// Ticks allowed for a probe reply. The golden jobs finish in well under a
/// millisecond.
const PROBE_TICKS: u32 = 10;

// Block 171874, nonce 0x000187a2.
const ICARUS_GOLDEN: &str = "4679ba4ec99876bf4bfe086082b400254df6c356451471139a3afa71e48f544a000000000000000000000000000000000000000087320b1a1426674f2fa722ce";
const DUAL_SHA256_GOLDEN: &str = "55aa0f00a08701004a548fe471fa3a9a1371144556c3f64d2500b4826008fe4bbf7698c94eba7946ce22a72f4f6726141a0b3287";
const DUAL_SCRYPT_GOLDEN: &str = "55aa1f00000000000000000000000000000000000000000000000000aaaaaaaa711c0000603ebdb6e35b05223c54f8155ac33123006b4192e7aafafbeb9ef6544d2973d700000002069b9f9e3ce8a6778dea3d7a00926cd6eaa9585502c9b83a5601f198d7fbf09be9559d6335ebad363e4f147a8d9934006963030b4e54c408c837ebc2eeac129852a55fee1b1d88f6000c050000000600";

const SHA256_GOLDEN_NONCE: u32 = 0x0001_87a2;
const SCRYPT_GOLDEN_NONCE: u32 = 0x0005_0cdd;

/// Job whose reply identifies how many chips split the nonce space.
const DIVISION_PROBE: [u8; 64] = *b"\x2e\x4c\x8f\x91\xfd\x59\x5d\x2d\x7e\xa2\x0a\xaa\xcb\x64\xa2\xa0\
\x43\x82\x86\x02\x77\xcf\x26\xb6\xa1\xee\x04\xc5\x6a\x5b\x50\x4a\
BFGMiner Probe\0\0\
BFG\0\x64\x61\x01\x1a\xc9\x06\xa9\x51\xfb\x9b\x3c\x73";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no reply to the golden job")]
    NoReply,

    #[error("golden nonce mismatch: got {got:08x}, expected {expected:08x}")]
    WrongNonce { got: u32, expected: u32 },

    #[error("reply is {got} bytes, expected {expected}")]
    ReplySize { expected: usize, got: usize },

    #[error("link error during probe: {0}")]
    Io(#[from] io::Error),
}

/// The golden job for `variant` and the nonce it must produce.
pub fn golden_job(variant: DeviceVariant) -> (Vec<u8>, u32) {
    let (frame, nonce) = match variant {
        DeviceVariant::Icarus | DeviceVariant::Cairnsmore => (ICARUS_GOLDEN, SHA256_GOLDEN_NONCE),
        DeviceVariant::DualSha256 => (DUAL_SHA256_GOLDEN, SHA256_GOLDEN_NONCE),
        DeviceVariant::DualScrypt => (DUAL_SCRYPT_GOLDEN, SCRYPT_GOLDEN_NONCE),
    };
    let mut bytes = hex::decode(frame).unwrap_or_default();
    bytes.resize(variant.frame_layout().len(), 0);
    (bytes, nonce)
}

/// Send the golden job and check both the nonce and the reply length.
///
/// Exactly four nonce bytes are read first, then whatever follows; a device
/// configured with the wrong `reply_size` fails here rather than later.
pub async fn detect(link: &mut dyn LinkStream, config: &DeviceConfig) -> Result<(), ProbeError> {
    let (frame, expected) = golden_job(config.variant);
    link.write_all(&frame).await?;
    link.flush().await?;

    let mut reader = ReplyReader::new();
    let nonce = match reader.read_reply(link, NONCE_SIZE, PROBE_TICKS, None).await {
        ReadOutcome::Reply { frame, .. } => config.variant.nonce_order().decode(&frame),
        ReadOutcome::LinkError(e) => return Err(e.into()),
        ReadOutcome::Timeout { .. } | ReadOutcome::Restarted { .. } => None,
    }
    .ok_or(ProbeError::NoReply)?;

    if nonce != expected {
        return Err(ProbeError::WrongNonce {
            got: nonce,
            expected,
        });
    }

    let excess = config.reply_size - NONCE_SIZE;
    let extra = drain(link, excess + 1, TICK).await?;
    if extra != excess {
        return Err(ProbeError::ReplySize {
            expected: config.reply_size,
            got: NONCE_SIZE + extra,
        });
    }

    debug!(variant = %config.variant, nonce = %format_args!("{nonce:08x}"), "Golden nonce test passed.");
    Ok(())
}

// Read up to `limit` bytes, stopping once the link has been quiet for `quiet`.
async fn drain(link: &mut dyn LinkStream, limit: usize, quiet: Duration) -> io::Result<usize> {
    let mut buf = vec![0u8; limit];
    let mut got = 0;
    while got < limit {
        match time::timeout(quiet, link.read(&mut buf[got..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => got += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(got)
}

/// Map a probe reply to the work division that produces it.
pub fn division_for_reply(nonce: u32) -> Option<WorkDivision> {
    let division = match nonce {
        0x04c0_fdb4 => 1,
        0x8254_0e46 => 2,
        0x417c_0f36 => 4,
        0x60c9_94d5 => 8,
        _ => return None,
    };
    WorkDivision::try_from(division).ok()
}

/// Ask the device how its nonce space is split.
///
/// Falls back to two when the answer is missing or unknown.
pub async fn probe_work_division(link: &mut dyn LinkStream, reply_size: usize) -> WorkDivision {
    let attempt = async {
        link.write_all(&DIVISION_PROBE).await?;
        link.flush().await?;
        let mut reader = ReplyReader::new();
        match reader.read_reply(&mut *link, reply_size, PROBE_TICKS, None).await {
            ReadOutcome::Reply { frame, .. } => Ok(Some(u32::from_be_bytes([
                frame[0], frame[1], frame[2], frame[3],
            ]))),
            ReadOutcome::LinkError(e) => Err(e),
            _ => Ok(None),
        }
    };

    match attempt.await {
        Ok(Some(nonce)) => match division_for_reply(nonce) {
            Some(division) => {
                debug!(%division, "Detected work division.");
                division
            }
            None => {
                error!(reply = %format_args!("{nonce:08x}"), "Unknown work division reply, assuming 2.");
                WorkDivision::TWO
            }
        },
        Ok(None) => {
            error!("No reply to work division probe, assuming 2.");
            WorkDivision::TWO
        }
        Err(e) => {
            error!(error = %e, "Work division probe failed, assuming 2.");
            WorkDivision::TWO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icarus::codec::FrameLayout;
    use test_case::test_case;

    async fn answer(device: &mut tokio::io::DuplexStream, expect_len: usize, reply: &[u8]) {
        let mut job = vec![0u8; expect_len];
        device.read_exact(&mut job).await.unwrap();
        device.write_all(reply).await.unwrap();
    }

    #[test_case(DeviceVariant::Icarus, FrameLayout::Icarus64)]
    #[test_case(DeviceVariant::DualSha256, FrameLayout::Compact52)]
    #[test_case(DeviceVariant::DualScrypt, FrameLayout::Scrypt160)]
    fn golden_jobs_fill_their_layout(variant: DeviceVariant, layout: FrameLayout) {
        let (frame, _) = golden_job(variant);
        assert_eq!(frame.len(), layout.len());
        assert_ne!(frame[0], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn icarus_golden_nonce() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let config = DeviceConfig::new(DeviceVariant::Icarus);

        let (detected, ()) = tokio::join!(
            detect(link.as_mut(), &config),
            answer(&mut device, 64, &[0x00, 0x01, 0x87, 0xa2])
        );
        detected.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dual_nonce_is_little_endian() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let config = DeviceConfig::new(DeviceVariant::DualScrypt);

        let (detected, ()) = tokio::join!(
            detect(link.as_mut(), &config),
            answer(&mut device, 160, &[0xdd, 0x0c, 0x05, 0x00])
        );
        detected.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_nonce_fails() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let config = DeviceConfig::new(DeviceVariant::Icarus);

        let (detected, ()) = tokio::join!(
            detect(link.as_mut(), &config),
            answer(&mut device, 64, &[0xa2, 0x87, 0x01, 0x00])
        );
        assert!(matches!(detected, Err(ProbeError::WrongNonce { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn excess_bytes_fail() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let config = DeviceConfig::new(DeviceVariant::Icarus);

        let (detected, ()) = tokio::join!(
            detect(link.as_mut(), &config),
            answer(&mut device, 64, &[0x00, 0x01, 0x87, 0xa2, 0x00, 0x00])
        );
        match detected {
            Err(ProbeError::ReplySize { expected, got }) => {
                assert_eq!(expected, 4);
                assert_eq!(got, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_fails() {
        let (_device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let config = DeviceConfig::new(DeviceVariant::Icarus);
        assert!(matches!(
            detect(link.as_mut(), &config).await,
            Err(ProbeError::NoReply)
        ));
    }

    #[test_case(0x04c0_fdb4, Some(1))]
    #[test_case(0x8254_0e46, Some(2))]
    #[test_case(0x417c_0f36, Some(4))]
    #[test_case(0x60c9_94d5, Some(8))]
    #[test_case(0xdead_beef, None)]
    fn division_replies(reply: u32, division: Option<u32>) {
        assert_eq!(division_for_reply(reply).map(WorkDivision::get), division);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_reads_division() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        let reply = 0x417c_0f36u32.to_be_bytes();

        let (division, ()) = tokio::join!(
            probe_work_division(link.as_mut(), 4),
            answer(&mut device, 64, &reply)
        );
        assert_eq!(division.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_defaults_to_two() {
        let (_device, host) = tokio::io::duplex(256);
        let mut link: Box<dyn LinkStream> = Box::new(host);
        assert_eq!(probe_work_division(link.as_mut(), 4).await, WorkDivision::TWO);
    }
}
