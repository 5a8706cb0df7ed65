//! One request/response round-trip over a serial link.
//!
//! The sequence is: flush both buffers, honour the inter-frame gap, write
//! the frame, sleep an adaptive interval sized to the line rate, then read
//! progressively until the predicted frame length is satisfied or the
//! attempt deadline passes. Failed attempts retry with exponential backoff
//! and a widening deadline; an exception frame is a definitive answer and
//! never retries.

use std::thread;
use std::time::{Duration, Instant};

use crate::codec::format_hex;
use crate::codec::frame::{self, Response};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::SerialLink;

/// Per-iteration read granularity; sized for bursts from the driver.
const READ_CHUNK: usize = 256;
/// Pause between polls while no bytes are buffered.
const IDLE_POLL: Duration = Duration::from_millis(10);
/// Floor for the post-send settle interval before the first read.
const MIN_RESPONSE_WAIT: Duration = Duration::from_millis(100);
/// Ceiling for exponential backoff between attempts.
const MAX_RETRY_BACKOFF_SECS: f64 = 30.0;

/// Outbound timing bookkeeping for one port. The facade keeps this next to
/// the link under the same lock.
#[derive(Debug, Default)]
pub(crate) struct TimingState {
    last_send: Option<Instant>,
}

/// Run a full transaction including retries. Returns the parsed response
/// (normal or exception) or the error of the final attempt.
pub(crate) fn execute(
    link: &mut dyn SerialLink,
    timing: &mut TimingState,
    config: &ClientConfig,
    request: &[u8],
    expected_unit: u8,
    expected_function: u8,
) -> Result<Response> {
    let options = config.parse_options();
    let mut last_error: Option<Error> = None;

    for attempt in 0..=u32::from(config.retries) {
        if attempt > 0 {
            let backoff = Duration::from_secs_f64(
                (0.1 * 2f64.powi(attempt as i32 - 1)).min(MAX_RETRY_BACKOFF_SECS),
            );
            log::info!(
                "retry {attempt}/{} for unit {expected_unit}, function \
                 0x{expected_function:02X} after {backoff:?}",
                config.retries
            );
            thread::sleep(backoff);
        }
        // Each prior attempt widens the deadline by half.
        let attempt_timeout = config.timeout().mul_f64(1.5f64.powi(attempt as i32));

        match attempt_once(
            link,
            timing,
            config,
            request,
            expected_function,
            attempt,
            attempt_timeout,
        ) {
            Ok(buffer) => match frame::parse_response(
                &buffer,
                expected_unit,
                expected_function,
                &options,
            ) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retriable() => {
                    log::warn!(
                        "attempt {attempt} rejected: {err} (request {}, response {})",
                        format_hex(request),
                        format_hex(&buffer)
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            },
            Err(err) if err.is_retriable() => {
                log::warn!(
                    "attempt {attempt} failed: {err} (request {})",
                    format_hex(request)
                );
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(Error::Timeout {
        elapsed: Duration::ZERO,
    }))
}

/// Send one frame and collect one response buffer, without parsing it.
#[allow(clippy::too_many_arguments)]
fn attempt_once(
    link: &mut dyn SerialLink,
    timing: &mut TimingState,
    config: &ClientConfig,
    request: &[u8],
    expected_function: u8,
    attempt: u32,
    attempt_timeout: Duration,
) -> Result<Vec<u8>> {
    send_frame(link, timing, config, request)?;

    // Give the device at least its own transmission time before polling:
    // four 10-bit characters at the line rate, doubled, stretched on
    // retries, never below the floor slow converters need.
    let t_min = 40.0 / f64::from(config.baudrate);
    let settle = Duration::from_secs_f64(2.0 * t_min * (1.0 + 0.5 * f64::from(attempt)))
        .max(MIN_RESPONSE_WAIT);
    thread::sleep(settle);

    let started = Instant::now();
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    loop {
        let available = link.bytes_available()?;
        if available > 0 {
            let chunk = link.read_available(available.min(READ_CHUNK))?;
            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
                log::debug!(
                    "read {} bytes, buffer now {} ({} total)",
                    chunk.len(),
                    format_hex(&buffer),
                    buffer.len()
                );
            }
        }

        if let Some(total) = frame::expected_response_length(expected_function, &buffer) {
            if buffer.len() >= total {
                buffer.truncate(total);
                return Ok(buffer);
            }
        }

        if started.elapsed() >= attempt_timeout {
            if !buffer.is_empty() {
                log::warn!(
                    "deadline passed with incomplete response: {}",
                    format_hex(&buffer)
                );
            }
            return Err(Error::Timeout {
                elapsed: started.elapsed(),
            });
        }

        if available == 0 {
            thread::sleep(IDLE_POLL);
        }
    }
}

/// Flush stale bytes, honour the inter-frame gap, write the frame and stamp
/// the send time. Also used on its own for broadcasts, which get no
/// response.
pub(crate) fn send_frame(
    link: &mut dyn SerialLink,
    timing: &mut TimingState,
    config: &ClientConfig,
    request: &[u8],
) -> Result<()> {
    link.flush_input()?;
    link.flush_output()?;

    if let Some(last) = timing.last_send {
        let gap = config.inter_frame_delay();
        let elapsed = last.elapsed();
        if elapsed < gap {
            thread::sleep(gap - elapsed);
        }
    }

    log::debug!("sending {}", format_hex(request));
    link.write_all(request)?;
    timing.last_send = Some(Instant::now());
    Ok(())
}
