//! Request builders, response-length prediction and the hardened response
//! parser.
//!
//! Building is strictly conforming Modbus RTU. Parsing is where the field
//! quirks live: devices echo wrong function codes, answer with the
//! broadcast unit ID, or checksum the frame with one of the variants in
//! [`crate::codec::crc`]. Each tolerance is gated by a [`ParseOptions`]
//! flag and logged at warn level on every hit, so a clean bus stays silent.

use crate::codec::crc::{self, CrcVariant};
use crate::codec::format_hex;
use crate::error::{Error, Result};

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Waveshare alias for `READ_HOLDING_REGISTERS`; the whole 0x41..=0x44
/// block mirrors the standard read functions.
pub const VENDOR_READ_HOLDING_REGISTERS: u8 = 0x43;

/// Unit ID 0 addresses every device on the bus; no response is expected.
pub const BROADCAST_UNIT: u8 = 0;
/// Highest addressable unit ID on an RTU bus.
pub const MAX_UNIT_ID: u8 = 247;

pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// How a response checksum was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcAcceptance {
    /// Standard CRC matched; nothing to report.
    Standard,
    /// One of the permissive variants matched.
    Variant(CrcVariant),
    /// No variant matched but the read frame was structurally consistent
    /// and the caller runs lenient.
    Bypassed,
}

impl CrcAcceptance {
    /// Anything other than a standard match counts as a CRC error in the
    /// device statistics.
    pub fn is_standard(&self) -> bool {
        matches!(self, CrcAcceptance::Standard)
    }
}

/// Parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Normal {
        /// Function code as echoed by the device (may legitimately differ
        /// from the request under the compatibility whitelist).
        function: u8,
        /// Frame body between the function code and the checksum.
        payload: Vec<u8>,
        crc: CrcAcceptance,
    },
    Exception {
        /// Request function the device was answering (high bit stripped).
        function: u8,
        code: u8,
    },
}

/// Leniency switches consulted while parsing; mirrors the client
/// configuration flags.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub lenient_crc: bool,
    pub lenient_function_code: bool,
    pub lenient_unit_id: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            lenient_crc: false,
            lenient_function_code: true,
            lenient_unit_id: false,
        }
    }
}

fn is_read_function(function: u8) -> bool {
    matches!(function, READ_COILS..=READ_INPUT_REGISTERS | 0x41..=0x44)
}

fn is_coil_read(function: u8) -> bool {
    matches!(function, READ_COILS | READ_DISCRETE_INPUTS | 0x41 | 0x42)
}

fn is_write_function(function: u8) -> bool {
    matches!(
        function,
        WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER | WRITE_MULTIPLE_COILS
            | WRITE_MULTIPLE_REGISTERS
            | 0x65..=0x68
    )
}

fn check_unit_id(unit_id: u8) -> Result<()> {
    if unit_id > MAX_UNIT_ID {
        return Err(Error::InvalidArgument(format!(
            "unit ID {unit_id} out of range 0-{MAX_UNIT_ID}"
        )));
    }
    Ok(())
}

fn check_address_span(address: u16, quantity: u16) -> Result<()> {
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(Error::InvalidArgument(format!(
            "address {address} + quantity {quantity} overflows the 16-bit address space"
        )));
    }
    Ok(())
}

fn assemble(unit_id: u8, function: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.push(unit_id);
    frame.push(function);
    frame.extend_from_slice(data);
    crc::append_crc(&mut frame);
    frame
}

/// Build a read request (coils, discrete inputs, holding or input
/// registers, including the vendor 0x41..=0x44 aliases).
pub fn build_read_request(unit_id: u8, function: u8, address: u16, quantity: u16) -> Result<Vec<u8>> {
    check_unit_id(unit_id)?;
    if !is_read_function(function) {
        return Err(Error::InvalidArgument(format!(
            "0x{function:02X} is not a read function"
        )));
    }
    let max = if is_coil_read(function) {
        MAX_READ_COILS
    } else {
        MAX_READ_REGISTERS
    };
    if quantity == 0 || quantity > max {
        return Err(Error::InvalidArgument(format!(
            "read quantity {quantity} outside 1..={max} for function 0x{function:02X}"
        )));
    }
    check_address_span(address, quantity)?;

    let mut data = [0u8; 4];
    data[..2].copy_from_slice(&address.to_be_bytes());
    data[2..].copy_from_slice(&quantity.to_be_bytes());
    Ok(assemble(unit_id, function, &data))
}

/// Build a write-single-coil request; the value travels as 0xFF00 / 0x0000.
pub fn build_write_single_coil(unit_id: u8, address: u16, value: bool) -> Result<Vec<u8>> {
    check_unit_id(unit_id)?;
    let wire_value: u16 = if value { 0xFF00 } else { 0x0000 };
    let mut data = [0u8; 4];
    data[..2].copy_from_slice(&address.to_be_bytes());
    data[2..].copy_from_slice(&wire_value.to_be_bytes());
    Ok(assemble(unit_id, WRITE_SINGLE_COIL, &data))
}

pub fn build_write_single_register(unit_id: u8, address: u16, value: u16) -> Result<Vec<u8>> {
    check_unit_id(unit_id)?;
    let mut data = [0u8; 4];
    data[..2].copy_from_slice(&address.to_be_bytes());
    data[2..].copy_from_slice(&value.to_be_bytes());
    Ok(assemble(unit_id, WRITE_SINGLE_REGISTER, &data))
}

/// Build a write-multiple-coils request, packing the bits LSB-first within
/// each byte.
pub fn build_write_multiple_coils(unit_id: u8, address: u16, values: &[bool]) -> Result<Vec<u8>> {
    check_unit_id(unit_id)?;
    if values.is_empty() || values.len() > usize::from(MAX_WRITE_COILS) {
        return Err(Error::InvalidArgument(format!(
            "coil count {} outside 1..={MAX_WRITE_COILS}",
            values.len()
        )));
    }
    let quantity = values.len() as u16;
    check_address_span(address, quantity)?;

    let byte_count = values.len().div_ceil(8);
    let mut data = Vec::with_capacity(5 + byte_count);
    data.extend_from_slice(&address.to_be_bytes());
    data.extend_from_slice(&quantity.to_be_bytes());
    data.push(byte_count as u8);
    let mut packed = vec![0u8; byte_count];
    for (index, &on) in values.iter().enumerate() {
        if on {
            packed[index / 8] |= 1 << (index % 8);
        }
    }
    data.extend_from_slice(&packed);
    Ok(assemble(unit_id, WRITE_MULTIPLE_COILS, &data))
}

pub fn build_write_multiple_registers(unit_id: u8, address: u16, values: &[u16]) -> Result<Vec<u8>> {
    check_unit_id(unit_id)?;
    if values.is_empty() || values.len() > usize::from(MAX_WRITE_REGISTERS) {
        return Err(Error::InvalidArgument(format!(
            "register count {} outside 1..={MAX_WRITE_REGISTERS}",
            values.len()
        )));
    }
    let quantity = values.len() as u16;
    check_address_span(address, quantity)?;

    let mut data = Vec::with_capacity(5 + values.len() * 2);
    data.extend_from_slice(&address.to_be_bytes());
    data.extend_from_slice(&quantity.to_be_bytes());
    data.push((values.len() * 2) as u8);
    for value in values {
        data.extend_from_slice(&value.to_be_bytes());
    }
    Ok(assemble(unit_id, WRITE_MULTIPLE_REGISTERS, &data))
}

/// Predict the total response length from the bytes received so far, or
/// `None` when not enough have arrived to decide.
///
/// Exception frames are always 5 bytes. Read responses carry their byte
/// count in the third byte; write echoes are fixed at 8. The request's
/// function code drives the classification so that devices echoing a
/// whitelisted-but-different code still terminate the read loop.
pub fn expected_response_length(expected_function: u8, so_far: &[u8]) -> Option<usize> {
    if so_far.len() < 2 {
        return None;
    }
    if so_far[1] & 0x80 != 0 {
        return Some(5);
    }
    if is_read_function(expected_function) {
        if so_far.len() < 3 {
            return None;
        }
        return Some(3 + usize::from(so_far[2]) + 2);
    }
    if is_write_function(expected_function) {
        return Some(8);
    }
    None
}

/// Whether a read response's byte-count field agrees with the frame length.
fn read_structure_consistent(frame: &[u8]) -> bool {
    frame.len() >= 5 && usize::from(frame[2]) + 5 == frame.len()
}

/// Whitelisted function-code echoes for a given request.
///
/// Covers holding/input and coil/discrete confusion, the 0x00 echo, the
/// off-by-one neighbours some firmwares produce for reads, and the
/// Waveshare vendor blocks (0x41..=0x44 for reads, 0x65..=0x68 for writes).
fn is_compatible_echo(expected: u8, echoed: u8) -> bool {
    const CONFUSED_PAIRS: &[(u8, u8)] = &[
        (READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS),
        (READ_INPUT_REGISTERS, READ_HOLDING_REGISTERS),
        (READ_COILS, READ_DISCRETE_INPUTS),
        (READ_DISCRETE_INPUTS, READ_COILS),
    ];
    if CONFUSED_PAIRS.contains(&(expected, echoed)) {
        return true;
    }
    if is_read_function(expected)
        && (echoed == 0x00
            || echoed == expected.wrapping_add(1)
            || echoed == expected.wrapping_sub(1))
    {
        return true;
    }
    // Vendor read aliases map onto the standard block, in both directions
    // (a 0x43 request may be answered with a plain 0x03 echo).
    if (0x41..=0x44).contains(&echoed) && echoed - 0x40 == expected {
        return true;
    }
    if (0x41..=0x44).contains(&expected) && expected - 0x40 == echoed {
        return true;
    }
    let vendor_write = |code: u8| match code {
        0x65 => Some(WRITE_SINGLE_COIL),
        0x66 => Some(WRITE_SINGLE_REGISTER),
        0x67 => Some(WRITE_MULTIPLE_COILS),
        0x68 => Some(WRITE_MULTIPLE_REGISTERS),
        _ => None,
    };
    vendor_write(echoed) == Some(expected)
}

/// Parse and validate a complete response frame.
///
/// Returns [`Response::Normal`] when the checksum, unit ID and function
/// code all pass (possibly through a logged tolerance), or
/// [`Response::Exception`] for a device exception frame. Structural
/// impossibilities are `Protocol` errors; a checksum nothing recognises is
/// a `Crc` error.
pub fn parse_response(
    frame: &[u8],
    expected_unit: u8,
    expected_function: u8,
    options: &ParseOptions,
) -> Result<Response> {
    if frame.len() < 4 {
        return Err(Error::Protocol(format!(
            "response too short ({} bytes): {}",
            frame.len(),
            format_hex(frame)
        )));
    }

    let unit_id = frame[0];
    let function = frame[1];
    let is_exception = function & 0x80 != 0;

    let crc = validate_checksum(frame, expected_function, is_exception, options)?;

    if is_exception {
        if frame.len() < 5 {
            return Err(Error::Protocol(format!(
                "truncated exception frame: {}",
                format_hex(frame)
            )));
        }
        return Ok(Response::Exception {
            function: function & 0x7F,
            code: frame[2],
        });
    }

    if unit_id != expected_unit {
        if options.lenient_unit_id {
            log::warn!(
                "unit ID mismatch: expected {expected_unit}, got {unit_id}; accepting (lenient)"
            );
        } else {
            return Err(Error::Protocol(format!(
                "unit ID mismatch: expected {expected_unit}, got {unit_id}"
            )));
        }
    }

    if function != expected_function {
        let compatible =
            options.lenient_function_code && is_compatible_echo(expected_function, function);
        if compatible {
            log::warn!(
                "function code mismatch: expected 0x{expected_function:02X}, got \
                 0x{function:02X}; accepting whitelisted echo"
            );
        } else {
            return Err(Error::Protocol(format!(
                "function code mismatch: expected 0x{expected_function:02X}, got 0x{function:02X}"
            )));
        }
    }

    if is_read_function(expected_function) && !read_structure_consistent(frame) {
        return Err(Error::Protocol(format!(
            "byte count {} inconsistent with frame length {}: {}",
            frame.get(2).copied().unwrap_or(0),
            frame.len(),
            format_hex(frame)
        )));
    }

    Ok(Response::Normal {
        function,
        payload: frame[2..frame.len() - 2].to_vec(),
        crc,
    })
}

fn validate_checksum(
    frame: &[u8],
    expected_function: u8,
    is_exception: bool,
    options: &ParseOptions,
) -> Result<CrcAcceptance> {
    if crc::check(frame) {
        return Ok(CrcAcceptance::Standard);
    }
    // Permissive validation only ever applies to read responses whose byte
    // count agrees with the frame length; writes and exceptions stay strict.
    let permissive = options.lenient_crc
        && !is_exception
        && is_read_function(expected_function)
        && read_structure_consistent(frame);
    if permissive {
        if let Some(variant) = crc::match_any_variant(frame) {
            log::warn!(
                "accepted frame with non-standard CRC ({variant}): {}",
                format_hex(frame)
            );
            return Ok(CrcAcceptance::Variant(variant));
        }
        log::warn!(
            "no CRC variant matched but read structure is consistent; accepting: {}",
            format_hex(frame)
        );
        return Ok(CrcAcceptance::Bypassed);
    }
    Err(Error::Crc {
        frame_hex: format_hex(frame),
    })
}

/// Unpack a read-coils/discrete-inputs payload (byte count + packed bits,
/// LSB first) into at most `quantity` booleans.
pub fn unpack_bits(payload: &[u8], quantity: u16) -> Result<Vec<bool>> {
    let byte_count = usize::from(*payload.first().ok_or_else(|| {
        Error::Protocol("empty payload in bit-read response".to_string())
    })?);
    if payload.len() < 1 + byte_count {
        return Err(Error::Protocol(format!(
            "bit-read payload shorter than its byte count ({byte_count})"
        )));
    }
    let mut bits = Vec::with_capacity(byte_count * 8);
    for &byte in &payload[1..1 + byte_count] {
        for bit in 0..8 {
            bits.push(byte & (1 << bit) != 0);
        }
    }
    bits.truncate(usize::from(quantity));
    Ok(bits)
}

/// Unpack a read-registers payload (byte count + big-endian words) into at
/// most `quantity` values.
pub fn unpack_registers(payload: &[u8], quantity: u16) -> Result<Vec<u16>> {
    let byte_count = usize::from(*payload.first().ok_or_else(|| {
        Error::Protocol("empty payload in register-read response".to_string())
    })?);
    if payload.len() < 1 + byte_count {
        return Err(Error::Protocol(format!(
            "register-read payload shorter than its byte count ({byte_count})"
        )));
    }
    let mut values: Vec<u16> = payload[1..1 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    values.truncate(usize::from(quantity));
    Ok(values)
}
