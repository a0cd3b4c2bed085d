//! TFTP Packet Codec
//!
//! Encoding and decoding of the wire messages the read path uses: RRQ
//! (decode only), DATA, ACK, ERROR and OACK. All integers are big-endian.
//!
//! | Message | Layout                                                   |
//! |---------|----------------------------------------------------------|
//! | RRQ     | `1` · filename · 0 · mode · 0 · (name · 0 · value · 0)*  |
//! | DATA    | `3` · block (u16) · payload                              |
//! | ACK     | `4` · block (u16)                                        |
//! | ERROR   | `5` · code (u16) · message · 0                           |
//! | OACK    | `6` · (name · 0 · value · 0)*                            |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Known on the wire but never served; the dispatcher answers it like any
    /// other opcode it does not handle.
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Every block but the last carries exactly the negotiated block size.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Block number 0 acknowledges an OACK.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Packet format: | Opcode | Opt1 | 0 | Value1 | 0 | ... |
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short protocol name of the opcode, as used in log lines
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Codes 0-7 come from RFC 1350, code 8 from the option extension (RFC 2347).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Not defined, see the error message
    Generic = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    /// Disk full or allocation exceeded
    DiskFull = 3,
    /// Illegal TFTP operation
    IllegalOpcode = 4,
    /// Unknown transfer ID
    UnknownTransfer = 5,
    AlreadyExists = 6,
    /// No such user
    UnknownUser = 7,
    /// The request carried options the server refuses
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(1), Some(TftpErrorCode::FileNotFound));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Generic),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOpcode),
            5 => Some(Self::UnknownTransfer),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::UnknownUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Generic => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOpcode => "Illegal TFTP operation",
            Self::UnknownTransfer => "Unknown transfer",
            Self::AlreadyExists => "File already exists",
            Self::UnknownUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// The dispatcher and sessions treat the mode string as opaque; read handlers
/// use this type to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, bytes are sent unchanged. Mode string: "octet"
    Octet,

    /// Text mode. Line endings are sent as CR LF and a lone CR as CR NUL.
    /// Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode, ignoring ASCII case
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("octet"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("NETASCII"), Some(TransferMode::NetAscii));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    /// Mode string exactly as the client sent it
    pub mode: String,
    /// Every option pair present in the request, recognized or not
    pub options: BTreeMap<String, String>,
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Read one zero-terminated field starting at `*pos`, advancing past the NUL.
///
/// Returns `None` when no NUL remains, leaving `*pos` untouched.
fn take_cstr<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let end = find_zero(buf, *pos)?;
    let field = &buf[*pos..end];
    *pos = end + 1;
    Some(field)
}

fn field_to_string(field: &[u8], what: &str) -> Result<String> {
    let s = std::str::from_utf8(field).with_context(|| format!("{} is not valid UTF-8", what))?;
    Ok(s.to_string())
}

/// Parse a TFTP Read Request (RRQ) packet
///
/// Filename and mode are mandatory. Options follow as name/value pairs until
/// the input holds no further zero-terminated name; a name without a value is
/// an error.
pub fn parse_rrq(buf: &[u8]) -> Result<ReadRequest> {
    if get_tftp_opcode(buf) != Some(TftpOpcode::ReadRequest) {
        return Err(anyhow!("Not an RRQ packet"));
    }

    let mut pos = 2;

    let filename = take_cstr(buf, &mut pos).ok_or_else(|| anyhow!("filename not terminated"))?;
    let filename = field_to_string(filename, "filename")?;

    let mode = take_cstr(buf, &mut pos).ok_or_else(|| anyhow!("mode not terminated"))?;
    let mode = field_to_string(mode, "mode")?;

    let mut options = BTreeMap::new();
    while let Some(key) = take_cstr(buf, &mut pos) {
        let key = field_to_string(key, "option name")?;
        let value = take_cstr(buf, &mut pos).ok_or_else(|| anyhow!("option '{}' has no value", key))?;
        let value = field_to_string(value, "option value")?;
        options.insert(key, value);
    }

    Ok(ReadRequest {
        filename,
        mode,
        options,
    })
}

/// Parse the block number out of a TFTP ACK packet
pub fn parse_ack(buf: &[u8]) -> Result<u16> {
    if buf.len() < 4 {
        return Err(anyhow!("ACK too short"));
    }

    if get_tftp_opcode(buf) != Some(TftpOpcode::Acknowledgment) {
        return Err(anyhow!("Not an ACK packet"));
    }

    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Parse a TFTP DATA packet into its block number and payload
pub fn parse_data(buf: &[u8]) -> Result<(u16, &[u8])> {
    if buf.len() < 4 {
        return Err(anyhow!("DATA too short"));
    }

    if get_tftp_opcode(buf) != Some(TftpOpcode::Data) {
        return Err(anyhow!("Not a DATA packet"));
    }

    Ok((u16::from_be_bytes([buf[2], buf[3]]), &buf[4..]))
}

/// Parse a TFTP Error packet
pub fn parse_error(buf: &[u8]) -> Result<(u16, String)> {
    if buf.len() < 4 {
        return Err(anyhow!("Error packet too short"));
    }

    if get_tftp_opcode(buf) != Some(TftpOpcode::Error) {
        return Err(anyhow!("Not an Error packet"));
    }

    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    // Tolerate a missing terminator
    let end = msg_bytes.iter().position(|&b| b == 0).unwrap_or(msg_bytes.len());
    let message = field_to_string(&msg_bytes[..end], "error message")?;

    Ok((code, message))
}

/// Parse a TFTP OACK packet into its option map
pub fn parse_oack(buf: &[u8]) -> Result<BTreeMap<String, String>> {
    if get_tftp_opcode(buf) != Some(TftpOpcode::OptionAck) {
        return Err(anyhow!("Not an OACK packet"));
    }

    let mut pos = 2;
    let mut options = BTreeMap::new();
    while let Some(key) = take_cstr(buf, &mut pos) {
        let key = field_to_string(key, "option name")?;
        let value = take_cstr(buf, &mut pos).ok_or_else(|| anyhow!("option '{}' has no value", key))?;
        options.insert(key, field_to_string(value, "option value")?);
    }

    Ok(options)
}

/// Build a TFTP Data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(4);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build a TFTP Error packet
pub fn build_error(code: TftpErrorCode, msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + msg.len() + 1);
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.as_u16().to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}

/// Build a TFTP OACK (Option Acknowledgment) packet
pub fn build_oack(opts: &BTreeMap<String, String>) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&TftpOpcode::OptionAck.as_u16().to_be_bytes());

    for (key, val) in opts {
        v.extend_from_slice(key.as_bytes());
        v.push(0);
        v.extend_from_slice(val.as_bytes());
        v.push(0);
    }

    v
}

/// Build a TFTP Read Request packet
///
/// The server never sends one; clients and tests do.
pub fn build_rrq(filename: &str, mode: &str, opts: &BTreeMap<String, String>) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + filename.len() + mode.len() + 2);
    v.extend_from_slice(&TftpOpcode::ReadRequest.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);

    for (key, val) in opts {
        v.extend_from_slice(key.as_bytes());
        v.push(0);
        v.extend_from_slice(val.as_bytes());
        v.push(0);
    }

    v
}

/// Get the raw opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Get the TFTP opcode enum from a packet buffer
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

/// Convert file data from local text to netascii.
///
/// A lone LF becomes CR LF, a lone CR becomes CR NUL, CR LF is kept.
pub fn convert_to_netascii(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        match data[i] {
            b'\r' => {
                if data.get(i + 1) == Some(&b'\n') {
                    result.extend_from_slice(b"\r\n");
                    i += 2;
                } else {
                    result.extend_from_slice(b"\r\0");
                    i += 1;
                }
            }
            b'\n' => {
                result.extend_from_slice(b"\r\n");
                i += 1;
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    result
}
