//! ISO 7816-4 command and response APDUs plus the simple BER-TLV subset
//! the card protocol needs.

use std::fmt;

use super::error::CardError;

/// Status word of a response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// Normal processing.
    pub const SUCCESS: Self = Self(0x9000);
    /// End of file reached before `Le` bytes.
    pub const END_OF_FILE: Self = Self(0x6282);
    /// Authentication failed without a counter (PACE token mismatch).
    pub const AUTHENTICATION_FAILED: Self = Self(0x6300);
    /// Memory failure.
    pub const MEMORY_FAILURE: Self = Self(0x6581);
    /// Wrong length.
    pub const WRONG_LENGTH: Self = Self(0x6700);
    /// Security status not satisfied.
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    /// Authentication method (password) blocked.
    pub const BLOCKED: Self = Self(0x6983);
    /// Conditions of use not satisfied; the password is not usable.
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    /// Secure messaging data object incorrect.
    pub const SM_DATA_INCORRECT: Self = Self(0x6988);
    /// Referenced data not found.
    pub const REFERENCED_DATA_NOT_FOUND: Self = Self(0x6A88);
    /// File not found.
    pub const FILE_NOT_FOUND: Self = Self(0x6A82);
    /// Wrong parameters P1-P2.
    pub const WRONG_PARAMETERS: Self = Self(0x6B00);
    /// Instruction not supported.
    pub const INS_NOT_SUPPORTED: Self = Self(0x6D00);

    /// Wrong secret with `retries` attempts left.
    #[must_use]
    pub fn wrong_secret(retries: u8) -> Self {
        Self(0x63C0 | u16::from(retries & 0x0F))
    }

    /// Whether the command succeeded.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Remaining attempts carried by a `63Cx` status.
    #[must_use]
    pub fn retries_left(self) -> Option<u8> {
        if self.0 & 0xFFF0 == 0x63C0 {
            Some((self.0 & 0x000F) as u8)
        } else {
            None
        }
    }

    /// The two status bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:04X})", self.0)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// A command APDU.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandApdu {
    /// Class byte.
    pub cla: u8,
    /// Instruction byte.
    pub ins: u8,
    /// Parameter 1.
    pub p1: u8,
    /// Parameter 2.
    pub p2: u8,
    /// Command data.
    pub data: Vec<u8>,
    /// Expected response length; 256 (short) or 65536 (extended) for "all".
    pub le: Option<usize>,
}

impl fmt::Debug for CommandApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandApdu({:02X} {:02X} {:02X} {:02X}, {} bytes, le={:?})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len(),
            self.le
        )
    }
}

impl CommandApdu {
    /// Creates a command without data.
    #[must_use]
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Sets the command data.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the expected response length.
    #[must_use]
    pub fn with_le(mut self, le: usize) -> Self {
        self.le = Some(le);
        self
    }

    /// Whether the short encoding suffices.
    fn is_short(&self) -> bool {
        self.data.len() <= 255 && self.le.is_none_or(|le| le <= 256)
    }

    /// Serializes the command.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if self.is_short() {
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                out.push(if le == 256 { 0 } else { le as u8 });
            }
        } else {
            if !self.data.is_empty() {
                out.push(0);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                if self.data.is_empty() {
                    out.push(0);
                }
                let le = if le >= 65536 { 0 } else { le as u16 };
                out.extend_from_slice(&le.to_be_bytes());
            }
        }
        out
    }

    /// Parses a serialized command.
    ///
    /// # Errors
    /// Returns `Protocol` for inconsistent length fields.
    pub fn parse(bytes: &[u8]) -> Result<Self, CardError> {
        if bytes.len() < 4 {
            return Err(CardError::protocol("command shorter than header"));
        }
        let mut cmd = Self::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[4..];
        match body.len() {
            0 => {}
            1 => cmd.le = Some(if body[0] == 0 { 256 } else { usize::from(body[0]) }),
            3 if body[0] == 0 => {
                let le = usize::from(u16::from_be_bytes([body[1], body[2]]));
                cmd.le = Some(if le == 0 { 65536 } else { le });
            }
            _ if body[0] != 0 => {
                let lc = usize::from(body[0]);
                let rest = &body[1..];
                match rest.len().checked_sub(lc) {
                    Some(0) => cmd.data = rest.to_vec(),
                    Some(1) => {
                        cmd.data = rest[..lc].to_vec();
                        let le = rest[lc];
                        cmd.le = Some(if le == 0 { 256 } else { usize::from(le) });
                    }
                    _ => return Err(CardError::protocol("inconsistent short Lc")),
                }
            }
            _ => {
                if body.len() < 3 {
                    return Err(CardError::protocol("truncated extended Lc"));
                }
                let lc = usize::from(u16::from_be_bytes([body[1], body[2]]));
                let rest = &body[3..];
                match rest.len().checked_sub(lc) {
                    Some(0) => cmd.data = rest.to_vec(),
                    Some(2) => {
                        cmd.data = rest[..lc].to_vec();
                        let le = usize::from(u16::from_be_bytes([rest[lc], rest[lc + 1]]));
                        cmd.le = Some(if le == 0 { 65536 } else { le });
                    }
                    _ => return Err(CardError::protocol("inconsistent extended Lc")),
                }
            }
        }
        Ok(cmd)
    }
}

/// A response APDU.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    /// Response data.
    pub data: Vec<u8>,
    /// Status word.
    pub sw: StatusWord,
}

impl fmt::Debug for ResponseApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseApdu({} bytes, {})", self.data.len(), self.sw)
    }
}

impl ResponseApdu {
    /// Creates a response.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>, sw: StatusWord) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    /// A response with status only.
    #[must_use]
    pub fn status(sw: StatusWord) -> Self {
        Self::new(Vec::new(), sw)
    }

    /// Parses `data || SW1 SW2`.
    ///
    /// # Errors
    /// Returns `Protocol` for responses shorter than two bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CardError> {
        if bytes.len() < 2 {
            return Err(CardError::protocol("response without status word"));
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self::new(data, StatusWord(u16::from_be_bytes([sw[0], sw[1]]))))
    }

    /// Serializes as `data || SW1 SW2`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.sw.to_bytes());
        out
    }
}

/// Encodes a single-byte-tag TLV.
#[must_use]
pub fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = value.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(value);
    out
}

/// Finds the value of the first TLV with `tag` at the top level of `data`.
///
/// # Errors
/// Returns `Protocol` if `data` is not a sequence of well-formed TLVs.
pub fn find_tlv(data: &[u8], tag: u8) -> Result<Option<&[u8]>, CardError> {
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(CardError::protocol("truncated TLV"));
        }
        let current = rest[0];
        let (len, header) = match rest[1] {
            n if n < 0x80 => (usize::from(n), 2),
            0x81 if rest.len() >= 3 => (usize::from(rest[2]), 3),
            0x82 if rest.len() >= 4 => (usize::from(u16::from_be_bytes([rest[2], rest[3]])), 4),
            _ => return Err(CardError::protocol("unsupported TLV length")),
        };
        let end = header + len;
        if rest.len() < end {
            return Err(CardError::protocol("TLV value exceeds data"));
        }
        if current == tag {
            return Ok(Some(&rest[header..end]));
        }
        rest = &rest[end..];
    }
    Ok(None)
}
