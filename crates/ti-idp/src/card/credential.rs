//! Card secrets. Held only for one card interaction and wiped on drop.

use std::fmt;

use zeroize::Zeroizing;

use super::error::CardError;

fn digits(value: &str, name: &str, min: usize, max: usize) -> Result<Zeroizing<String>, CardError> {
    let value = Zeroizing::new(value.trim().to_string());
    if value.len() < min || value.len() > max || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CardError::invalid_input(format!(
            "{name} must have {min} to {max} digits"
        )));
    }
    Ok(value)
}

macro_rules! secret {
    ($name:ident, $label:literal, $min:literal, $max:literal) => {
        #[doc = concat!("Card ", $label, ", wiped on drop.")]
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Zeroizing<String>);

        impl $name {
            #[doc = concat!("Validates and wraps a ", $label, ".")]
            ///
            /// # Errors
            /// Returns `InvalidInput` for a wrong length or non-digits.
            pub fn new(value: &str) -> Result<Self, CardError> {
                digits(value, $label, $min, $max).map(Self)
            }

            pub(crate) fn expose(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

secret!(Can, "CAN", 6, 6);
secret!(Pin, "PIN", 6, 8);
secret!(Puk, "PUK", 8, 8);

/// CAN and PIN for one card login.
#[derive(Clone, PartialEq, Eq)]
pub struct CardCredential {
    /// Card access number.
    pub can: Can,
    /// Cardholder PIN.
    pub pin: Pin,
}

impl CardCredential {
    /// Validates and wraps both secrets.
    ///
    /// # Errors
    /// Returns `InvalidInput` if either has the wrong format.
    pub fn new(can: &str, pin: &str) -> Result<Self, CardError> {
        Ok(Self {
            can: Can::new(can)?,
            pin: Pin::new(pin)?,
        })
    }
}

impl fmt::Debug for CardCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CardCredential(<redacted>)")
    }
}

/// ISO 9564 format-2 PIN block: `2N`, BCD digits, `F` padding to 8 bytes.
pub(crate) fn format2_block(secret: &str) -> Zeroizing<[u8; 8]> {
    let mut block = Zeroizing::new([0xFFu8; 8]);
    let digits = secret.as_bytes();
    block[0] = 0x20 | (digits.len() as u8 & 0x0F);
    for (i, digit) in digits.iter().take(14).enumerate() {
        let nibble = digit - b'0';
        let byte = &mut block[1 + i / 2];
        if i % 2 == 0 {
            *byte = (nibble << 4) | 0x0F;
        } else {
            *byte = (*byte & 0xF0) | nibble;
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(Can::new("123123").is_ok());
        assert!(Can::new("12312").is_err());
        assert!(Can::new("12a123").is_err());
        assert!(Pin::new("123456").is_ok());
        assert!(Pin::new("12345678").is_ok());
        assert!(Pin::new("123456789").is_err());
        assert!(Puk::new("12345678").is_ok());
        assert!(matches!(Puk::new("1234"), Err(CardError::InvalidInput(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let credential = CardCredential::new("123123", "654321").unwrap();
        let rendered = format!("{credential:?} {:?}", credential.pin);
        assert!(!rendered.contains("123123"));
        assert!(!rendered.contains("654321"));
    }

    #[test]
    fn test_format2_block() {
        assert_eq!(
            *format2_block("123456"),
            [0x26, 0x12, 0x34, 0x56, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            *format2_block("1234567"),
            [0x27, 0x12, 0x34, 0x56, 0x7F, 0xFF, 0xFF, 0xFF]
        );
    }
}
