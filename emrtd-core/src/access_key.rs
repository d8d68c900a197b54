//! Access key material printed on the document.
//!
//! Keys are only ever handed to the chip reader. They are zeroized on drop
//! and redacted from `Debug` output.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::ProtocolError;

/// Length of a Card Access Number.
pub const CAN_LENGTH: usize = 6;

/// Which kind of access key was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKeyKind {
    /// MRZ-derived key (BAC or PACE-MRZ).
    Mrz,
    /// Card Access Number (PACE-CAN).
    Can,
}

/// Key granting read access to the chip.
#[derive(Clone)]
pub enum AccessKey {
    /// Document number, date of birth and date of expiry from the MRZ.
    Mrz {
        /// Document number.
        document_number: Zeroizing<String>,
        /// Date of birth, `YYMMDD`.
        date_of_birth: Zeroizing<String>,
        /// Date of expiry, `YYMMDD`.
        date_of_expiry: Zeroizing<String>,
    },
    /// Six-digit Card Access Number.
    Can(Zeroizing<String>),
}

impl AccessKey {
    /// Build an MRZ key.
    ///
    /// # Errors
    ///
    /// Returns error if the document number is empty or not alphanumeric
    /// (`<` filler allowed), or a date is not six digits.
    pub fn mrz(
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<Self, ProtocolError> {
        let document_number = document_number.trim();
        if document_number.is_empty() {
            return Err(ProtocolError::InvalidAccessKey("document number is empty"));
        }
        if !document_number
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '<')
        {
            return Err(ProtocolError::InvalidAccessKey(
                "document number must be alphanumeric",
            ));
        }
        if !is_date(date_of_birth) {
            return Err(ProtocolError::InvalidAccessKey("date of birth must be YYMMDD"));
        }
        if !is_date(date_of_expiry) {
            return Err(ProtocolError::InvalidAccessKey("date of expiry must be YYMMDD"));
        }

        Ok(Self::Mrz {
            document_number: Zeroizing::new(document_number.to_ascii_uppercase()),
            date_of_birth: Zeroizing::new(date_of_birth.to_string()),
            date_of_expiry: Zeroizing::new(date_of_expiry.to_string()),
        })
    }

    /// Build a CAN key.
    ///
    /// # Errors
    ///
    /// Returns error if the CAN is not exactly six digits.
    pub fn can(can: &str) -> Result<Self, ProtocolError> {
        if can.len() != CAN_LENGTH || !can.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidAccessKey("CAN must be six digits"));
        }
        Ok(Self::Can(Zeroizing::new(can.to_string())))
    }

    /// Kind of key.
    pub fn kind(&self) -> AccessKeyKind {
        match self {
            Self::Mrz { .. } => AccessKeyKind::Mrz,
            Self::Can(_) => AccessKeyKind::Can,
        }
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mrz { .. } => f.write_str("AccessKey::Mrz(<redacted>)"),
            Self::Can(_) => f.write_str("AccessKey::Can(<redacted>)"),
        }
    }
}

/// `YYMMDD` with a plausible month and day.
fn is_date(value: &str) -> bool {
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let month: u8 = value[2..4].parse().unwrap_or(0);
    let day: u8 = value[4..6].parse().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}
