//! The fixed-shape record stored in leaf cells.
//!
//! A row is `id` plus two NUL-terminated byte fields, serialized at fixed
//! offsets so every row occupies exactly [`ROW_SIZE`] bytes on disk.

use crate::errors::{DbError, DbResult};
use std::fmt;

/// Usable bytes in the username column (one byte is reserved for the NUL).
pub const USERNAME_MAX: usize = 32;
/// Usable bytes in the email column.
pub const EMAIL_MAX: usize = 255;

pub const ID_SIZE: usize = 4;
pub const USERNAME_SIZE: usize = USERNAME_MAX + 1;
pub const EMAIL_SIZE: usize = EMAIL_MAX + 1;

pub const ID_OFFSET: usize = 0;
pub const USERNAME_OFFSET: usize = ID_OFFSET + ID_SIZE;
pub const EMAIL_OFFSET: usize = USERNAME_OFFSET + USERNAME_SIZE;

/// On-disk size of one serialized row: 4 + 33 + 256.
pub const ROW_SIZE: usize = ID_SIZE + USERNAME_SIZE + EMAIL_SIZE;

/// One table row. The string fields keep their on-disk fixed-width shape so
/// serialization is a straight copy.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub id: u32,
    username: [u8; USERNAME_SIZE],
    email: [u8; EMAIL_SIZE],
}

impl Row {
    /// Build a row from user input, rejecting over-long fields before they
    /// get anywhere near the tree.
    pub fn new(id: u32, username: &str, email: &str) -> DbResult<Self> {
        if username.len() > USERNAME_MAX || email.len() > EMAIL_MAX {
            return Err(DbError::StringTooLong);
        }
        let mut row = Row {
            id,
            username: [0; USERNAME_SIZE],
            email: [0; EMAIL_SIZE],
        };
        row.username[..username.len()].copy_from_slice(username.as_bytes());
        row.email[..email.len()].copy_from_slice(email.as_bytes());
        Ok(row)
    }

    pub fn username(&self) -> String {
        fixed_bytes_to_string(&self.username)
    }

    pub fn email(&self) -> String {
        fixed_bytes_to_string(&self.email)
    }

    /// Copy the row into a [`ROW_SIZE`] destination slice.
    pub fn serialize(&self, dst: &mut [u8]) {
        dst[ID_OFFSET..ID_OFFSET + ID_SIZE].copy_from_slice(&self.id.to_le_bytes());
        dst[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_SIZE].copy_from_slice(&self.username);
        dst[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_SIZE].copy_from_slice(&self.email);
    }

    /// Rebuild a row from a [`ROW_SIZE`] source slice.
    pub fn deserialize(src: &[u8]) -> Self {
        let mut id_bytes = [0u8; ID_SIZE];
        id_bytes.copy_from_slice(&src[ID_OFFSET..ID_OFFSET + ID_SIZE]);
        let mut username = [0u8; USERNAME_SIZE];
        username.copy_from_slice(&src[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_SIZE]);
        let mut email = [0u8; EMAIL_SIZE];
        email.copy_from_slice(&src[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_SIZE]);
        Row {
            id: u32::from_le_bytes(id_bytes),
            username,
            email,
        }
    }
}

fn fixed_bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.id, self.username(), self.email())
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("id", &self.id)
            .field("username", &self.username())
            .field("email", &self.email())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_roundtrip_is_byte_identical() {
        let row = Row::new(42, "alice", "alice@example.com").unwrap();
        let mut buf = [0u8; ROW_SIZE];
        row.serialize(&mut buf);
        let back = Row::deserialize(&buf);
        assert_eq!(back, row);
        assert_eq!(back.username(), "alice");
        assert_eq!(back.email(), "alice@example.com");
    }

    #[test]
    fn username_at_limit_is_accepted() {
        let name = "a".repeat(USERNAME_MAX);
        let row = Row::new(1, &name, "x@y.z").unwrap();
        assert_eq!(row.username(), name);
    }

    #[test]
    fn overlong_fields_are_rejected() {
        let name = "a".repeat(USERNAME_MAX + 1);
        assert!(matches!(
            Row::new(1, &name, "x@y.z"),
            Err(DbError::StringTooLong)
        ));
        let email = "e".repeat(EMAIL_MAX + 1);
        assert!(matches!(
            Row::new(1, "bob", &email),
            Err(DbError::StringTooLong)
        ));
    }

    #[test]
    fn id_is_little_endian_at_offset_zero() {
        let row = Row::new(0x01020304, "u", "e").unwrap();
        let mut buf = [0u8; ROW_SIZE];
        row.serialize(&mut buf);
        assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
    }
}
