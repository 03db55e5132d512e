//! Path grammar.
//!
//! A path is a `/`-separated list of elements. Each element is a name of one
//! to four printable characters, optionally followed by `.` and a numeric
//! extension of at most 102 on the final element. `.` and `..` refer to the
//! current and parent directory and are collapsed at parse time.
//!
//! ```text
//! /LOGS/2024/DATA.12
//!  ^^^^ ^^^^ ^^^^ ^^
//!  dir  dir  name extension
//! ```

use std::fmt;

use owfs_common::constants::{
    EXT_DIRECTORY, EXT_FLAG, EXT_MASK, EXT_UNKNOWN, LEN_FILENAME, MAX_EXTENSION, NAME_CHARS,
    NAME_CHAR_MAX, NAME_CHAR_MIN, NAME_PAD, PATH_SEPARATOR,
};

use crate::error::{FsError, FsResult};

/// One path element in its on-media form: four space-padded name bytes and
/// an extension byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameElement {
    bytes: [u8; LEN_FILENAME],
}

impl NameElement {
    /// Parses one path element. Elements that are not `last` name
    /// directories and may not carry an extension.
    pub fn parse(field: &str, last: bool) -> Result<Self, &'static str> {
        let mut bytes = [NAME_PAD; LEN_FILENAME];
        bytes[NAME_CHARS] = EXT_UNKNOWN;

        let name = match field.find('.') {
            None => {
                if !last {
                    bytes[NAME_CHARS] = EXT_DIRECTORY;
                }
                field
            }
            Some(0) => {
                if field != "." && field != ".." {
                    return Err("only '.' and '..' may start with a period");
                }
                bytes[NAME_CHARS] = EXT_DIRECTORY;
                field
            }
            Some(period) => {
                if !last {
                    return Err("only the last element may carry an extension");
                }
                let extension: u8 = field[period + 1..]
                    .parse()
                    .map_err(|_| "extension is not a number")?;
                if extension > MAX_EXTENSION {
                    return Err("extension is larger than 102");
                }
                bytes[NAME_CHARS] = extension;
                &field[..period]
            }
        };

        if name.is_empty() {
            return Err("empty element");
        }
        if name.len() > NAME_CHARS {
            return Err("name is longer than 4 characters");
        }
        if name
            .bytes()
            .any(|b| !(NAME_CHAR_MIN..=NAME_CHAR_MAX).contains(&b))
        {
            return Err("name contains a non-printable character");
        }
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self { bytes })
    }

    /// Creates an element from its on-media bytes.
    pub fn from_bytes(bytes: [u8; LEN_FILENAME]) -> Self {
        Self { bytes }
    }

    /// Returns the on-media bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; LEN_FILENAME] {
        &self.bytes
    }

    /// Returns the four name bytes.
    #[inline]
    pub fn name_bytes(&self) -> &[u8] {
        &self.bytes[..NAME_CHARS]
    }

    /// Returns the raw extension byte, flag bit included.
    #[inline]
    pub fn extension(&self) -> u8 {
        self.bytes[NAME_CHARS]
    }

    /// Replaces the extension byte.
    #[inline]
    pub fn set_extension(&mut self, extension: u8) {
        self.bytes[NAME_CHARS] = extension;
    }

    /// Returns true if the element names a directory.
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.extension() & EXT_MASK == EXT_DIRECTORY
    }

    /// Returns true while the element's type is still undetermined.
    #[inline]
    pub fn is_unresolved(&self) -> bool {
        self.extension() == EXT_UNKNOWN
    }

    fn is_current_dir(&self) -> bool {
        self.bytes[0] == b'.' && self.bytes[1] != b'.'
    }

    fn is_parent_dir(&self) -> bool {
        self.bytes[0] == b'.' && self.bytes[1] == b'.'
    }

    /// Compares against the name field of a directory entry.
    ///
    /// An undetermined extension adopts the entry's type when the entry is a
    /// directory or a file with extension 0. On a match the entry's flag bit
    /// is copied onto the element.
    pub fn matches(&mut self, entry: &[u8]) -> bool {
        if entry.len() < LEN_FILENAME || self.name_bytes() != &entry[..NAME_CHARS] {
            return false;
        }
        let on_media = entry[NAME_CHARS] & EXT_MASK;
        if self.is_unresolved() && (on_media == 0 || on_media == EXT_DIRECTORY) {
            self.set_extension(on_media);
        }
        if self.extension() & EXT_MASK != on_media {
            return false;
        }
        if entry[NAME_CHARS] & EXT_FLAG != 0 {
            self.bytes[NAME_CHARS] |= EXT_FLAG;
        }
        true
    }
}

impl fmt::Display for NameElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_display_name(f, &self.bytes)
    }
}

impl fmt::Debug for NameElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameElement({self}, 0x{:02X})", self.extension())
    }
}

/// Writes the display form of a 5-byte name field: the name up to the first
/// pad byte, then `.extension` unless the entry is a directory, has
/// extension 0, or is still undetermined.
pub(crate) fn write_display_name(f: &mut impl fmt::Write, field: &[u8]) -> fmt::Result {
    for &b in field[..NAME_CHARS].iter().take_while(|&&b| b != NAME_PAD) {
        f.write_char(char::from(b))?;
    }
    let extension = field[NAME_CHARS] & EXT_MASK;
    if extension != EXT_DIRECTORY && extension != EXT_UNKNOWN && extension != 0 {
        write!(f, ".{extension}")?;
    }
    Ok(())
}

/// A parsed, normalized path.
///
/// `FsPath` keeps both the elements as written and the elements left after
/// collapsing `.` and `..`; the latter are what is looked up on media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPath {
    verbose: Vec<NameElement>,
    elements: Vec<NameElement>,
}

impl FsPath {
    /// Parses `raw`. Names are case-insensitive and stored uppercase.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for an empty element, a name over four characters, a
    /// non-printable character, an extension that is not a number, is over
    /// 102 or is not on the last element, and for a `..` above the root.
    ///
    /// # Example
    ///
    /// ```rust
    /// use owfs_fs::path::FsPath;
    ///
    /// let path = FsPath::parse("/logs/../data.1").unwrap();
    /// assert_eq!(path.depth(), 1);
    /// assert_eq!(path.name().as_deref(), Some("DATA.1"));
    /// assert!(FsPath::parse("/toolong.1").is_err());
    /// ```
    pub fn parse(raw: &str) -> FsResult<Self> {
        let upper = raw.to_ascii_uppercase();
        let body = upper.strip_prefix(PATH_SEPARATOR).unwrap_or(&upper);
        if body.is_empty() {
            return Ok(Self::root());
        }
        let (body, trailing) = match body.strip_suffix(PATH_SEPARATOR) {
            Some(body) => (body, true),
            None => (body, false),
        };

        let fields: Vec<&str> = body.split(PATH_SEPARATOR).collect();
        let mut verbose = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            if field.is_empty() {
                return Err(FsError::invalid_path(raw, "empty element"));
            }
            let last = index + 1 == fields.len() && !trailing;
            let element =
                NameElement::parse(field, last).map_err(|reason| FsError::invalid_path(raw, reason))?;
            verbose.push(element);
        }

        let mut elements: Vec<NameElement> = Vec::with_capacity(verbose.len());
        for element in &verbose {
            if element.is_parent_dir() {
                if elements.pop().is_none() {
                    return Err(FsError::invalid_path(raw, "'..' above the root directory"));
                }
            } else if !element.is_current_dir() {
                elements.push(*element);
            }
        }

        Ok(Self { verbose, elements })
    }

    /// Returns the path of the root directory.
    pub fn root() -> Self {
        Self {
            verbose: Vec::new(),
            elements: Vec::new(),
        }
    }

    /// Returns true for the root directory.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns the number of normalized elements.
    #[inline]
    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    /// Returns the normalized elements.
    pub fn elements(&self) -> &[NameElement] {
        &self.elements
    }

    /// Returns the normalized elements for type reconciliation.
    pub fn elements_mut(&mut self) -> &mut [NameElement] {
        &mut self.elements
    }

    /// Returns the final element, `None` for the root.
    pub fn last(&self) -> Option<&NameElement> {
        self.elements.last()
    }

    /// Returns the display name of the final element.
    pub fn name(&self) -> Option<String> {
        self.last().map(ToString::to_string)
    }

    /// Returns the display path of the parent directory, `None` for the
    /// root.
    pub fn parent(&self) -> Option<String> {
        let (_, parents) = self.elements.split_last()?;
        Some(join(parents))
    }

    /// Returns the path as written, with `.` and `..` kept.
    pub fn verbose(&self) -> String {
        join(&self.verbose)
    }

    /// Returns the normalized display path.
    pub fn canonical(&self) -> String {
        join(&self.elements)
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verbose())
    }
}

fn join(elements: &[NameElement]) -> String {
    let mut out = String::from(PATH_SEPARATOR);
    for (index, element) in elements.iter().enumerate() {
        if index > 0 {
            out.push(PATH_SEPARATOR);
        }
        out.push_str(&element.to_string());
    }
    out
}
