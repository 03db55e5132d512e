//! Per-page cache state.

use std::fmt;

use owfs_common::PageNumber;

/// Cache state of one page.
///
/// A page moves along
/// `NotRead -> ReadWith*Crc -> PendingVerify -> (PendingRedirect | PendingWrite) -> ReadWithCrc`;
/// ordinary banks skip the verify step and go straight to `PendingWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Nothing cached.
    NotRead,
    /// Cached packet with a verified CRC.
    ReadWithCrc,
    /// Raw bytes cached, CRC not verified.
    ReadWithoutCrc,
    /// Dirty write-once page; must be checked against the device before
    /// writing.
    PendingVerify,
    /// Dirty write-once page whose content moved to `to`; the hardware
    /// redirect is still to be issued.
    PendingRedirect {
        /// Replacement page.
        to: PageNumber,
    },
    /// Dirty page ready to be written.
    PendingWrite,
}

impl PageState {
    /// Returns true if the page has unflushed changes.
    #[inline]
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            Self::PendingVerify | Self::PendingRedirect { .. } | Self::PendingWrite
        )
    }

    /// Returns true if the cached bytes hold a usable packet.
    #[inline]
    pub fn holds_packet(self) -> bool {
        !matches!(self, Self::NotRead | Self::ReadWithoutCrc)
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRead => write!(f, "not-read"),
            Self::ReadWithCrc => write!(f, "read-crc"),
            Self::ReadWithoutCrc => write!(f, "read-no-crc"),
            Self::PendingVerify => write!(f, "verify"),
            Self::PendingRedirect { to } => write!(f, "redirect->{to}"),
            Self::PendingWrite => write!(f, "write"),
        }
    }
}

/// Arena slot for one page: its state, its framed bytes and the last known
/// redirect target.
#[derive(Debug, Clone)]
pub(crate) struct PageDescriptor {
    pub state: PageState,
    /// Raw page image; the packet sits at the start.
    pub frame: Vec<u8>,
    /// Payload length of the cached packet.
    pub len: usize,
    /// Known hardware redirect of this page (write-once banks only).
    pub redirect: Option<PageNumber>,
}

impl PageDescriptor {
    pub fn new(page_length: usize) -> Self {
        Self {
            state: PageState::NotRead,
            frame: vec![0; page_length],
            len: 0,
            redirect: None,
        }
    }

    /// A page is served from memory when it holds a packet and no redirect
    /// points elsewhere.
    #[inline]
    pub fn is_cached(&self) -> bool {
        self.state.holds_packet() && self.redirect.is_none()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.frame[1..=self.len]
    }

    /// Redirect target, including one decided during a sync but not yet
    /// issued to the device.
    #[inline]
    pub fn forward(&self) -> Option<PageNumber> {
        match self.state {
            PageState::PendingRedirect { to } => Some(to),
            _ => self.redirect,
        }
    }
}
