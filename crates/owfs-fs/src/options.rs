//! Create options.

/// Options for [`FileDescriptor::create`](crate::FileDescriptor::create).
///
/// # Example
///
/// ```rust
/// use owfs_fs::CreateOptions;
///
/// let options = CreateOptions::new().directory(true).make_parents(true);
/// assert!(options.is_directory());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Keep the contents of an existing file and write after them.
    pub(crate) append: bool,
    /// Create a directory instead of a file.
    pub(crate) directory: bool,
    /// Create missing parent directories.
    pub(crate) make_parents: bool,
}

impl CreateOptions {
    /// Creates options for a plain file that truncates existing contents.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets append mode. Ignored for directories.
    #[must_use]
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Sets whether a directory is created.
    #[must_use]
    pub fn directory(mut self, directory: bool) -> Self {
        self.directory = directory;
        self
    }

    /// Sets whether missing parent directories are created.
    #[must_use]
    pub fn make_parents(mut self, make_parents: bool) -> Self {
        self.make_parents = make_parents;
        self
    }

    /// Returns true in append mode.
    pub fn is_append(&self) -> bool {
        self.append
    }

    /// Returns true when creating a directory.
    pub fn is_directory(&self) -> bool {
        self.directory
    }

    /// Returns true when parents are created.
    pub fn is_make_parents(&self) -> bool {
        self.make_parents
    }
}
