use std::fmt;

/// Identifier of a source file registered with the module being compiled.
///
/// The id is an index into the file-name table held by [`crate::Module`];
/// the core never stores file names itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileId(pub u16);

/// A (file, line) position in source code.
///
/// Lines are 1-based to match what editors display. Positions are attached
/// to every emitted instruction and survive packing in the debug table, so
/// backtraces and compile errors can point back at source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourcePos {
    pub file: FileId,
    pub line: u32,
}

impl SourcePos {
    #[must_use]
    pub fn new(file: FileId, line: u32) -> Self {
        Self { file, line }
    }

    /// Position used for synthetic instructions that have no source form
    /// (e.g. the implicit return appended by the builder).
    #[must_use]
    pub fn synthetic() -> Self {
        Self {
            file: FileId(0),
            line: 0,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}:{}", self.file.0, self.line)
    }
}
