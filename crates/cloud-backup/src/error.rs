use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or incomplete configuration; fatal before any path is processed.
    Config,
    /// A required external program is not installed.
    ToolMissing,
    /// Building the archive for one path failed.
    Archive,
    /// Talking to a remote target failed.
    Transfer,
    /// The state ledger could not be written.
    Ledger,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn tool_missing<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ToolMissing, msg)
    }

    pub fn archive<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Archive, msg)
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transfer, msg)
    }

    pub fn ledger<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Ledger, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Per-path failures are recoverable; everything else stops the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind, ErrorKind::Archive | ErrorKind::Transfer)
    }

    /// Re-tags an error raised by a shared helper with the caller's category.
    pub fn into_kind(self, kind: ErrorKind) -> Self {
        Self { kind, ..self }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
