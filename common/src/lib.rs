// Copyright 2025 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;
use thiserror::Error;

mod geometry;
mod slot;

pub use geometry::{
    ArrayDefinition, ArrayOpts, Block, MAX_BLOCK_SIZE, MAX_NAME_LEN,
    MAX_SHIFT, MIN_BLOCK_SIZE, MIN_SHIFT,
};
pub use slot::{SlotData, SlotId, MAX_SLOTS, MIN_SLOTS};

/*
 * Errors that can be returned from any I/O path of the array.  Setup and
 * configuration paths use anyhow instead; this enum is for the runtime
 * surface that callers match on.
 */
#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq)]
pub enum DoppelError {
    #[error("array is below its minimum operational mirror count")]
    ArrayFailed,

    #[error("array is not accepting I/O: {0}")]
    ArrayInactive(String),

    #[error("block size of request does not match array block size")]
    BlockSizeMismatch,

    #[error("data buffer length is not a whole number of blocks")]
    DataLenUnaligned,

    #[error("offset past end of array")]
    OffsetInvalid,

    #[error("no such slot: {0}")]
    InvalidSlot(u8),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for DoppelError {
    fn from(e: std::io::Error) -> Self {
        DoppelError::IoError(e.to_string())
    }
}

#[macro_export]
macro_rules! doppel_bail {
    ($i:ident) => { return Err($crate::DoppelError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::DoppelError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::DoppelError::$i(format!($fmt, $($arg)*)))
    };
}

/**
 * Build a root logger.  Readable terminal output when stdout is a tty,
 * bunyan JSON otherwise, both behind an async drain that blocks rather
 * than drops on overflow.
 */
pub fn build_logger() -> Logger {
    let drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse()
    } else {
        let drain =
            slog_bunyan::with_name("doppel", std::io::stdout()).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse()
    };

    Logger::root(drain, o!())
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_json_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

/// Like `read_json`, but a missing file is `None` rather than an error.
pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(Some(
        serde_json::from_slice(buf.as_slice())
            .with_context(|| anyhow!("parse {:?}", file))?,
    ))
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let parent = file
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {:?}", file))?;
    let mut tmpf = NamedTempFile::new_in(parent)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}
