//! Command line parsing

use crate::error::ProtocolError;
use crate::protocol::verb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Download { filename: String },
    Upload { filename: String, size: u64 },
    Exit,
    Unknown { raw: String },
}

impl Command {
    /// Parse one command line (terminator already removed).
    ///
    /// Verbs are case sensitive. `DOWNLOAD` takes everything after the first
    /// space as the filename, so names may contain spaces; `UPLOAD` splits on
    /// whitespace and ignores anything after the size. The size token must
    /// be all digits: `10abc` is rejected rather than read as `10`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line == verb::LIST {
            return Ok(Command::List);
        }
        if line == verb::EXIT {
            return Ok(Command::Exit);
        }
        if let Some(filename) = strip_verb(line, verb::DOWNLOAD) {
            return Ok(Command::Download {
                filename: filename.to_string(),
            });
        }
        if let Some(args) = strip_verb(line, verb::UPLOAD) {
            return parse_upload(line, args);
        }
        Ok(Command::Unknown {
            raw: line.to_string(),
        })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::List => verb::LIST,
            Command::Download { .. } => verb::DOWNLOAD,
            Command::Upload { .. } => verb::UPLOAD,
            Command::Exit => verb::EXIT,
            Command::Unknown { .. } => "UNKNOWN",
        }
    }
}

fn strip_verb<'a>(line: &'a str, verb: &str) -> Option<&'a str> {
    line.strip_prefix(verb)?.strip_prefix(' ')
}

fn parse_upload(line: &str, args: &str) -> Result<Command, ProtocolError> {
    let bad = || ProtocolError::UploadHeader {
        raw: line.to_string(),
    };
    let mut parts = args.split_whitespace();
    let filename = parts.next().ok_or_else(bad)?;
    let size: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(bad)?;
    if size == 0 {
        return Err(bad());
    }
    Ok(Command::Upload {
        filename: filename.to_string(),
        size,
    })
}
