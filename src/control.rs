//! Control-plane commands
//!
//! Administrative requests arrive as one line of text: a verb followed by
//! `key=value` options.
//!
//! ```text
//! create name=disk0 size=1000 blocksize=512 threads=2 backing=mem0 [lun=3] [depth=4]
//! destroy lun=3 [timeout_ms=500]
//! status lun=3
//! list
//! ```

use crate::backend::PassthroughBackend;
use crate::error::{BackendError, BackendResult};
use crate::lun::{LunId, LunParams, LunStatus};
use std::fmt;
use std::time::Duration;

/// A parsed control-plane request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Create(LunParams),
    Destroy {
        lun: LunId,
        timeout: Option<Duration>,
    },
    Status(LunId),
    List,
}

/// Reply to a successfully executed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Created(LunStatus),
    Destroyed(LunId),
    Status(LunStatus),
    List(Vec<LunStatus>),
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlReply::Created(status) => write!(f, "created {}", status),
            ControlReply::Destroyed(lun) => write!(f, "destroyed lun={}", lun),
            ControlReply::Status(status) => write!(f, "{}", status),
            ControlReply::List(luns) if luns.is_empty() => write!(f, "no LUNs"),
            ControlReply::List(luns) => {
                for (i, status) in luns.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", status)?;
                }
                Ok(())
            }
        }
    }
}

/// Split option words into `key=value` pairs
pub fn parse_options<'a>(words: impl Iterator<Item = &'a str>) -> BackendResult<Vec<(String, String)>> {
    let mut options = Vec::new();
    for word in words {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| BackendError::Control(format!("expected key=value, got '{}'", word)))?;
        if key.is_empty() {
            return Err(BackendError::Control(format!("empty option name in '{}'", word)));
        }
        options.push((key.to_ascii_lowercase(), value.to_string()));
    }
    Ok(options)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> BackendResult<T> {
    value
        .parse()
        .map_err(|_| BackendError::Control(format!("invalid value for {}: '{}'", key, value)))
}

fn required_lun(options: &[(String, String)]) -> BackendResult<LunId> {
    let (key, value) = options
        .iter()
        .find(|(key, _)| key == "lun")
        .ok_or_else(|| BackendError::Control("missing lun=<number>".to_string()))?;
    parse_num(key, value).map(LunId)
}

impl ControlCommand {
    /// Parse one request line
    pub fn parse(line: &str) -> BackendResult<Self> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| BackendError::Control("empty command".to_string()))?
            .to_ascii_lowercase();
        let options = parse_options(words)?;

        match verb.as_str() {
            "create" => Self::parse_create(&options),
            "destroy" | "remove" => {
                let lun = required_lun(&options)?;
                let mut timeout = None;
                for (key, value) in &options {
                    match key.as_str() {
                        "lun" => {}
                        "timeout_ms" => {
                            timeout = Some(Duration::from_millis(parse_num(key, value)?))
                        }
                        _ => {
                            return Err(BackendError::Control(format!(
                                "unknown destroy option '{}'",
                                key
                            )))
                        }
                    }
                }
                Ok(ControlCommand::Destroy { lun, timeout })
            }
            "status" => Ok(ControlCommand::Status(required_lun(&options)?)),
            "list" => Ok(ControlCommand::List),
            other => Err(BackendError::Control(format!("unknown command '{}'", other))),
        }
    }

    fn parse_create(options: &[(String, String)]) -> BackendResult<Self> {
        let mut builder = LunParams::builder();
        for (key, value) in options {
            builder = match key.as_str() {
                "lun" => builder.id(parse_num(key, value)?),
                "name" => builder.name(value),
                "size" => builder.size_blocks(parse_num(key, value)?),
                "blocksize" => builder.block_size(parse_num(key, value)?),
                "threads" => builder.threads(parse_num(key, value)?),
                "depth" => builder.queue_depth(parse_num(key, value)?),
                "backing" => builder.backing_id(value),
                _ => {
                    return Err(BackendError::Control(format!(
                        "unknown create option '{}'",
                        key
                    )))
                }
            };
        }
        Ok(ControlCommand::Create(builder.build()?))
    }

    /// Run the request against a backend
    pub fn execute(&self, backend: &PassthroughBackend) -> BackendResult<ControlReply> {
        match self {
            ControlCommand::Create(params) => {
                let lun = backend.create_lun(params.clone())?;
                Ok(ControlReply::Created(lun.status()))
            }
            ControlCommand::Destroy { lun, timeout } => {
                backend.destroy_lun(*lun, *timeout)?;
                Ok(ControlReply::Destroyed(*lun))
            }
            ControlCommand::Status(lun) => backend
                .lun_status(*lun)
                .map(ControlReply::Status)
                .ok_or(BackendError::UnknownLun(*lun)),
            ControlCommand::List => Ok(ControlReply::List(backend.list_luns())),
        }
    }
}
