//! Command dispatcher.
//!
//! Routes decoded commands to their handlers. Every command goes through the
//! same steps: unknown names are rejected, then the authentication gate
//! (AUTH and QUIT are exempt), then the arity check, and only then does the
//! handler touch the session or the storage engine.
//!
//! Error replies are reproduced byte for byte the way Redis clients expect
//! them. Storage failures are logged here and reach the client only as
//! `ERR Internal Error`.

use crate::auth::{AuthError, CredentialService};
use crate::protocols::resp::{Command, Frame};
use crate::session::Session;
use crate::storage::{Expiry, SetOutcome, Storage, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Default SCAN page size
const DEFAULT_SCAN_COUNT: usize = 10;

const CLUSTER_SECTION: &str = "# Cluster\r\ncluster_enabled:0\r\n";
const KEYSPACE_SECTION: &str = "# Keyspace\r\ndb0:keys=0,expires=0,avg_ttl=0\r\n";

/// Handler outcome for one command
#[derive(Debug)]
pub struct Reply {
    pub frame: Frame,
    /// Close the connection once `frame` is written
    pub close: bool,
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Self {
        Reply { frame, close: false }
    }
}

/// Failures a handler reports to the client. The display text is the wire
/// error message.
#[derive(Debug, Error)]
enum CommandError {
    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR invalid key encoding")]
    KeyEncoding,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR DB index is out of range")]
    DbIndex,

    #[error("ERR invalid expire time in '{0}' command")]
    ExpireTime(String),

    #[error("ERR Client sent AUTH, but no password is set")]
    AuthDisabled,

    #[error("ERR invalid password")]
    InvalidPassword,

    #[error("ERR Internal Error")]
    Auth(#[source] AuthError),

    #[error("ERR Internal Error")]
    Storage(#[from] StorageError),
}

type CommandResult = Result<Frame, CommandError>;

/// Supported commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Ping,
    Quit,
    Auth,
    DbSize,
    Select,
    Info,
    Command,
    Set,
    Get,
    MGet,
    Type,
    Del,
    Expire,
    PExpire,
    Ttl,
    PTtl,
    Keys,
    Scan,
}

impl Op {
    fn parse(name: &str) -> Option<Op> {
        Some(match name {
            "ping" => Op::Ping,
            "quit" => Op::Quit,
            "auth" => Op::Auth,
            "dbsize" => Op::DbSize,
            "select" => Op::Select,
            "info" => Op::Info,
            "command" => Op::Command,
            "set" => Op::Set,
            "get" => Op::Get,
            "mget" => Op::MGet,
            "type" => Op::Type,
            "del" => Op::Del,
            "expire" => Op::Expire,
            "pexpire" => Op::PExpire,
            "ttl" => Op::Ttl,
            "pttl" => Op::PTtl,
            "keys" => Op::Keys,
            "scan" => Op::Scan,
            _ => return None,
        })
    }

    /// Accepted word counts, command name included
    fn accepts(self, argc: usize) -> bool {
        match self {
            Op::Ping | Op::Info => matches!(argc, 1 | 2),
            Op::Quit | Op::DbSize => argc == 1,
            Op::Command => argc >= 1,
            Op::Auth | Op::Select | Op::Get | Op::Type | Op::Ttl | Op::PTtl | Op::Keys => argc == 2,
            Op::Set => argc >= 3,
            Op::MGet | Op::Del => argc >= 2,
            Op::Expire | Op::PExpire => argc == 3,
            Op::Scan => matches!(argc, 2 | 4 | 6),
        }
    }

    /// Allowed before the session authenticates
    fn is_exempt(self) -> bool {
        matches!(self, Op::Auth | Op::Quit)
    }
}

/// Routes commands from every connection to the shared storage engine.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    /// Present exactly when multi-tenant authentication is enabled
    credentials: Option<Arc<CredentialService>>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn Storage>, credentials: Option<Arc<CredentialService>>) -> Self {
        Self {
            storage,
            credentials,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fresh state for a newly accepted connection
    pub fn new_session(&self) -> Session {
        Session::new(self.auth_enabled())
    }

    /// Execute one command on behalf of `session`.
    pub async fn dispatch(&self, session: &mut Session, cmd: Command) -> Reply {
        let Some(op) = Op::parse(&cmd.name()) else {
            return Frame::error(format!("ERR unknown command '{}'", cmd.raw_name())).into();
        };

        if !op.is_exempt() && !session.is_authorized() {
            return Frame::error("NOAUTH Authentication required.").into();
        }

        if !op.accepts(cmd.argc()) {
            return Frame::error(format!(
                "ERR wrong number of arguments for '{}' command",
                cmd.raw_name()
            ))
            .into();
        }

        let result = match op {
            Op::Quit => {
                return Reply {
                    frame: Frame::simple("OK"),
                    close: true,
                }
            }
            Op::Ping => Ok(ping(&cmd)),
            Op::Auth => self.auth(session, &cmd).await,
            Op::DbSize => Ok(Frame::integer(1)),
            Op::Select => select(&cmd),
            Op::Info => Ok(info(&cmd)),
            Op::Command => Ok(Frame::array(vec![])),
            Op::Set => self.set(session, &cmd).await,
            Op::Get => self.get(session, &cmd).await,
            Op::MGet => self.mget(session, &cmd).await,
            Op::Type => self.key_type(session, &cmd).await,
            Op::Del => self.del(session, &cmd).await,
            Op::Expire => self.expire(session, &cmd, 1000).await,
            Op::PExpire => self.expire(session, &cmd, 1).await,
            Op::Ttl => self.ttl(session, &cmd, false).await,
            Op::PTtl => self.ttl(session, &cmd, true).await,
            Op::Keys => self.keys(session, &cmd).await,
            Op::Scan => self.scan(session, &cmd).await,
        };

        match result {
            Ok(frame) => frame.into(),
            Err(e) => {
                match &e {
                    CommandError::Storage(err) => error!(
                        command = %cmd.name(),
                        user = session.user(),
                        error = %err,
                        "Storage failure"
                    ),
                    CommandError::Auth(err) => {
                        error!(command = %cmd.name(), error = %err, "Credential service failure")
                    }
                    _ => {}
                }
                Frame::error(e.to_string()).into()
            }
        }
    }

    async fn auth(&self, session: &mut Session, cmd: &Command) -> CommandResult {
        let Some(credentials) = &self.credentials else {
            return Err(CommandError::AuthDisabled);
        };

        session.logout();

        let pair = std::str::from_utf8(word(cmd, 1)).map_err(|_| CommandError::InvalidPassword)?;
        let (user, password) = pair.split_once(':').ok_or(CommandError::InvalidPassword)?;

        match credentials.validate(user, password).await {
            Ok(()) => {
                session.login(user);
                debug!(user, "Session authenticated");
                Ok(Frame::simple("OK"))
            }
            Err(AuthError::InvalidCredentials) => Err(CommandError::InvalidPassword),
            Err(e) => Err(CommandError::Auth(e)),
        }
    }

    async fn set(&self, session: &Session, cmd: &Command) -> CommandResult {
        let key = key(session, cmd, 1)?;
        let value = cmd.arg(2).cloned().unwrap_or_default();

        Ok(match self.storage.set_forward(&key, value, cmd.args_from(3)).await? {
            SetOutcome::Stored => Frame::simple("OK"),
            SetOutcome::NotStored => Frame::null(),
            SetOutcome::Value(previous) => Frame::Bulk(previous),
        })
    }

    async fn get(&self, session: &Session, cmd: &Command) -> CommandResult {
        let key = key(session, cmd, 1)?;
        Ok(Frame::Bulk(self.storage.get(&key).await?))
    }

    async fn mget(&self, session: &Session, cmd: &Command) -> CommandResult {
        let keys = all_keys(session, cmd)?;
        let values = self.storage.get_many(&keys).await?;
        Ok(Frame::array(values.into_iter().map(Frame::Bulk).collect()))
    }

    async fn key_type(&self, session: &Session, cmd: &Command) -> CommandResult {
        let key = key(session, cmd, 1)?;
        Ok(Frame::simple(self.storage.key_type(&key).await?))
    }

    async fn del(&self, session: &Session, cmd: &Command) -> CommandResult {
        let keys = all_keys(session, cmd)?;
        let removed = self.storage.del_many(&keys).await?;
        Ok(Frame::integer(i64::try_from(removed).unwrap_or(i64::MAX)))
    }

    /// EXPIRE / PEXPIRE; `unit_ms` is the length of one unit in milliseconds
    async fn expire(&self, session: &Session, cmd: &Command, unit_ms: i64) -> CommandResult {
        let key = key(session, cmd, 1)?;
        let amount = integer(word(cmd, 2))?;

        // A deadline in the past expires the key right away
        let millis = amount
            .max(0)
            .checked_mul(unit_ms)
            .ok_or_else(|| CommandError::ExpireTime(cmd.name()))?;

        let applied = self
            .storage
            .set_expiry(&key, Duration::from_millis(millis as u64))
            .await?;
        Ok(Frame::integer(i64::from(applied)))
    }

    async fn ttl(&self, session: &Session, cmd: &Command, millis: bool) -> CommandResult {
        let key = key(session, cmd, 1)?;
        let reply = match self.storage.expiry(&key).await? {
            Expiry::Absent => -2,
            Expiry::Persistent => -1,
            Expiry::Expires(left) if millis => i64::try_from(left.as_millis()).unwrap_or(i64::MAX),
            Expiry::Expires(left) => i64::try_from(left.as_secs()).unwrap_or(i64::MAX),
        };
        Ok(Frame::integer(reply))
    }

    async fn keys(&self, session: &Session, cmd: &Command) -> CommandResult {
        let pattern = session.namespaced_pattern(utf8(word(cmd, 1))?);
        let keys = self.storage.keys(&pattern).await?;
        Ok(client_keys(session, &keys))
    }

    async fn scan(&self, session: &Session, cmd: &Command) -> CommandResult {
        let cursor = std::str::from_utf8(word(cmd, 1))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(CommandError::NotInteger)?;

        let mut glob = "";
        let mut count = DEFAULT_SCAN_COUNT;
        for pair in cmd.args_from(2).chunks(2) {
            let [option, value] = pair else {
                return Err(CommandError::Syntax);
            };
            match option.to_ascii_lowercase().as_slice() {
                b"match" => glob = utf8(value)?,
                b"count" => {
                    count = usize::try_from(integer(value)?)
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or(CommandError::Syntax)?;
                }
                _ => return Err(CommandError::Syntax),
            }
        }

        let pattern = session.namespaced_pattern(glob);
        let (next, keys) = self.storage.scan(cursor, &pattern, count).await?;
        Ok(Frame::array(vec![
            Frame::bulk(next.to_string()),
            client_keys(session, &keys),
        ]))
    }
}

fn ping(cmd: &Command) -> Frame {
    match cmd.arg(1) {
        Some(message) => Frame::Bulk(Some(message.clone())),
        None => Frame::simple("PONG"),
    }
}

fn select(cmd: &Command) -> CommandResult {
    match integer(word(cmd, 1))? {
        0 => Ok(Frame::simple("OK")),
        _ => Err(CommandError::DbIndex),
    }
}

fn info(cmd: &Command) -> Frame {
    let section = cmd.arg(1).map(|s| String::from_utf8_lossy(s).to_lowercase());
    let text = match section.as_deref() {
        None | Some("default" | "all" | "everything") => {
            format!("{CLUSTER_SECTION}\r\n{KEYSPACE_SECTION}")
        }
        Some("cluster") => CLUSTER_SECTION.to_string(),
        Some("keyspace") => KEYSPACE_SECTION.to_string(),
        Some(_) => String::new(),
    };
    Frame::bulk(text)
}

/// Word `index` of `cmd`, empty if missing
fn word(cmd: &Command, index: usize) -> &[u8] {
    cmd.arg(index).map_or(&[][..], |b| &b[..])
}

fn utf8(raw: &[u8]) -> Result<&str, CommandError> {
    std::str::from_utf8(raw).map_err(|_| CommandError::KeyEncoding)
}

fn integer(raw: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

/// Storage key for word `index`
fn key(session: &Session, cmd: &Command, index: usize) -> Result<String, CommandError> {
    Ok(session.namespaced(utf8(word(cmd, index))?))
}

/// Storage keys for every word after the command name
fn all_keys(session: &Session, cmd: &Command) -> Result<Vec<String>, CommandError> {
    cmd.args_from(1)
        .iter()
        .map(|raw| Ok(session.namespaced(utf8(raw)?)))
        .collect()
}

/// Array of keys as the client named them
fn client_keys(session: &Session, keys: &[String]) -> Frame {
    Frame::array(
        keys.iter()
            .map(|k| Frame::bulk(Bytes::copy_from_slice(session.strip(k).as_bytes())))
            .collect(),
    )
}
