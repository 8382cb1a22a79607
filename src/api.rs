//! Administrative protocol.
//!
//! One command per connection, one reply, then close. A reply is a list of
//! records separated by `|`; a record is a list of fields separated by `,`;
//! a field is `key=value` split on the first `=`, or a bare value that is
//! addressed by its position. Text values escape `\`, `|`, `,` and `=` with
//! a backslash. Every reply opens with a `STATUS` record.

use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::health::Alive;
use crate::miner::{Miner, MinerError};
use crate::pool_manager::PoolControlError;

pub const API_VERSION: &str = "1.0";
/// Replies longer than this are refused by the client.
pub const MAX_REPLY: usize = 64 * 1024;

const SEPARATOR: char = '|';
const COMMA: char = ',';
const EQ: char = '=';
const ESCAPE: char = '\\';

// Reply codes.
const MSG_POOL: u32 = 7;
const MSG_DEVS: u32 = 9;
const MSG_SUMM: u32 = 11;
const MSG_INVCMD: u32 = 14;
const MSG_MISID: u32 = 15;
const MSG_INVID: u32 = 16;
const MSG_DEVDETAIL: u32 = 17;
const MSG_NUMDEV: u32 = 20;
const MSG_VERSION: u32 = 22;
const MSG_DEVENA: u32 = 24;
const MSG_DEVDIS: u32 = 25;
const MSG_DEVREN: u32 = 26;
const MSG_SWITCHP: u32 = 27;
const MSG_DEVRESTART: u32 = 28;
const MSG_RESTART: u32 = 30;
const MSG_BYE: u32 = 31;
const MSG_POOLENA: u32 = 47;
const MSG_POOLDIS: u32 = 48;
const MSG_DISLASTP: u32 = 49;
const MSG_INVPID: u32 = 50;
const MSG_POOLREN: u32 = 51;
const MSG_DEVREDIS: u32 = 52;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Could not connect to {0}: {1}")]
    Connect(String, std::io::Error),
    #[error("Send failed: {0}")]
    Send(std::io::Error),
    #[error("Recv failed: {0}")]
    Recv(std::io::Error),
    #[error("Reply larger than {MAX_REPLY} bytes")]
    ReplyTooLarge,
    #[error("Timed out talking to {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    fn letter(self) -> char {
        match self {
            Severity::Success => 'S',
            Severity::Info => 'I',
            Severity::Warning => 'W',
            Severity::Error => 'E',
        }
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, ESCAPE | SEPARATOR | COMMA | EQ) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Splits on `sep` where it is not preceded by an escape.
fn split_unescaped(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == sep {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

/// One reply record under construction.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    fields: Vec<String>,
}

impl RecordBuilder {
    /// A record headed by a bare section name, e.g. `SUMMARY`.
    pub fn section(name: &str) -> Self {
        Self {
            fields: vec![escape(name)],
        }
    }

    /// A record headed by `key=id`, e.g. `POOL=0`.
    pub fn numbered(key: &str, id: usize) -> Self {
        Self::default().int(key, id as u64)
    }

    pub fn int(mut self, key: &str, value: u64) -> Self {
        self.fields.push(format!("{}{EQ}{value}", escape(key)));
        self
    }

    pub fn float(mut self, key: &str, value: f64) -> Self {
        self.fields.push(format!("{}{EQ}{value:.2}", escape(key)));
        self
    }

    pub fn text(mut self, key: &str, value: &str) -> Self {
        self.fields.push(format!("{}{EQ}{}", escape(key), escape(value)));
        self
    }

    pub fn flag(self, key: &str, value: bool) -> Self {
        self.text(key, if value { "Y" } else { "N" })
    }

    fn encode(&self) -> String {
        self.fields.join(",")
    }
}

/// A full reply: the `STATUS` record followed by any data records.
#[derive(Debug)]
pub struct Reply {
    records: Vec<String>,
}

impl Reply {
    pub fn new(severity: Severity, code: u32, msg: &str, description: &str) -> Self {
        let status = RecordBuilder::default()
            .text("STATUS", &severity.letter().to_string())
            .int("When", chrono::Utc::now().timestamp().max(0) as u64)
            .int("Code", code as u64)
            .text("Msg", msg)
            .text("Description", description);
        Self {
            records: vec![status.encode()],
        }
    }

    pub fn push(&mut self, record: RecordBuilder) {
        self.records.push(record.encode());
    }

    pub fn with(mut self, record: RecordBuilder) -> Self {
        self.push(record);
        self
    }

    /// Encoded reply; always ends in a record separator.
    pub fn finish(self) -> String {
        let mut out = self.records.join("|");
        out.push(SEPARATOR);
        out
    }
}

/// A parsed record. Bare fields are keyed by their position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub fields: Vec<(String, String)>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The first field's key, with its value appended when the value is
    /// numeric: `SUMMARY`, `POOL0`, `STATUS`.
    pub fn title(&self) -> String {
        match self.fields.first() {
            Some((key, value)) if key.parse::<usize>().is_ok() => value.clone(),
            Some((key, value)) if value.starts_with(|c: char| c.is_ascii_digit()) => format!("{key}{value}"),
            Some((key, _)) => key.clone(),
            None => String::new(),
        }
    }
}

/// Splits a raw reply into records. Empty records (the trailing one in
/// particular) and empty fields are skipped; positions still count them.
pub fn parse_reply(raw: &str) -> Vec<Record> {
    let raw = raw.trim_end_matches('\0');
    split_unescaped(raw, SEPARATOR)
        .into_iter()
        .filter(|rec| !rec.is_empty())
        .map(|rec| {
            let fields = split_unescaped(rec, COMMA)
                .into_iter()
                .enumerate()
                .filter(|(_, f)| !f.is_empty())
                .map(|(i, f)| match split_unescaped(f, EQ).as_slice() {
                    [bare] => (i.to_string(), unescape(bare)),
                    [key, ..] => (unescape(key), unescape(&f[key.len() + 1..])),
                    [] => (i.to_string(), String::new()),
                })
                .collect();
            Record { fields }
        })
        .filter(|r: &Record| !r.fields.is_empty())
        .collect()
}

/// Human-readable breakdown of a reply.
pub fn display(raw: &str) -> String {
    let mut out = String::new();
    for record in parse_reply(raw) {
        let _ = writeln!(out, "[{}] =>\n(", record.title());
        for (key, value) in &record.fields {
            let _ = writeln!(out, "   [{key}] => {value}");
        }
        out.push_str(")\n");
    }
    out
}

fn alive_text(alive: Alive, enabled: bool) -> &'static str {
    if !enabled {
        return "Disabled";
    }
    match alive {
        Alive::Well => "Alive",
        Alive::Sick => "Sick",
        Alive::Dead => "Dead",
        Alive::NoStart => "NoStart",
    }
}

/// Runs one command against the miner and encodes the reply.
pub fn dispatch(miner: &Miner, request: &str) -> String {
    let request = request.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    let (cmd, param) = match request.split_once(SEPARATOR) {
        Some((cmd, param)) => (cmd.trim(), Some(param.trim())),
        None => (request, None),
    };
    tracing::debug!(cmd, ?param, "api command");
    let desc = miner.config().api_description.as_str();
    let ok = |code, msg: &str| Reply::new(Severity::Success, code, msg, desc);
    let err = |code, msg: &str| Reply::new(Severity::Error, code, msg, desc).finish();

    let id = |what: &str| -> Result<usize, String> {
        match param {
            None | Some("") => Err(err(MSG_MISID, &format!("Missing {what} id parameter"))),
            Some(p) => p.parse().map_err(|_| err(MSG_INVID, &format!("Invalid {what} id {p}"))),
        }
    };

    let reply = match cmd {
        "version" => ok(MSG_VERSION, "Hashmill versions").with(
            RecordBuilder::section("VERSION")
                .text("Hashmill", env!("CARGO_PKG_VERSION"))
                .text("API", API_VERSION),
        ),
        "summary" => ok(MSG_SUMM, "Summary").with(summary_record(miner)),
        "devs" => {
            let devices = miner.devices();
            let mut reply = ok(MSG_DEVS, &format!("{} Dev(s)", devices.len()));
            for dev in &devices {
                reply.push(device_record(dev));
            }
            reply
        }
        "dev" => {
            let id = match id("device") {
                Ok(id) => id,
                Err(reply) => return reply,
            };
            match miner.device(id) {
                Ok(dev) => ok(MSG_DEVDETAIL, &format!("Dev {id}")).with(device_record(&dev)),
                Err(_) => return err(MSG_INVID, &format!("Invalid device id {id}")),
            }
        }
        "devcount" => ok(MSG_NUMDEV, "Device count")
            .with(RecordBuilder::section("DEVCOUNT").int("Count", miner.device_count() as u64)),
        "pools" => {
            let pools = miner.pools();
            let mut reply = ok(MSG_POOL, &format!("{} Pool(s)", pools.len()));
            for pool in &pools {
                reply.push(
                    RecordBuilder::numbered("POOL", pool.id)
                        .text("URL", &pool.url)
                        .text("Status", alive_text(pool.alive, pool.enabled))
                        .int("Priority", pool.prio as u64)
                        .int("Getworks", pool.getworks)
                        .int("Accepted", pool.accepted)
                        .int("Rejected", pool.rejected)
                        .int("Discarded", pool.discarded)
                        .int("Stale", pool.stale)
                        .int("Get Failures", pool.get_failures)
                        .int("Remote Failures", pool.remote_failures)
                        .text("User", &pool.user)
                        .int("Last Share Time", pool.last_share.map_or(0, |t| t.timestamp().max(0) as u64))
                        .flag("Idle", pool.idle)
                        .flag("Lagging", pool.lagging)
                        .flag("Probed", pool.probed)
                        .float("LB Weight", pool.lb_weight),
                );
            }
            reply
        }
        "devenable" | "devdisable" | "devrestart" => {
            let id = match id("device") {
                Ok(id) => id,
                Err(reply) => return reply,
            };
            let dev = match miner.device(id) {
                Ok(dev) => dev,
                Err(_) => return err(MSG_INVID, &format!("Invalid device id {id}")),
            };
            let enable = cmd == "devenable";
            if cmd == "devrestart" {
                if let Err(e) = miner.restart_device(id) {
                    return err(MSG_INVID, &e.to_string());
                }
                ok(MSG_DEVRESTART, &format!("Dev {id} restart requested"))
            } else if dev.enabled == enable {
                let (code, state) = if enable { (MSG_DEVREN, "enabled") } else { (MSG_DEVREDIS, "disabled") };
                Reply::new(Severity::Info, code, &format!("Dev {id} already {state}"), desc)
            } else {
                let result = if enable { miner.enable_device(id) } else { miner.disable_device(id) };
                if let Err(e) = result {
                    return err(MSG_INVID, &e.to_string());
                }
                if enable {
                    ok(MSG_DEVENA, &format!("Dev {id} enabled"))
                } else {
                    ok(MSG_DEVDIS, &format!("Dev {id} disabled"))
                }
            }
        }
        "switchpool" | "enablepool" | "disablepool" => {
            let id = match id("pool") {
                Ok(id) => id,
                Err(reply) => return reply,
            };
            let Some(url) = miner.pools().into_iter().find(|p| p.id == id).map(|p| p.url) else {
                return err(MSG_INVPID, &format!("Invalid pool id {id}"));
            };
            let already = miner.pools().iter().any(|p| p.id == id && p.enabled == (cmd == "enablepool"));
            let result = match cmd {
                "switchpool" => miner.switch_pool(id).map(|()| ok(MSG_SWITCHP, &format!("Switching to pool {id}:'{url}'"))),
                "enablepool" if already => Ok(Reply::new(Severity::Info, MSG_POOLREN, &format!("Pool {id}:'{url}' already enabled"), desc)),
                "enablepool" => miner.enable_pool(id).map(|()| ok(MSG_POOLENA, &format!("Enabling pool {id}:'{url}'"))),
                _ => miner.disable_pool(id).map(|()| ok(MSG_POOLDIS, &format!("Disabling pool {id}:'{url}'"))),
            };
            match result {
                Ok(reply) => reply,
                Err(MinerError::Pool(PoolControlError::LastEnabled(_))) => {
                    return err(MSG_DISLASTP, &format!("Cannot disable last active pool {id}:'{url}'"));
                }
                Err(e) => return err(MSG_INVPID, &e.to_string()),
            }
        }
        "restart" => {
            miner.restart_work();
            ok(MSG_RESTART, "Restarting work")
        }
        "quit" => {
            miner.request_quit();
            ok(MSG_BYE, "BYE")
        }
        _ => return err(MSG_INVCMD, "Invalid command"),
    };
    reply.finish()
}

fn summary_record(miner: &Miner) -> RecordBuilder {
    let s = miner.summary();
    RecordBuilder::section("SUMMARY")
        .int("Elapsed", s.elapsed_secs)
        .float("MHS av", s.mhs_av)
        .int("Found Blocks", s.found_blocks)
        .int("Getworks", s.getworks)
        .int("Accepted", s.accepted)
        .int("Rejected", s.rejected)
        .int("Hardware Errors", s.hw_errors)
        .float("Utility", s.utility)
        .int("Discarded", s.discarded)
        .int("Stale", s.stale)
        .int("Get Failures", s.get_failures)
        .int("Local Work", s.local_work)
        .int("Remote Failures", s.remote_failures)
        .int("Network Blocks", s.network_blocks)
        .float("Total MH", s.total_mh)
}

fn device_record(dev: &crate::device::DeviceStatus) -> RecordBuilder {
    RecordBuilder::numbered("DEV", dev.id)
        .text("Name", &dev.name)
        .text("Driver", &dev.driver)
        .flag("Enabled", dev.enabled)
        .text("Status", alive_text(dev.alive, true))
        .int("Threads", dev.threads as u64)
        .float("MHS av", dev.mhs_av)
        .float("MHS 5s", dev.mhs_rolling)
        .int("Accepted", dev.accepted)
        .int("Rejected", dev.rejected)
        .int("Hardware Errors", dev.hw_errors)
        .float("Utility", dev.utility)
        .int("Last Progress", dev.last_progress_secs)
}

/// Sends one command and returns the raw reply.
pub async fn request(host: &str, port: u16, command: &str, timeout: Duration) -> Result<String, ApiError> {
    let target = format!("{host}:{port}");
    let exchange = async {
        let mut stream = TcpStream::connect(&target)
            .await
            .map_err(|e| ApiError::Connect(target.clone(), e))?;
        stream.write_all(command.as_bytes()).await.map_err(ApiError::Send)?;
        stream.shutdown().await.map_err(ApiError::Send)?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_REPLY as u64 + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(ApiError::Recv)?;
        if buf.len() > MAX_REPLY {
            return Err(ApiError::ReplyTooLarge);
        }
        while buf.last() == Some(&0) {
            buf.pop();
        }
        Ok::<_, ApiError>(String::from_utf8_lossy(&buf).into_owned())
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ApiError::Timeout(target.clone()))?
}
